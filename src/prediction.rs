//! 推論サービス
//!
//! 入力の検証と前処理、単一モデルでの推論、
//! アーキテクチャごとの最良モデルによる推論と一致判定を行います。
//! モデルの実体は `DigitPredictor` / `ModelLoader` を通して扱います。

use image::DynamicImage;
use serde::Serialize;
use std::cmp::Ordering;
use std::path::Path;
use tracing::{debug, warn};

use crate::architecture::Architecture;
use crate::error::{LabError, Result};
use crate::history::RunRecord;
use crate::preprocess::{decode_image, mean_intensity, preprocess, preprocess_canvas, DigitImage};

/// 分類クラス数
pub const NUM_CLASSES: usize = 10;

/// 推論への入力
#[derive(Debug, Clone)]
pub enum InputImage {
    /// アップロードされた画像ファイル（黒地に白の数字を想定）
    Upload(Vec<u8>),
    /// 手書きキャンバス（白地に黒）
    Canvas(Vec<u8>),
}

impl InputImage {
    pub fn bytes(&self) -> &[u8] {
        match self {
            InputImage::Upload(bytes) | InputImage::Canvas(bytes) => bytes,
        }
    }

    pub fn is_canvas(&self) -> bool {
        matches!(self, InputImage::Canvas(_))
    }
}

/// 検証・前処理済みの入力
#[derive(Debug, Clone)]
pub struct PreparedInput {
    pub original: DynamicImage,
    pub digit: DigitImage,
}

/// 入力を検証して前処理する
///
/// 未入力・画像以外・空白キャンバスは `InputValidation` を返し、モデルは呼ばない。
pub fn prepare_input(input: Option<&InputImage>, blank_threshold: f64) -> Result<PreparedInput> {
    let input = match input {
        Some(input) if !input.bytes().is_empty() => input,
        _ => {
            return Err(LabError::validation(
                "画像をアップロードするか、キャンバスに数字を描いてください",
            ))
        }
    };

    let original = decode_image(input.bytes())
        .map_err(|e| LabError::validation(format!("画像ファイルとして読み込めません: {}", e)))?;

    let digit = if input.is_canvas() {
        let mean = mean_intensity(&original);
        debug!(mean, blank_threshold, "キャンバスの平均輝度");
        if mean > blank_threshold {
            return Err(LabError::validation(
                "キャンバスが空白です。数字を描いてから推論してください",
            ));
        }
        preprocess_canvas(&original)?
    } else {
        preprocess(&original)?
    };

    Ok(PreparedInput { original, digit })
}

/// 学習済みモデル（推論のみ）
pub trait DigitPredictor {
    /// 10クラスの確率（合計1）を返す
    fn predict_probabilities(&self, image: &DigitImage) -> Result<Vec<f32>>;
}

/// モデルファイルから `DigitPredictor` を組み立てる
pub trait ModelLoader {
    fn load(&self, architecture: Architecture, path: &Path) -> Result<Box<dyn DigitPredictor>>;
}

/// 1モデルの推論結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub digit: u8,
    /// 予測クラスの確率（百分率）
    pub confidence: f64,
    pub probabilities: Vec<f32>,
}

impl Prediction {
    pub fn from_probabilities(probabilities: Vec<f32>) -> Result<Self> {
        if probabilities.len() != NUM_CLASSES {
            return Err(LabError::prediction(
                "model",
                format!("出力の次元が不正です: {} (期待: {})", probabilities.len(), NUM_CLASSES),
            ));
        }

        let (digit, best) = probabilities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
            .map(|(i, &p)| (i as u8, p))
            .ok_or_else(|| LabError::prediction("model", "出力が空です"))?;

        Ok(Self {
            digit,
            confidence: best as f64 * 100.0,
            probabilities,
        })
    }

    /// 確率上位 k 件（数字, 百分率）
    pub fn top_k(&self, k: usize) -> Vec<(u8, f64)> {
        let mut ranked: Vec<(u8, f64)> = self
            .probabilities
            .iter()
            .enumerate()
            .map(|(i, &p)| (i as u8, p as f64 * 100.0))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        ranked.truncate(k);
        ranked
    }

    pub fn summary(&self) -> String {
        format!("Predicted Digit: {}\nConfidence: {:.2}%", self.digit, self.confidence)
    }
}

/// 単一モデルで推論
pub fn predict_single(predictor: &dyn DigitPredictor, image: &DigitImage) -> Result<Prediction> {
    Prediction::from_probabilities(predictor.predict_probabilities(image)?)
}

/// 複数モデル推論の1行
#[derive(Debug, Clone, Serialize)]
pub struct ModelPrediction {
    pub architecture: Architecture,
    pub run_id: i64,
    /// 学習時の検証精度（0-1）
    pub val_accuracy: f64,
    /// 失敗した場合はエラーメッセージ
    pub outcome: std::result::Result<Prediction, String>,
}

impl ModelPrediction {
    pub fn prediction(&self) -> Option<&Prediction> {
        self.outcome.as_ref().ok()
    }
}

/// 複数モデルの一致判定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Consensus {
    /// 2モデル以上が成功し、すべて同じ数字
    Agree(u8),
    /// 2モデル以上が成功し、異なる数字を含む
    Disagree,
    /// 成功したモデルが2未満
    Unavailable,
}

impl Consensus {
    pub fn from_rows(rows: &[ModelPrediction]) -> Self {
        let digits: Vec<u8> = rows
            .iter()
            .filter_map(|row| row.prediction().map(|p| p.digit))
            .collect();

        match digits.split_first() {
            Some((first, rest)) if !rest.is_empty() => {
                if rest.iter().all(|d| d == first) {
                    Consensus::Agree(*first)
                } else {
                    Consensus::Disagree
                }
            }
            _ => Consensus::Unavailable,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Consensus::Agree(digit) => format!("全モデルが {} と予測しました", digit),
            Consensus::Disagree => "モデル間で予測が分かれました".to_string(),
            Consensus::Unavailable => "一致判定には2つ以上のモデルが必要です".to_string(),
        }
    }
}

/// 信頼度の高い順、失敗行は末尾
pub fn rank_predictions(rows: &mut [ModelPrediction]) {
    rows.sort_by(|a, b| match (a.prediction(), b.prediction()) {
        (Some(pa), Some(pb)) => pb.confidence.partial_cmp(&pa.confidence).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// 各アーキテクチャの最良モデルで推論
///
/// モデルごとの読み込み・推論の失敗はその行のエラーとして記録し、他のモデルは続行する。
pub fn predict_with_models(
    candidates: &[(Architecture, RunRecord)],
    artifacts_dir: &Path,
    loader: &dyn ModelLoader,
    image: &DigitImage,
) -> Vec<ModelPrediction> {
    let mut rows: Vec<ModelPrediction> = candidates
        .iter()
        .map(|(architecture, run)| {
            let path = run.artifact_path(artifacts_dir);
            let outcome = loader
                .load(*architecture, &path)
                .and_then(|predictor| predict_single(predictor.as_ref(), image))
                .map_err(|e| {
                    let err = LabError::prediction(architecture.name(), e.to_string());
                    warn!(architecture = %architecture, run_id = run.run_id, error = %e, "推論に失敗しました");
                    err.to_string()
                });

            ModelPrediction {
                architecture: *architecture,
                run_id: run.run_id,
                val_accuracy: run.val_accuracy,
                outcome,
            }
        })
        .collect();

    rank_predictions(&mut rows);
    rows
}

/// 推論結果の表をテキストで整形
pub fn format_prediction_table(rows: &[ModelPrediction], top_k: usize) -> String {
    let mut out = format!("{:<12} {:>5} {:>6} {:>11}  {}\n", "Model", "Run", "Digit", "Confidence", "Top");
    for row in rows {
        match &row.outcome {
            Ok(prediction) => {
                let top = prediction
                    .top_k(top_k)
                    .iter()
                    .map(|(digit, percent)| format!("{}:{:.1}%", digit, percent))
                    .collect::<Vec<_>>()
                    .join(" ");
                out.push_str(&format!(
                    "{:<12} {:>5} {:>6} {:>10.2}%  {}\n",
                    row.architecture.name(),
                    row.run_id,
                    prediction.digit,
                    prediction.confidence,
                    top
                ));
            }
            Err(message) => {
                out.push_str(&format!(
                    "{:<12} {:>5} {:>6} {:>11}  {}\n",
                    row.architecture.name(),
                    row.run_id,
                    "-",
                    "-",
                    message
                ));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn one_hot(digit: usize, confidence: f32) -> Vec<f32> {
        let rest = (1.0 - confidence) / 9.0;
        (0..NUM_CLASSES)
            .map(|i| if i == digit { confidence } else { rest })
            .collect()
    }

    struct FixedPredictor(Vec<f32>);

    impl DigitPredictor for FixedPredictor {
        fn predict_probabilities(&self, _image: &DigitImage) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    /// アーキテクチャごとに決まった結果を返すローダー
    struct ScriptedLoader {
        outputs: Vec<(Architecture, Option<Vec<f32>>)>,
    }

    impl ModelLoader for ScriptedLoader {
        fn load(&self, architecture: Architecture, path: &Path) -> Result<Box<dyn DigitPredictor>> {
            let output = self
                .outputs
                .iter()
                .find(|(arch, _)| *arch == architecture)
                .and_then(|(_, output)| output.clone());
            match output {
                Some(probabilities) => Ok(Box::new(FixedPredictor(probabilities))),
                None => Err(LabError::artifact(path, "ファイルが存在しません")),
            }
        }
    }

    fn run(architecture: Architecture, run_id: i64) -> RunRecord {
        RunRecord {
            run_id,
            architecture: architecture.name().to_string(),
            epochs: 3,
            batch_size: 32,
            val_accuracy: 0.95,
            model_filename: architecture.artifact_filename(run_id),
            duration: Some(10.0),
            created_at: String::new(),
        }
    }

    fn predict(outputs: Vec<(Architecture, Option<Vec<f32>>)>) -> Vec<ModelPrediction> {
        let candidates: Vec<(Architecture, RunRecord)> = outputs
            .iter()
            .enumerate()
            .map(|(i, (arch, _))| (*arch, run(*arch, i as i64 + 1)))
            .collect();
        let loader = ScriptedLoader { outputs };
        let image = DigitImage::from_pixels(vec![0.0; 784]).unwrap();
        predict_with_models(&candidates, Path::new("artifacts"), &loader, &image)
    }

    fn png(image: RgbImage) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_prediction_from_probabilities() {
        let prediction = Prediction::from_probabilities(one_hot(7, 0.9)).unwrap();
        assert_eq!(prediction.digit, 7);
        assert!((prediction.confidence - 90.0).abs() < 1e-3);
        assert!(prediction.summary().starts_with("Predicted Digit: 7\nConfidence: 90.00%"));

        let top = prediction.top_k(5);
        assert_eq!(top.len(), 5);
        assert_eq!(top[0].0, 7);

        assert!(Prediction::from_probabilities(vec![1.0]).is_err());
    }

    #[test]
    fn test_all_models_agree() {
        let rows = predict(vec![
            (Architecture::Mlp, Some(one_hot(3, 0.8))),
            (Architecture::SmallCnn, Some(one_hot(3, 0.9))),
            (Architecture::DeeperCnn, Some(one_hot(3, 0.99))),
        ]);
        assert_eq!(Consensus::from_rows(&rows), Consensus::Agree(3));
        // 信頼度の高い順
        assert_eq!(rows[0].architecture, Architecture::DeeperCnn);
        assert_eq!(rows[2].architecture, Architecture::Mlp);
    }

    #[test]
    fn test_models_disagree() {
        let rows = predict(vec![
            (Architecture::Mlp, Some(one_hot(3, 0.8))),
            (Architecture::SmallCnn, Some(one_hot(3, 0.9))),
            (Architecture::DeeperCnn, Some(one_hot(8, 0.7))),
        ]);
        assert_eq!(Consensus::from_rows(&rows), Consensus::Disagree);
    }

    #[test]
    fn test_single_model_has_no_consensus() {
        let rows = predict(vec![(Architecture::Mlp, Some(one_hot(3, 0.8)))]);
        assert_eq!(Consensus::from_rows(&rows), Consensus::Unavailable);
        assert_eq!(Consensus::from_rows(&[]), Consensus::Unavailable);
    }

    #[test]
    fn test_load_failure_is_isolated_to_its_row() {
        let rows = predict(vec![
            (Architecture::Mlp, None),
            (Architecture::SmallCnn, Some(one_hot(5, 0.6))),
            (Architecture::DeeperCnn, Some(one_hot(5, 0.95))),
        ]);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].architecture, Architecture::DeeperCnn);
        assert_eq!(rows[1].architecture, Architecture::SmallCnn);
        assert_eq!(rows[2].architecture, Architecture::Mlp);
        let message = rows[2].outcome.as_ref().unwrap_err();
        assert!(message.contains("MLP"));
        // 失敗行は一致判定に数えない
        assert_eq!(Consensus::from_rows(&rows), Consensus::Agree(5));

        let table = format_prediction_table(&rows, 3);
        assert_eq!(table.lines().count(), 4);
    }

    #[test]
    fn test_missing_input_is_rejected() {
        assert!(matches!(prepare_input(None, 250.0), Err(LabError::InputValidation(_))));
        let empty = InputImage::Upload(Vec::new());
        assert!(matches!(prepare_input(Some(&empty), 250.0), Err(LabError::InputValidation(_))));
    }

    #[test]
    fn test_non_image_input_is_rejected() {
        let garbage = InputImage::Upload(b"definitely not a png".to_vec());
        assert!(matches!(prepare_input(Some(&garbage), 250.0), Err(LabError::InputValidation(_))));
    }

    #[test]
    fn test_blank_canvas_is_rejected_before_any_model() {
        let blank = InputImage::Canvas(png(RgbImage::from_pixel(64, 64, Rgb([255, 255, 255]))));
        let err = prepare_input(Some(&blank), 250.0).unwrap_err();
        assert!(err.is_user_correctable());

        // 同じ白画像でもアップロードなら受け付ける
        let upload = InputImage::Upload(png(RgbImage::from_pixel(64, 64, Rgb([255, 255, 255]))));
        assert!(prepare_input(Some(&upload), 250.0).is_ok());
    }

    #[test]
    fn test_canvas_with_stroke_is_inverted() {
        let mut canvas = RgbImage::from_pixel(28, 28, Rgb([255, 255, 255]));
        for y in 0..28 {
            for x in 10..18 {
                canvas.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        let prepared = prepare_input(Some(&InputImage::Canvas(png(canvas))), 250.0).unwrap();
        // 描いた線は明るく、背景は暗くなる
        assert!(prepared.digit.pixels()[14] > 0.9);
        assert!(prepared.digit.pixels()[0] < 0.1);
        assert_eq!(prepared.original.width(), 28);
    }
}
