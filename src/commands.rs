//! ユーザー操作（学習・推論・履歴・整合性チェック）
//!
//! 表示層はここの関数だけを呼び出します。エラーはすべて `LabError` として返し、
//! 表示層がそのままメッセージとして表示します。

use image::DynamicImage;
use serde::Serialize;
use tracing::info;

use crate::architecture::Architecture;
use crate::dataset::DigitDataset;
use crate::error::{LabError, Result};
use crate::history::{HistoryView, IntegrityIssue};
use crate::model::AppConfig;
use crate::prediction::{
    predict_single, predict_with_models, prepare_input, Consensus, InputImage, ModelLoader,
    ModelPrediction, Prediction,
};
use crate::preprocess::DigitImage;
use crate::session::LabContext;
use crate::training::{EpochRunner, TrainingRequest, TrainingSession};

#[cfg(feature = "ml")]
use crate::ml::{build_runner_for_device, BurnModelLoader, TrainerOptions};

#[cfg(not(feature = "ml"))]
const ML_DISABLED: &str = "機械学習機能が有効化されていません（`ml` フィーチャーを有効にしてビルドしてください）";

/// 推論結果一式
#[derive(Debug, Clone, Serialize)]
pub struct PredictionReport {
    #[serde(skip)]
    pub original: DynamicImage,
    #[serde(skip)]
    pub preview: DigitImage,
    /// 元画像の [幅, 高さ]
    pub original_size: [u32; 2],
    /// 28x28プレビュー（PNG, base64）
    pub preview_png_base64: String,
    /// 信頼度の高い順、失敗行は末尾
    pub rows: Vec<ModelPrediction>,
    pub consensus: Consensus,
    pub consensus_text: String,
}

/// 学習履歴DBを初期化（既存DBはそのまま、旧形式は移行）
pub fn init_db(ctx: &LabContext) -> Result<()> {
    ctx.store().ensure_schema()?;
    info!(database = %ctx.store().db_path().display(), "学習履歴DBを初期化しました");
    Ok(())
}

/// 任意の学習器で学習を開始
pub fn start_training_with<'a, F>(
    ctx: &'a mut LabContext,
    request: TrainingRequest,
    build_runner: F,
) -> Result<TrainingSession<'a>>
where
    F: FnOnce(&'a DigitDataset) -> Box<dyn EpochRunner + 'a>,
{
    request.validate()?;
    let artifacts_dir = ctx.artifacts_dir();
    let (store, dataset) = ctx.training_parts()?;
    let runner = build_runner(dataset);
    TrainingSession::new(request, store, artifacts_dir, runner)
}

/// 設定されたデバイスで学習を開始
#[cfg(feature = "ml")]
pub fn start_training(ctx: &mut LabContext, request: TrainingRequest) -> Result<TrainingSession<'_>> {
    let device_type = ctx.config().device_type;
    let options = TrainerOptions {
        batch_size: request.batch_size,
        learning_rate: ctx.config().training.learning_rate,
        seed: ctx.config().training.seed,
    };
    start_training_with(ctx, request, move |dataset| {
        build_runner_for_device(device_type, request.architecture, dataset, options)
    })
}

#[cfg(not(feature = "ml"))]
pub fn start_training(_ctx: &mut LabContext, _request: TrainingRequest) -> Result<TrainingSession<'_>> {
    Err(LabError::Config(ML_DISABLED.to_string()))
}

/// 設定に応じたモデルローダー
#[cfg(feature = "ml")]
pub fn model_loader(config: &AppConfig) -> Result<Box<dyn ModelLoader>> {
    Ok(Box::new(BurnModelLoader::new(config.device_type)))
}

#[cfg(not(feature = "ml"))]
pub fn model_loader(_config: &AppConfig) -> Result<Box<dyn ModelLoader>> {
    Err(LabError::Config(ML_DISABLED.to_string()))
}

/// 各アーキテクチャの最良モデルで推論し、一致判定を付ける
pub fn predict(ctx: &LabContext, input: Option<&InputImage>, loader: &dyn ModelLoader) -> Result<PredictionReport> {
    let prepared = prepare_input(input, ctx.config().prediction.blank_threshold)?;

    let artifacts_dir = ctx.artifacts_dir();
    let candidates = ctx.store().best_runs(&artifacts_dir)?;
    if candidates.is_empty() {
        return Err(LabError::model_not_found(
            "学習済みモデルがありません。先にモデルを学習してください",
        ));
    }

    let rows = predict_with_models(&candidates, &artifacts_dir, loader, &prepared.digit);
    let consensus = Consensus::from_rows(&rows);
    info!(models = rows.len(), ?consensus, "推論が完了しました");

    Ok(PredictionReport {
        original_size: [prepared.original.width(), prepared.original.height()],
        preview_png_base64: prepared.digit.preview_png_base64()?,
        original: prepared.original,
        preview: prepared.digit,
        rows,
        consensus,
        consensus_text: consensus.describe(),
    })
}

/// 指定アーキテクチャの最良モデルのみで推論
pub fn predict_with_model(
    ctx: &LabContext,
    input: Option<&InputImage>,
    architecture: Architecture,
    loader: &dyn ModelLoader,
) -> Result<Prediction> {
    let prepared = prepare_input(input, ctx.config().prediction.blank_threshold)?;

    let artifacts_dir = ctx.artifacts_dir();
    let run = ctx
        .store()
        .best_run(architecture, &artifacts_dir)?
        .ok_or_else(|| {
            LabError::model_not_found(format!(
                "{} の学習済みモデルがありません。先に学習してください",
                architecture
            ))
        })?;

    let predictor = loader.load(architecture, &run.artifact_path(&artifacts_dir))?;
    predict_single(predictor.as_ref(), &prepared.digit)
}

/// 学習履歴を読み込む
pub fn refresh_history(ctx: &LabContext) -> Result<HistoryView> {
    let store = ctx.store();
    Ok(HistoryView::build(store.runs()?, &store.all_metrics()?))
}

/// 学習履歴とモデルファイルの整合性チェック
pub fn check_integrity(ctx: &LabContext) -> Result<Vec<IntegrityIssue>> {
    ctx.store().integrity_report(&ctx.artifacts_dir())
}
