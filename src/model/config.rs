//! 設定ファイル（config.json）の読み書き
//!
//! 計算デバイスや保存先、学習・推論の既定値をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 保存先設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// モデルファイルと学習履歴DBの保存先
    pub artifacts_dir: String,
    /// 学習履歴DBのファイル名（artifacts_dir からの相対）
    pub database_file: String,
    /// MNIST IDXファイルのディレクトリ
    pub dataset_dir: String,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            artifacts_dir: "artifacts".to_string(),
            database_file: "training_history.db".to_string(),
            dataset_dir: "data/mnist".to_string(),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数（CLIで省略した場合）
    pub num_epochs: usize,
    /// バッチサイズ（CLIで省略した場合）
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// シャッフル用シード
    pub seed: u64,
    /// 学習データの上限件数（未指定なら全件）
    #[serde(default)]
    pub max_train_samples: Option<usize>,
    /// 検証データの上限件数（未指定なら全件）
    #[serde(default)]
    pub max_test_samples: Option<usize>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 3,
            batch_size: 32,
            learning_rate: 1e-3,
            seed: 42,
            max_train_samples: None,
            max_test_samples: None,
        }
    }
}

/// 推論設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSettings {
    /// この平均輝度（0-255）を超える入力は空白キャンバスとして扱う
    pub blank_threshold: f64,
    /// 確率上位いくつを表示するか
    pub top_k: usize,
}

impl Default for PredictionSettings {
    fn default() -> Self {
        Self {
            blank_threshold: 250.0,
            top_k: 5,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub prediction: PredictionSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しないか壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                info!(path = %path.display(), "設定ファイルを読み込みました");
                config
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "設定ファイルの読み込みに失敗しました。デフォルト設定を使用します"
                );
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.artifacts_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.artifacts_dir().join(&self.paths.database_file)
    }

    pub fn dataset_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.dataset_dir)
    }

    /// 設定情報をログに出力
    pub fn log_summary(&self) {
        info!(
            device = %self.device_type,
            artifacts = %self.artifacts_dir().display(),
            database = %self.database_path().display(),
            dataset = %self.dataset_dir().display(),
            learning_rate = self.training.learning_rate,
            blank_threshold = self.prediction.blank_threshold,
            "アプリケーション設定"
        );
    }
}
