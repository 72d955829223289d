//! モデルメタデータの定義
//!
//! モデルファイル（tar.gz）内の `metadata.json` として保存され、
//! 読み込み時にどのネットワークを組み立てるかを決めます。

use serde::{Deserialize, Serialize};

use crate::architecture::Architecture;
use crate::error::{LabError, Result};
use crate::preprocess::IMAGE_SIDE;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// アーキテクチャ
    pub architecture: Architecture,

    /// 学習履歴DB上の run_id
    pub run_id: i64,

    /// 学習エポック数
    pub num_epochs: u32,

    /// バッチサイズ
    pub batch_size: u32,

    /// 最終エポックの検証精度（0-1）
    pub val_accuracy: f64,

    /// モデル入力サイズ（通常28x28）
    pub model_input_size: u32,

    /// 分類クラス数
    pub num_classes: u32,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        architecture: Architecture,
        run_id: i64,
        num_epochs: u32,
        batch_size: u32,
        val_accuracy: f64,
    ) -> Self {
        Self {
            architecture,
            run_id,
            num_epochs,
            batch_size,
            val_accuracy,
            model_input_size: IMAGE_SIDE as u32,
            num_classes: 10,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| LabError::Config(format!("メタデータのJSON変換に失敗しました: {}", e)))
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| LabError::Config(format!("メタデータのJSON解析に失敗しました: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_keeps_architecture() {
        let metadata = ModelMetadata::new(Architecture::DeeperCnn, 4, 3, 64, 0.987);
        let json = metadata.to_json_string().unwrap();
        let parsed = ModelMetadata::from_json_string(&json).unwrap();
        assert_eq!(parsed, metadata);
        assert_eq!(parsed.model_input_size, 28);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(ModelMetadata::from_json_string("{}").is_err());
    }
}
