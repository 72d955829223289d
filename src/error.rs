//! エラー定義
//!
//! ライブラリ内のすべての操作は `LabError` を返します。
//! 表示文字列はそのままユーザー向けメッセージとして使用されます。

use std::path::PathBuf;
use thiserror::Error;

/// digit_lab 共通エラー
#[derive(Debug, Error)]
pub enum LabError {
    /// 入力不備（未入力・画像以外・空白キャンバスなど）
    #[error("{0}")]
    InputValidation(String),

    /// 画像として解釈できない入力
    #[error("画像の前処理に失敗しました: {0}")]
    Preprocessing(String),

    /// 学習済みモデルが存在しない
    #[error("{0}")]
    ModelNotFound(String),

    /// モデルファイルの読み書き失敗
    #[error("モデルファイルを処理できません ({}): {message}", path.display())]
    ArtifactIo { path: PathBuf, message: String },

    /// 学習ループ中の失敗
    #[error("{0}")]
    Training(String),

    /// 複数モデル推論時の個別モデルの失敗
    #[error("{architecture} の推論に失敗しました: {message}")]
    Prediction { architecture: String, message: String },

    #[error("データセットの読み込みに失敗しました: {0}")]
    Dataset(String),

    #[error("学習履歴DBエラー: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("入出力エラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("設定エラー: {0}")]
    Config(String),
}

impl LabError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::InputValidation(message.into())
    }

    pub fn preprocessing(message: impl Into<String>) -> Self {
        Self::Preprocessing(message.into())
    }

    pub fn model_not_found(message: impl Into<String>) -> Self {
        Self::ModelNotFound(message.into())
    }

    pub fn artifact(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ArtifactIo {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn training(message: impl Into<String>) -> Self {
        Self::Training(message.into())
    }

    pub fn prediction(architecture: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Prediction {
            architecture: architecture.into(),
            message: message.into(),
        }
    }

    pub fn dataset(message: impl Into<String>) -> Self {
        Self::Dataset(message.into())
    }

    /// ユーザーが入力を直せば解消するエラーか
    pub fn is_user_correctable(&self) -> bool {
        matches!(self, Self::InputValidation(_) | Self::ModelNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, LabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_is_verbatim() {
        let err = LabError::validation("画像をアップロードしてください");
        assert_eq!(err.to_string(), "画像をアップロードしてください");
        assert!(err.is_user_correctable());
    }

    #[test]
    fn test_artifact_error_mentions_path() {
        let err = LabError::artifact("artifacts/model_mlp_run1.tar.gz", "not found");
        let text = err.to_string();
        assert!(text.contains("model_mlp_run1.tar.gz"));
        assert!(!err.is_user_correctable());
    }
}
