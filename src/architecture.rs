//! モデルアーキテクチャの定義
//!
//! 学習履歴DB・モデルファイル名・推論対象の選択で共通に使う識別子です。

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::LabError;

/// 分類器のアーキテクチャ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    /// 全結合のみ
    Mlp,
    /// 畳み込み1層 + プーリング
    SmallCnn,
    /// 畳み込み2層 + ドロップアウト
    DeeperCnn,
}

impl Architecture {
    /// 登録済みの全アーキテクチャ（表示順）
    pub const ALL: [Architecture; 3] = [
        Architecture::Mlp,
        Architecture::SmallCnn,
        Architecture::DeeperCnn,
    ];

    /// 学習履歴DBに記録する名前
    pub fn name(self) -> &'static str {
        match self {
            Architecture::Mlp => "MLP",
            Architecture::SmallCnn => "Small CNN",
            Architecture::DeeperCnn => "Deeper CNN",
        }
    }

    /// ファイル名用の表記（小文字・空白はアンダースコア）
    pub fn slug(self) -> &'static str {
        match self {
            Architecture::Mlp => "mlp",
            Architecture::SmallCnn => "small_cnn",
            Architecture::DeeperCnn => "deeper_cnn",
        }
    }

    /// 学習ごとのモデルファイル名
    pub fn artifact_filename(self, run_id: i64) -> String {
        format!("model_{}_run{}.tar.gz", self.slug(), run_id)
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Architecture {
    type Err = LabError;

    /// 表示名・スラッグのどちらでも受け付ける（大文字小文字は区別しない）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        Architecture::ALL
            .into_iter()
            .find(|arch| arch.slug() == normalized)
            .ok_or_else(|| {
                LabError::validation(format!(
                    "未知のアーキテクチャです: '{}' (選択肢: MLP, Small CNN, Deeper CNN)",
                    s
                ))
            })
    }
}
