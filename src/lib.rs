//! 手書き数字分類ラボ
//!
//! MNISTで3種類のネットワーク（MLP / Small CNN / Deeper CNN）を学習し、
//! 学習履歴をSQLiteに記録します。推論時は各アーキテクチャの最良モデルを並べて比較します。

pub mod error;
pub mod architecture;
pub mod preprocess;
pub mod dataset;
pub mod model;
pub mod history;
pub mod training;
pub mod prediction;
pub mod session;
pub mod commands;

// 機械学習機能のモジュール
#[cfg(feature = "ml")]
pub mod ml;

pub use architecture::Architecture;
pub use error::{LabError, Result};
pub use session::LabContext;
