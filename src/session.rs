//! 実行中の共有状態
//!
//! 設定・学習履歴DB・データセットをまとめ、各コマンドへ明示的に渡します。
//! データセットは最初の学習時に一度だけ読み込み、以降は使い回します。

use std::path::PathBuf;
use tracing::info;

use crate::dataset::DigitDataset;
use crate::error::{LabError, Result};
use crate::history::RunStore;
use crate::model::AppConfig;

pub struct LabContext {
    config: AppConfig,
    store: RunStore,
    dataset: Option<DigitDataset>,
}

impl LabContext {
    /// 保存先ディレクトリを用意し、学習履歴DBを開く
    pub fn new(config: AppConfig) -> Result<Self> {
        let artifacts_dir = config.artifacts_dir();
        std::fs::create_dir_all(&artifacts_dir)
            .map_err(|e| LabError::artifact(&artifacts_dir, format!("ディレクトリを作成できません: {}", e)))?;

        let store = RunStore::open(config.database_path())?;
        info!(database = %store.db_path().display(), "学習履歴DBを開きました");

        Ok(Self {
            config,
            store,
            dataset: None,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.config.artifacts_dir()
    }

    pub fn is_dataset_loaded(&self) -> bool {
        self.dataset.is_some()
    }

    fn ensure_dataset(&mut self) -> Result<()> {
        if self.dataset.is_none() {
            let dataset = DigitDataset::load(
                &self.config.dataset_dir(),
                self.config.training.max_train_samples,
                self.config.training.max_test_samples,
            )?;
            self.dataset = Some(dataset);
        }
        Ok(())
    }

    /// 学習に必要な履歴DBとデータセット（未読み込みなら読み込む）
    pub fn training_parts(&mut self) -> Result<(&RunStore, &DigitDataset)> {
        self.ensure_dataset()?;
        let dataset = self
            .dataset
            .as_ref()
            .ok_or_else(|| LabError::dataset("データセットが読み込まれていません"))?;
        Ok((&self.store, dataset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::write_fixture;

    fn config_in(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.artifacts_dir = dir.join("artifacts").to_string_lossy().to_string();
        config.paths.dataset_dir = dir.join("mnist").to_string_lossy().to_string();
        config
    }

    #[test]
    fn test_new_creates_artifacts_dir_and_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let context = LabContext::new(config_in(dir.path())).unwrap();

        assert!(dir.path().join("artifacts").is_dir());
        assert!(dir.path().join("artifacts").join("training_history.db").is_file());
        assert!(!context.is_dataset_loaded());
    }

    #[test]
    fn test_dataset_is_loaded_once_with_limits() {
        let dir = tempfile::TempDir::new().unwrap();
        write_fixture(&dir.path().join("mnist"));

        let mut config = config_in(dir.path());
        config.training.max_train_samples = Some(20);
        config.training.max_test_samples = Some(12);
        let mut context = LabContext::new(config).unwrap();

        {
            let (_, dataset) = context.training_parts().unwrap();
            assert_eq!(dataset.train.len(), 20);
            assert_eq!(dataset.test.len(), 12);
        }
        assert!(context.is_dataset_loaded());

        // 読み込み後はファイルが無くても使い回す
        std::fs::remove_dir_all(dir.path().join("mnist")).unwrap();
        assert!(context.training_parts().is_ok());
    }

    #[test]
    fn test_missing_dataset_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut context = LabContext::new(config_in(dir.path())).unwrap();
        assert!(context.training_parts().is_err());
        assert!(!context.is_dataset_loaded());
    }
}
