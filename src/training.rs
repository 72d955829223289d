//! 学習の進行管理
//!
//! 1エポックずつ学習を進め、エポックごとに精度を記録し、
//! 最終エポック後にモデルファイルの保存と学習時間の書き込みを行います。
//!
//! 状態遷移:
//! ```text
//! Idle -> Running -> Finalizing -> Done
//! Running | Finalizing -> Failed
//! ```
//!
//! 進捗は `TrainingSession` のイテレータとして取り出します。
//! 各要素はそれまでの全エポックを含む累積テキストです。

use std::iter::FusedIterator;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info};

use crate::architecture::Architecture;
use crate::error::{LabError, Result};
use crate::history::{display_percent, NewRun, RunStore};
use crate::model::{save_artifact, ModelMetadata};

/// 指定可能なエポック数
pub const EPOCH_RANGE: RangeInclusive<usize> = 1..=20;

/// 指定可能なバッチサイズ
pub const BATCH_SIZE_RANGE: RangeInclusive<usize> = 16..=128;

/// 1エポック分の精度（0-1）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochAccuracy {
    pub train_accuracy: f64,
    pub val_accuracy: f64,
}

/// 1エポックずつ学習を進める実体
///
/// 機械学習フレームワーク側（`ml::training`）が実装します。
pub trait EpochRunner {
    /// エポック `epoch`（1始まり）を学習し、学習・検証精度を返す
    fn run_epoch(&mut self, epoch: usize) -> Result<EpochAccuracy>;

    /// 学習済みの重みをバイナリで取り出す
    fn export_weights(&self) -> Result<Vec<u8>>;
}

/// 学習の指定内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingRequest {
    pub architecture: Architecture,
    pub epochs: usize,
    pub batch_size: usize,
}

impl TrainingRequest {
    pub fn new(architecture: Architecture, epochs: usize, batch_size: usize) -> Self {
        Self {
            architecture,
            epochs,
            batch_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !EPOCH_RANGE.contains(&self.epochs) {
            return Err(LabError::validation(format!(
                "エポック数は {}〜{} で指定してください（指定値: {}）",
                EPOCH_RANGE.start(),
                EPOCH_RANGE.end(),
                self.epochs
            )));
        }
        if !BATCH_SIZE_RANGE.contains(&self.batch_size) {
            return Err(LabError::validation(format!(
                "バッチサイズは {}〜{} で指定してください（指定値: {}）",
                BATCH_SIZE_RANGE.start(),
                BATCH_SIZE_RANGE.end(),
                self.batch_size
            )));
        }
        Ok(())
    }
}

/// 学習の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Idle,
    Running,
    Finalizing,
    Done,
    Failed,
}

/// 1回の学習
pub struct TrainingSession<'a> {
    request: TrainingRequest,
    store: &'a RunStore,
    artifacts_dir: PathBuf,
    runner: Box<dyn EpochRunner + 'a>,
    state: TrainingState,
    lines: Vec<String>,
    completed_epochs: usize,
    last_accuracy: Option<EpochAccuracy>,
    run: Option<NewRun>,
    started: Instant,
}

impl<'a> TrainingSession<'a> {
    pub fn new(
        request: TrainingRequest,
        store: &'a RunStore,
        artifacts_dir: impl Into<PathBuf>,
        runner: Box<dyn EpochRunner + 'a>,
    ) -> Result<Self> {
        request.validate()?;
        Ok(Self {
            request,
            store,
            artifacts_dir: artifacts_dir.into(),
            runner,
            state: TrainingState::Idle,
            lines: Vec::with_capacity(request.epochs),
            completed_epochs: 0,
            last_accuracy: None,
            run: None,
            started: Instant::now(),
        })
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    /// 1エポック目の完了後に確定する run_id
    pub fn run_id(&self) -> Option<i64> {
        self.run.as_ref().map(|run| run.run_id)
    }

    /// 保存先（run_id 確定後のみ）
    pub fn artifact_path(&self) -> Option<PathBuf> {
        self.run
            .as_ref()
            .map(|run| self.artifacts_dir.join(&run.model_filename))
    }

    fn banner(&self) -> String {
        format!(
            "Starting training ({})...\nEpochs: {}, Batch Size: {}\n\n",
            self.request.architecture, self.request.epochs, self.request.batch_size
        )
    }

    fn transcript(&self) -> String {
        self.lines.join("\n")
    }

    fn run_next_epoch(&mut self) -> Result<String> {
        let epoch = self.completed_epochs + 1;
        let accuracy = self.runner.run_epoch(epoch)?;

        // 1エポック目の結果が出た時点で記録を作る
        if self.run.is_none() {
            let run = self.store.create_run(
                self.request.architecture,
                self.request.epochs,
                self.request.batch_size,
                accuracy.val_accuracy,
            )?;
            self.run = Some(run);
        }
        let run_id = self
            .run_id()
            .ok_or_else(|| LabError::training("学習記録が作成されていません"))?;
        self.store
            .record_epoch(run_id, epoch, accuracy.train_accuracy, accuracy.val_accuracy)?;

        self.completed_epochs = epoch;
        self.last_accuracy = Some(accuracy);
        self.lines.push(format!(
            "Epoch {}/{}: Train Acc = {:.2}%, Val Acc = {:.2}%",
            epoch,
            self.request.epochs,
            display_percent(accuracy.train_accuracy),
            display_percent(accuracy.val_accuracy)
        ));
        info!(
            run_id,
            epoch,
            train_accuracy = accuracy.train_accuracy,
            val_accuracy = accuracy.val_accuracy,
            "エポック完了"
        );

        if epoch >= self.request.epochs {
            self.state = TrainingState::Finalizing;
        }
        Ok(format!("{}\n\n", self.transcript()))
    }

    fn finalize(&mut self) -> Result<String> {
        let run = self
            .run
            .clone()
            .ok_or_else(|| LabError::training("学習記録が作成されていません"))?;
        let accuracy = self
            .last_accuracy
            .ok_or_else(|| LabError::training("エポックが1つも完了していません"))?;

        let weights = self.runner.export_weights()?;
        let metadata = ModelMetadata::new(
            self.request.architecture,
            run.run_id,
            self.request.epochs as u32,
            self.request.batch_size as u32,
            accuracy.val_accuracy,
        );
        let path = self.artifacts_dir.join(&run.model_filename);
        save_artifact(&path, &metadata, &weights)?;

        let duration = self.started.elapsed().as_secs_f64();
        self.store
            .complete_run(run.run_id, accuracy.val_accuracy, duration)?;

        self.state = TrainingState::Done;
        info!(run_id = run.run_id, duration_secs = duration, path = %path.display(), "学習が完了しました");

        Ok(completion_text(&self.transcript(), &path, run.run_id))
    }
}

fn completion_text(transcript: &str, path: &Path, run_id: i64) -> String {
    format!(
        "{}\n\nTraining Complete!\nModel saved to: {}\nSaved to database with Run ID: {}",
        transcript,
        path.display(),
        run_id
    )
}

impl Iterator for TrainingSession<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let step = match self.state {
            TrainingState::Idle => {
                self.state = TrainingState::Running;
                self.started = Instant::now();
                info!(
                    architecture = %self.request.architecture,
                    epochs = self.request.epochs,
                    batch_size = self.request.batch_size,
                    "学習を開始します"
                );
                return Some(self.banner());
            }
            TrainingState::Running => self.run_next_epoch(),
            TrainingState::Finalizing => self.finalize(),
            TrainingState::Done | TrainingState::Failed => return None,
        };

        match step {
            Ok(text) => Some(text),
            Err(e) => {
                error!(
                    run_id = ?self.run_id(),
                    completed_epochs = self.completed_epochs,
                    error = %e,
                    "学習に失敗しました"
                );
                self.state = TrainingState::Failed;
                Some(format!("Error during training: {}", e))
            }
        }
    }
}

impl FusedIterator for TrainingSession<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::load_artifact;
    use tempfile::TempDir;

    /// 決まった精度を返すだけの学習
    struct ScriptedRunner {
        accuracies: Vec<EpochAccuracy>,
        fail_at_epoch: Option<usize>,
        fail_export: bool,
    }

    impl ScriptedRunner {
        fn new(val: &[f64]) -> Self {
            Self {
                accuracies: val
                    .iter()
                    .map(|&v| EpochAccuracy {
                        train_accuracy: v - 0.01,
                        val_accuracy: v,
                    })
                    .collect(),
                fail_at_epoch: None,
                fail_export: false,
            }
        }
    }

    impl EpochRunner for ScriptedRunner {
        fn run_epoch(&mut self, epoch: usize) -> Result<EpochAccuracy> {
            if self.fail_at_epoch == Some(epoch) {
                return Err(LabError::training("out of memory"));
            }
            Ok(self.accuracies[epoch - 1])
        }

        fn export_weights(&self) -> Result<Vec<u8>> {
            if self.fail_export {
                return Err(LabError::training("export failed"));
            }
            Ok(vec![1, 2, 3])
        }
    }

    fn setup() -> (RunStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RunStore::open(dir.path().join("training_history.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_request_bounds() {
        assert!(TrainingRequest::new(Architecture::Mlp, 1, 16).validate().is_ok());
        assert!(TrainingRequest::new(Architecture::Mlp, 20, 128).validate().is_ok());
        assert!(TrainingRequest::new(Architecture::Mlp, 0, 32).validate().is_err());
        assert!(TrainingRequest::new(Architecture::Mlp, 21, 32).validate().is_err());
        assert!(TrainingRequest::new(Architecture::Mlp, 3, 8).validate().is_err());
        assert!(TrainingRequest::new(Architecture::Mlp, 3, 256).validate().is_err());
    }

    #[test]
    fn test_successful_run_yields_cumulative_transcript() {
        let (store, dir) = setup();
        let request = TrainingRequest::new(Architecture::SmallCnn, 3, 32);
        let runner = Box::new(ScriptedRunner::new(&[0.9, 0.95, 0.9712]));
        let session = TrainingSession::new(request, &store, dir.path(), runner).unwrap();

        let outputs: Vec<String> = session.collect();
        assert_eq!(outputs.len(), 5);
        assert_eq!(
            outputs[0],
            "Starting training (Small CNN)...\nEpochs: 3, Batch Size: 32\n\n"
        );
        assert_eq!(
            outputs[1],
            "Epoch 1/3: Train Acc = 89.00%, Val Acc = 90.00%\n\n"
        );
        assert!(outputs[2].starts_with("Epoch 1/3"));
        assert!(outputs[2].contains("Epoch 2/3"));
        assert!(outputs[3].contains("Epoch 3/3: Train Acc = 96.12%, Val Acc = 97.12%"));
        assert!(outputs[4].contains("Training Complete!"));
        assert!(outputs[4].contains("model_small_cnn_run1.tar.gz"));
        assert!(outputs[4].ends_with("Run ID: 1"));

        let metrics = store.metrics_for(1).unwrap();
        let epochs: Vec<i64> = metrics.iter().map(|m| m.epoch).collect();
        assert_eq!(epochs, vec![1, 2, 3]);

        let run = store.run(1).unwrap().unwrap();
        assert!(run.duration.is_some());
        assert_eq!(run.val_accuracy, 0.9712);

        let (metadata, weights) = load_artifact(&dir.path().join("model_small_cnn_run1.tar.gz")).unwrap();
        assert_eq!(metadata.run_id, 1);
        assert_eq!(metadata.architecture, Architecture::SmallCnn);
        assert_eq!(weights, vec![1, 2, 3]);
    }

    #[test]
    fn test_run_row_appears_after_first_epoch_with_null_duration() {
        let (store, dir) = setup();
        let request = TrainingRequest::new(Architecture::Mlp, 2, 32);
        let runner = Box::new(ScriptedRunner::new(&[0.8, 0.85]));
        let mut session = TrainingSession::new(request, &store, dir.path(), runner).unwrap();

        assert_eq!(session.state(), TrainingState::Idle);
        session.next();
        assert_eq!(session.state(), TrainingState::Running);
        assert!(store.runs().unwrap().is_empty());

        session.next();
        assert_eq!(session.run_id(), Some(1));
        assert_eq!(store.run(1).unwrap().unwrap().duration, None);

        session.next();
        assert_eq!(session.state(), TrainingState::Finalizing);
        assert_eq!(store.run(1).unwrap().unwrap().duration, None);

        session.next();
        assert_eq!(session.state(), TrainingState::Done);
        assert!(store.run(1).unwrap().unwrap().duration.is_some());
        assert!(session.next().is_none());
        assert!(session.next().is_none());
    }

    #[test]
    fn test_failure_mid_run_keeps_written_metrics() {
        let (store, dir) = setup();
        let request = TrainingRequest::new(Architecture::DeeperCnn, 3, 64);
        let mut runner = ScriptedRunner::new(&[0.9, 0.95, 0.97]);
        runner.fail_at_epoch = Some(2);
        let session = TrainingSession::new(request, &store, dir.path(), Box::new(runner)).unwrap();

        let outputs: Vec<String> = session.collect();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[2], "Error during training: out of memory");

        assert_eq!(store.metrics_for(1).unwrap().len(), 1);
        assert_eq!(store.run(1).unwrap().unwrap().duration, None);
        assert!(!dir.path().join("model_deeper_cnn_run1.tar.gz").exists());
    }

    #[test]
    fn test_failure_while_saving_reports_once() {
        let (store, dir) = setup();
        let request = TrainingRequest::new(Architecture::Mlp, 1, 32);
        let mut runner = ScriptedRunner::new(&[0.9]);
        runner.fail_export = true;
        let mut session = TrainingSession::new(request, &store, dir.path(), Box::new(runner)).unwrap();

        let outputs: Vec<String> = session.by_ref().collect();
        assert_eq!(outputs.last().unwrap(), "Error during training: export failed");
        assert_eq!(session.state(), TrainingState::Failed);
        assert_eq!(store.metrics_for(1).unwrap().len(), 1);
        assert_eq!(store.run(1).unwrap().unwrap().duration, None);
    }

    #[test]
    fn test_invalid_request_is_rejected_before_training() {
        let (store, dir) = setup();
        let request = TrainingRequest::new(Architecture::Mlp, 0, 32);
        let runner = Box::new(ScriptedRunner::new(&[]));
        assert!(TrainingSession::new(request, &store, dir.path(), runner).is_err());
        assert!(store.runs().unwrap().is_empty());
    }
}
