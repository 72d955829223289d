//! 学習履歴DB
//!
//! SQLiteに3つのテーブルを持ちます。
//!
//! ```sql
//! models(model_id PK, architecture TEXT UNIQUE NOT NULL, created_at)
//! training_runs(run_id PK, model_id FK, epochs, batch_size, val_accuracy,
//!               model_filename, duration NULL, created_at)
//! metrics(metric_id PK, run_id FK, epoch, train_accuracy, val_accuracy, created_at)
//! ```
//!
//! 各操作は接続を開き、1つ（または決まった少数）の文を実行してコミットし、閉じます。
//! 複数エポックにまたがる長いトランザクションは持ちません。

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::architecture::Architecture;
use crate::error::{LabError, Result};

/// 新規作成した学習記録
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewRun {
    pub run_id: i64,
    pub model_id: i64,
    pub model_filename: String,
}

/// 学習記録（アーキテクチャ名を解決済み）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub run_id: i64,
    pub architecture: String,
    pub epochs: i64,
    pub batch_size: i64,
    pub val_accuracy: f64,
    pub model_filename: String,
    /// 学習時間（秒）。旧形式の行や未完了の学習ではNULL
    pub duration: Option<f64>,
    pub created_at: String,
}

impl RunRecord {
    pub fn artifact_path(&self, artifacts_dir: &Path) -> PathBuf {
        artifacts_dir.join(&self.model_filename)
    }

    pub fn is_complete(&self) -> bool {
        self.duration.is_some()
    }
}

/// エポックごとの精度
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochMetric {
    pub run_id: i64,
    pub epoch: i64,
    pub train_accuracy: f64,
    pub val_accuracy: f64,
}

/// 整合性チェックで見つかった問題
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum IntegrityIssue {
    /// 学習が完了していない（durationがNULL）
    Incomplete { run_id: i64, model_filename: String },
    /// DBにはあるがモデルファイルがない
    MissingArtifact { run_id: i64, model_filename: String },
    /// モデルファイルはあるがDBに記録がない
    UntrackedArtifact { model_filename: String },
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityIssue::Incomplete { run_id, model_filename } => {
                write!(f, "run {} ({}) は完了していません", run_id, model_filename)
            }
            IntegrityIssue::MissingArtifact { run_id, model_filename } => {
                write!(f, "run {} のモデルファイル {} がありません", run_id, model_filename)
            }
            IntegrityIssue::UntrackedArtifact { model_filename } => {
                write!(f, "{} は学習履歴に記録されていません", model_filename)
            }
        }
    }
}

const RUN_COLUMNS: &str = "r.run_id, COALESCE(m.architecture, 'Unknown'), r.epochs, r.batch_size,
    r.val_accuracy, r.model_filename, r.duration, COALESCE(r.created_at, '')";

fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        run_id: row.get(0)?,
        architecture: row.get(1)?,
        epochs: row.get(2)?,
        batch_size: row.get(3)?,
        val_accuracy: row.get(4)?,
        model_filename: row.get(5)?,
        duration: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn metric_from_row(row: &Row<'_>) -> rusqlite::Result<EpochMetric> {
    Ok(EpochMetric {
        run_id: row.get(0)?,
        epoch: row.get(1)?,
        train_accuracy: row.get(2)?,
        val_accuracy: row.get(3)?,
    })
}

/// 学習履歴DBへのハンドル（パスのみ保持）
#[derive(Debug, Clone)]
pub struct RunStore {
    db_path: PathBuf,
}

impl RunStore {
    /// DBを開く。ファイルやテーブルが無ければ作成する
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// テーブル作成と旧形式DBの移行
    pub fn ensure_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS models (
                model_id INTEGER PRIMARY KEY AUTOINCREMENT,
                architecture TEXT NOT NULL UNIQUE,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS training_runs (
                run_id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_id INTEGER,
                epochs INTEGER,
                batch_size INTEGER,
                val_accuracy REAL,
                model_filename TEXT,
                duration REAL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (model_id) REFERENCES models(model_id)
            );
            CREATE TABLE IF NOT EXISTS metrics (
                metric_id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER,
                epoch INTEGER,
                train_accuracy REAL,
                val_accuracy REAL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (run_id) REFERENCES training_runs(run_id)
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_run ON metrics(run_id);
            ",
        )?;

        // duration列の無い旧形式DB
        let has_duration = conn
            .prepare("SELECT 1 FROM pragma_table_info('training_runs') WHERE name = 'duration'")?
            .exists([])?;
        if !has_duration {
            conn.execute("ALTER TABLE training_runs ADD COLUMN duration REAL", [])?;
            info!("training_runs に duration 列を追加しました");
        }

        debug!(path = %self.db_path.display(), "学習履歴DBのスキーマを確認しました");
        Ok(())
    }

    fn architecture_id_in(conn: &Connection, architecture: Architecture) -> Result<i64> {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT model_id FROM models WHERE architecture = ?1",
                params![architecture.name()],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(model_id) = existing {
            return Ok(model_id);
        }

        conn.execute(
            "INSERT INTO models (architecture, created_at) VALUES (?1, ?2)",
            params![architecture.name(), now_timestamp()],
        )?;
        let model_id = conn.last_insert_rowid();
        info!(architecture = %architecture, model_id, "アーキテクチャを登録しました");
        Ok(model_id)
    }

    /// アーキテクチャのIDを取得（無ければ登録）
    pub fn architecture_id(&self, architecture: Architecture) -> Result<i64> {
        let conn = self.connect()?;
        Self::architecture_id_in(&conn, architecture)
    }

    /// 次に割り当てる run_id（現在の最大値 + 1）
    fn next_run_id_in(conn: &Connection) -> Result<i64> {
        let next = conn.query_row(
            "SELECT COALESCE(MAX(run_id), 0) + 1 FROM training_runs",
            [],
            |row| row.get(0),
        )?;
        Ok(next)
    }

    /// 学習記録を作成
    ///
    /// run_id の採番・ファイル名の決定・挿入を1トランザクションで行う。
    /// duration はNULLのまま作成され、`complete_run` で一度だけ埋められる。
    pub fn create_run(
        &self,
        architecture: Architecture,
        epochs: usize,
        batch_size: usize,
        val_accuracy: f64,
    ) -> Result<NewRun> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        let model_id = Self::architecture_id_in(&tx, architecture)?;
        let run_id = Self::next_run_id_in(&tx)?;
        let model_filename = architecture.artifact_filename(run_id);

        tx.execute(
            "INSERT INTO training_runs
                (run_id, model_id, epochs, batch_size, val_accuracy, model_filename, duration, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)",
            params![
                run_id,
                model_id,
                epochs as i64,
                batch_size as i64,
                val_accuracy,
                model_filename,
                now_timestamp(),
            ],
        )?;
        tx.commit()?;

        info!(run_id, architecture = %architecture, model_filename, "学習記録を作成しました");
        Ok(NewRun {
            run_id,
            model_id,
            model_filename,
        })
    }

    /// エポックの精度を追記
    pub fn record_epoch(&self, run_id: i64, epoch: usize, train_accuracy: f64, val_accuracy: f64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO metrics (run_id, epoch, train_accuracy, val_accuracy, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, epoch as i64, train_accuracy, val_accuracy, now_timestamp()],
        )?;
        debug!(run_id, epoch, train_accuracy, val_accuracy, "エポック精度を記録しました");
        Ok(())
    }

    /// 学習完了時に最終精度と学習時間を書き込む（1回限り）
    pub fn complete_run(&self, run_id: i64, val_accuracy: f64, duration_secs: f64) -> Result<()> {
        let conn = self.connect()?;
        let updated = conn.execute(
            "UPDATE training_runs SET val_accuracy = ?1, duration = ?2
             WHERE run_id = ?3 AND duration IS NULL",
            params![val_accuracy, duration_secs, run_id],
        )?;

        if updated == 0 {
            return Err(LabError::training(format!(
                "run {} は存在しないか既に完了しています",
                run_id
            )));
        }
        info!(run_id, val_accuracy, duration_secs, "学習記録を完了しました");
        Ok(())
    }

    /// 全学習記録（新しい順）
    pub fn runs(&self) -> Result<Vec<RunRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM training_runs r
             LEFT JOIN models m ON m.model_id = r.model_id
             ORDER BY r.run_id DESC",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map([], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    pub fn run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        let conn = self.connect()?;
        let run = conn
            .query_row(
                &format!(
                    "SELECT {} FROM training_runs r
                     LEFT JOIN models m ON m.model_id = r.model_id
                     WHERE r.run_id = ?1",
                    RUN_COLUMNS
                ),
                params![run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// アーキテクチャの学習記録（検証精度の高い順）
    pub fn runs_for(&self, architecture: Architecture) -> Result<Vec<RunRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM training_runs r
             JOIN models m ON m.model_id = r.model_id
             WHERE m.architecture = ?1
             ORDER BY r.val_accuracy DESC, r.run_id DESC",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(params![architecture.name()], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// 1回の学習のエポック精度（エポック順）
    pub fn metrics_for(&self, run_id: i64) -> Result<Vec<EpochMetric>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, epoch, train_accuracy, val_accuracy FROM metrics
             WHERE run_id = ?1 ORDER BY epoch",
        )?;
        let metrics = stmt
            .query_map(params![run_id], metric_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(metrics)
    }

    /// 全エポック精度（run_id、エポック順）
    pub fn all_metrics(&self) -> Result<Vec<EpochMetric>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, epoch, train_accuracy, val_accuracy FROM metrics
             ORDER BY run_id, epoch",
        )?;
        let metrics = stmt
            .query_map([], metric_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(metrics)
    }

    /// アーキテクチャの最良モデル
    ///
    /// モデルファイルが存在する記録のうち検証精度が最大のもの。
    /// ファイルが無い記録は警告を出して飛ばす。
    pub fn best_run(&self, architecture: Architecture, artifacts_dir: &Path) -> Result<Option<RunRecord>> {
        for run in self.runs_for(architecture)? {
            let path = run.artifact_path(artifacts_dir);
            if path.is_file() {
                return Ok(Some(run));
            }
            warn!(
                run_id = run.run_id,
                path = %path.display(),
                "モデルファイルが見つからないためスキップします"
            );
        }
        Ok(None)
    }

    /// 全アーキテクチャの最良モデル（モデルが無いものは含まない）
    pub fn best_runs(&self, artifacts_dir: &Path) -> Result<Vec<(Architecture, RunRecord)>> {
        let mut best = Vec::new();
        for architecture in Architecture::ALL {
            if let Some(run) = self.best_run(architecture, artifacts_dir)? {
                best.push((architecture, run));
            }
        }
        Ok(best)
    }

    /// DBとモデルファイルの突き合わせ
    ///
    /// 問題の一覧を返すのみで、行やファイルは削除しない。
    pub fn integrity_report(&self, artifacts_dir: &Path) -> Result<Vec<IntegrityIssue>> {
        let runs = self.runs()?;
        let mut issues = Vec::new();

        for run in &runs {
            if !run.is_complete() {
                issues.push(IntegrityIssue::Incomplete {
                    run_id: run.run_id,
                    model_filename: run.model_filename.clone(),
                });
            } else if !run.artifact_path(artifacts_dir).is_file() {
                issues.push(IntegrityIssue::MissingArtifact {
                    run_id: run.run_id,
                    model_filename: run.model_filename.clone(),
                });
            }
        }

        if artifacts_dir.is_dir() {
            let mut untracked = Vec::new();
            for entry in std::fs::read_dir(artifacts_dir)? {
                let name = entry?.file_name().to_string_lossy().to_string();
                let is_artifact = name.starts_with("model_") && name.ends_with(".tar.gz");
                if is_artifact && !runs.iter().any(|run| run.model_filename == name) {
                    untracked.push(name);
                }
            }
            untracked.sort();
            issues.extend(
                untracked
                    .into_iter()
                    .map(|model_filename| IntegrityIssue::UntrackedArtifact { model_filename }),
            );
        }

        Ok(issues)
    }
}
