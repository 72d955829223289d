//! 学習履歴の表示用データ
//!
//! 履歴テーブル、エポックごとの精度推移、精度と学習時間の関係を組み立てます。
//! 精度はDB上では0-1の割合、表示では百分率（小数第2位で丸め）です。

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{LabError, Result};
use crate::history::store::{EpochMetric, RunRecord};

/// 割合を百分率に変換（小数第2位で丸め）
pub fn display_percent(fraction: f64) -> f64 {
    (fraction * 10_000.0).round() / 100.0
}

/// 精度推移の1点
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurvePoint {
    pub epoch: i64,
    pub train_percent: f64,
    pub val_percent: f64,
}

/// 1回の学習の精度推移
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracyCurve {
    pub run_id: i64,
    /// 凡例用ラベル（例: "MLP (run 3)"）
    pub label: String,
    pub points: Vec<CurvePoint>,
}

/// 精度と学習時間の散布図の1点
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DurationPoint {
    pub run_id: i64,
    pub architecture: String,
    pub duration_secs: f64,
    pub val_percent: f64,
}

/// 履歴画面の内容
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryView {
    /// 新しい順
    pub runs: Vec<RunRecord>,
    pub accuracy_curves: Vec<AccuracyCurve>,
    /// durationがNULLの記録は含まない
    pub duration_points: Vec<DurationPoint>,
}

impl HistoryView {
    pub fn build(runs: Vec<RunRecord>, metrics: &[EpochMetric]) -> Self {
        let mut by_run: BTreeMap<i64, Vec<CurvePoint>> = BTreeMap::new();
        for metric in metrics {
            by_run.entry(metric.run_id).or_default().push(CurvePoint {
                epoch: metric.epoch,
                train_percent: display_percent(metric.train_accuracy),
                val_percent: display_percent(metric.val_accuracy),
            });
        }

        // 古い順に並べる
        let accuracy_curves = runs
            .iter()
            .rev()
            .filter_map(|run| {
                let mut points = by_run.remove(&run.run_id)?;
                points.sort_by_key(|p| p.epoch);
                Some(AccuracyCurve {
                    run_id: run.run_id,
                    label: format!("{} (run {})", run.architecture, run.run_id),
                    points,
                })
            })
            .collect();

        let duration_points = runs
            .iter()
            .rev()
            .filter_map(|run| {
                run.duration.map(|duration_secs| DurationPoint {
                    run_id: run.run_id,
                    architecture: run.architecture.clone(),
                    duration_secs,
                    val_percent: display_percent(run.val_accuracy),
                })
            })
            .collect();

        Self {
            runs,
            accuracy_curves,
            duration_points,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// 履歴テーブルをテキストで整形
    pub fn format_table(&self) -> String {
        if self.runs.is_empty() {
            return "学習履歴はまだありません".to_string();
        }

        let mut out = format!(
            "{:>6}  {:<12} {:>6} {:>6} {:>9} {:>10}  {:<32} {}\n",
            "Run", "Architecture", "Epochs", "Batch", "Val Acc", "Duration", "Model File", "Created At"
        );
        for run in &self.runs {
            let duration = run
                .duration
                .map(|d| format!("{:.1}s", d))
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "{:>6}  {:<12} {:>6} {:>6} {:>8.2}% {:>10}  {:<32} {}\n",
                run.run_id,
                run.architecture,
                run.epochs,
                run.batch_size,
                display_percent(run.val_accuracy),
                duration,
                run.model_filename,
                run.created_at,
            ));
        }
        out
    }

    /// CSVで書き出す（runs.csv / epoch_metrics.csv / accuracy_vs_duration.csv）
    pub fn export_csv(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;

        let runs_path = dir.join("runs.csv");
        write_csv(&runs_path, &self.runs)?;

        let epochs_path = dir.join("epoch_metrics.csv");
        let epoch_rows: Vec<EpochRow> = self
            .accuracy_curves
            .iter()
            .flat_map(|curve| {
                curve.points.iter().map(move |p| EpochRow {
                    run_id: curve.run_id,
                    label: &curve.label,
                    epoch: p.epoch,
                    train_percent: p.train_percent,
                    val_percent: p.val_percent,
                })
            })
            .collect();
        write_csv(&epochs_path, &epoch_rows)?;

        let duration_path = dir.join("accuracy_vs_duration.csv");
        write_csv(&duration_path, &self.duration_points)?;

        info!(dir = %dir.display(), runs = self.runs.len(), "学習履歴をCSVに書き出しました");
        Ok(vec![runs_path, epochs_path, duration_path])
    }
}

#[derive(Serialize)]
struct EpochRow<'a> {
    run_id: i64,
    label: &'a str,
    epoch: i64,
    train_percent: f64,
    val_percent: f64,
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let csv_error = |e: csv::Error| LabError::artifact(path, format!("CSVの書き出しに失敗しました: {}", e));
    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    for row in rows {
        writer.serialize(row).map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(run_id: i64, architecture: &str, val_accuracy: f64, duration: Option<f64>) -> RunRecord {
        RunRecord {
            run_id,
            architecture: architecture.to_string(),
            epochs: 2,
            batch_size: 32,
            val_accuracy,
            model_filename: format!("model_x_run{}.tar.gz", run_id),
            duration,
            created_at: "2024-01-01 00:00:00".to_string(),
        }
    }

    fn metric(run_id: i64, epoch: i64, train: f64, val: f64) -> EpochMetric {
        EpochMetric {
            run_id,
            epoch,
            train_accuracy: train,
            val_accuracy: val,
        }
    }

    #[test]
    fn test_display_percent_rounds_to_two_decimals() {
        assert_eq!(display_percent(0.98766), 98.77);
        assert_eq!(display_percent(1.0), 100.0);
        assert_eq!(display_percent(0.0), 0.0);
    }

    #[test]
    fn test_build_groups_metrics_per_run() {
        let runs = vec![run(2, "Small CNN", 0.97, Some(30.0)), run(1, "MLP", 0.93, None)];
        let metrics = vec![
            metric(1, 2, 0.92, 0.93),
            metric(1, 1, 0.85, 0.88),
            metric(2, 1, 0.95, 0.97),
        ];

        let view = HistoryView::build(runs, &metrics);

        assert_eq!(view.accuracy_curves.len(), 2);
        assert_eq!(view.accuracy_curves[0].label, "MLP (run 1)");
        let epochs: Vec<i64> = view.accuracy_curves[0].points.iter().map(|p| p.epoch).collect();
        assert_eq!(epochs, vec![1, 2]);
        assert_eq!(view.accuracy_curves[0].points[0].val_percent, 88.0);

        // durationがNULLの記録は散布図から外れる
        assert_eq!(view.duration_points.len(), 1);
        assert_eq!(view.duration_points[0].run_id, 2);
        assert_eq!(view.duration_points[0].val_percent, 97.0);
    }

    #[test]
    fn test_format_table() {
        assert_eq!(HistoryView::default().format_table(), "学習履歴はまだありません");

        let view = HistoryView::build(vec![run(1, "MLP", 0.9312, None)], &[]);
        let table = view.format_table();
        assert!(table.contains("MLP"));
        assert!(table.contains("93.12%"));
        assert!(table.contains("model_x_run1.tar.gz"));
    }

    #[test]
    fn test_export_csv() {
        let dir = tempfile::TempDir::new().unwrap();
        let view = HistoryView::build(
            vec![run(1, "MLP", 0.9, Some(12.0))],
            &[metric(1, 1, 0.8, 0.85), metric(1, 2, 0.88, 0.9)],
        );

        let paths = view.export_csv(dir.path()).unwrap();
        assert_eq!(paths.len(), 3);

        let runs_csv = std::fs::read_to_string(dir.path().join("runs.csv")).unwrap();
        assert!(runs_csv.starts_with("run_id,architecture,"));
        assert!(runs_csv.contains("MLP"));

        let epochs_csv = std::fs::read_to_string(dir.path().join("epoch_metrics.csv")).unwrap();
        assert_eq!(epochs_csv.lines().count(), 3);
    }
}
