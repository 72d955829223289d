pub mod store;
pub mod report;

pub use store::{EpochMetric, IntegrityIssue, NewRun, RunRecord, RunStore};
pub use report::{display_percent, AccuracyCurve, CurvePoint, DurationPoint, HistoryView};
