pub mod model_metadata;
pub mod model_storage;
pub mod config;

pub use model_metadata::ModelMetadata;
pub use model_storage::{save_artifact, load_artifact, load_metadata, print_metadata_info};
pub use config::{AppConfig, DeviceType, PathSettings, PredictionSettings, TrainingSettings};
