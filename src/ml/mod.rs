pub mod ml_model;
pub mod dataset;
pub mod training;
pub mod inference;

pub use ml_model::{DeeperCnn, DeeperCnnConfig, DigitNetwork, Mlp, MlpConfig, SmallCnn, SmallCnnConfig};
pub use dataset::{DigitBatch, DigitBatcher, DigitItem};
pub use training::{build_runner, build_runner_for_device, CpuTrainBackend, GpuTrainBackend, NetworkTrainer, TrainerOptions};
pub use inference::{BurnModelLoader, InferenceEngine};
