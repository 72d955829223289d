//! モデル推論機能

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};
use std::path::Path;
use tracing::info;

use crate::architecture::Architecture;
use crate::error::{LabError, Result};
use crate::ml::ml_model::{
    DeeperCnn, DeeperCnnConfig, DigitNetwork, Mlp, MlpConfig, SmallCnn, SmallCnnConfig,
};
use crate::model::{load_artifact, DeviceType, ModelMetadata};
use crate::prediction::{DigitPredictor, ModelLoader};
use crate::preprocess::{DigitImage, IMAGE_SIDE};

/// 読み込み済みネットワーク
#[derive(Debug)]
enum LoadedNetwork<B: Backend> {
    Mlp(Mlp<B>),
    SmallCnn(SmallCnn<B>),
    DeeperCnn(DeeperCnn<B>),
}

impl<B: Backend> LoadedNetwork<B> {
    fn probabilities(&self, images: Tensor<B, 3>) -> Tensor<B, 2> {
        match self {
            LoadedNetwork::Mlp(model) => model.probabilities(images),
            LoadedNetwork::SmallCnn(model) => model.probabilities(images),
            LoadedNetwork::DeeperCnn(model) => model.probabilities(images),
        }
    }
}

fn restore<B: Backend, M: Module<B>>(
    architecture: Architecture,
    model: M,
    weights: Vec<u8>,
    device: &B::Device,
) -> Result<M> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = Recorder::<B>::load(&recorder, weights, device).map_err(|e| {
        LabError::prediction(architecture.name(), format!("モデル重みの読み込みエラー: {:?}", e))
    })?;
    Ok(model.load_record(record))
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    network: LoadedNetwork<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルファイルを読み込んで推論エンジンを初期化
    pub fn load(model_path: &Path, device: B::Device) -> Result<Self> {
        let (metadata, weights) = load_artifact(model_path)?;
        Self::from_parts(metadata, weights, device)
            .map_err(|e| LabError::artifact(model_path, e.to_string()))
    }

    /// メタデータと重みから組み立てる
    pub fn from_parts(metadata: ModelMetadata, weights: Vec<u8>, device: B::Device) -> Result<Self> {
        if metadata.model_input_size as usize != IMAGE_SIDE {
            return Err(LabError::validation(format!(
                "入力サイズが一致しません: {} (期待: {})",
                metadata.model_input_size, IMAGE_SIDE
            )));
        }

        let architecture = metadata.architecture;
        let network = match architecture {
            Architecture::Mlp => LoadedNetwork::Mlp(restore(
                architecture,
                MlpConfig::new().init::<B>(&device),
                weights,
                &device,
            )?),
            Architecture::SmallCnn => LoadedNetwork::SmallCnn(restore(
                architecture,
                SmallCnnConfig::new().init::<B>(&device),
                weights,
                &device,
            )?),
            Architecture::DeeperCnn => LoadedNetwork::DeeperCnn(restore(
                architecture,
                DeeperCnnConfig::new().init::<B>(&device),
                weights,
                &device,
            )?),
        };

        info!(
            architecture = %metadata.architecture,
            run_id = metadata.run_id,
            "推論用モデルを読み込みました"
        );
        Ok(Self {
            network,
            metadata,
            device,
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}

impl<B: Backend> DigitPredictor for InferenceEngine<B> {
    fn predict_probabilities(&self, image: &DigitImage) -> Result<Vec<f32>> {
        // Tensorに変換 [1, 28, 28]
        let tensor = Tensor::<B, 1>::from_floats(image.pixels(), &self.device)
            .reshape([1, IMAGE_SIDE, IMAGE_SIDE]);

        self.network
            .probabilities(tensor)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| {
                LabError::prediction(
                    self.metadata.architecture.name(),
                    format!("推論結果の取得エラー: {:?}", e),
                )
            })
    }
}

/// 設定されたデバイスでモデルファイルを読み込むローダー
#[derive(Debug, Clone, Copy)]
pub struct BurnModelLoader {
    device_type: DeviceType,
}

impl BurnModelLoader {
    pub fn new(device_type: DeviceType) -> Self {
        Self { device_type }
    }
}

impl ModelLoader for BurnModelLoader {
    fn load(&self, architecture: Architecture, path: &Path) -> Result<Box<dyn DigitPredictor>> {
        let (metadata, weights) = load_artifact(path)?;
        if metadata.architecture != architecture {
            return Err(LabError::artifact(
                path,
                format!(
                    "アーキテクチャが一致しません: {} (期待: {})",
                    metadata.architecture, architecture
                ),
            ));
        }

        let as_artifact_error = |e: LabError| LabError::artifact(path, e.to_string());
        let predictor: Box<dyn DigitPredictor> = match self.device_type {
            DeviceType::Wgpu => Box::new(
                InferenceEngine::<Wgpu>::from_parts(metadata, weights, WgpuDevice::default())
                    .map_err(as_artifact_error)?,
            ),
            DeviceType::Cpu => Box::new(
                InferenceEngine::<NdArray>::from_parts(metadata, weights, NdArrayDevice::default())
                    .map_err(as_artifact_error)?,
            ),
        };
        Ok(predictor)
    }
}
