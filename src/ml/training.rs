//! Burnによる1エポック単位の学習
//!
//! Adam + クロスエントロピーで学習し、エポックごとに学習・検証精度を返します。
//! 進行管理（記録・保存）は `crate::training` 側で行います。

use burn::{
    module::{AutodiffModule, Module},
    nn::loss::CrossEntropyLossConfig,
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::marker::PhantomData;
use tracing::{debug, info};

use crate::architecture::Architecture;
use crate::dataset::{DigitDataset, DigitSplit};
use crate::error::{LabError, Result};
use crate::ml::dataset::DigitBatcher;
use crate::ml::ml_model::{DeeperCnnConfig, DigitNetwork, MlpConfig, SmallCnnConfig};
use crate::model::DeviceType;
use crate::training::{EpochAccuracy, EpochRunner};

/// CPU学習用バックエンド
pub type CpuTrainBackend = Autodiff<NdArray>;

/// GPU学習用バックエンド
pub type GpuTrainBackend = Autodiff<Wgpu>;

/// 検証時のバッチサイズ
const EVAL_BATCH_SIZE: usize = 256;

/// 学習パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainerOptions {
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

/// ネットワーク1つ分の学習状態
pub struct NetworkTrainer<'a, B, M, O>
where
    B: AutodiffBackend,
    M: DigitNetwork<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    model: M,
    optimizer: O,
    dataset: &'a DigitDataset,
    options: TrainerOptions,
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<'a, B, M, O> NetworkTrainer<'a, B, M, O>
where
    B: AutodiffBackend,
    M: DigitNetwork<B> + AutodiffModule<B>,
    M::InnerModule: DigitNetwork<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    pub fn new(
        model: M,
        optimizer: O,
        dataset: &'a DigitDataset,
        options: TrainerOptions,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            optimizer,
            dataset,
            options,
            device,
            _backend: PhantomData,
        }
    }

    /// 検証データでの精度（ドロップアウト無効）
    fn evaluate(&self, split: &DigitSplit) -> f64 {
        let model = self.model.valid();
        let batcher = DigitBatcher::<B::InnerBackend>::new(self.device.clone());
        let indices: Vec<usize> = (0..split.len()).collect();

        let mut correct = 0usize;
        let mut seen = 0usize;
        for chunk in indices.chunks(EVAL_BATCH_SIZE) {
            let Some(batch) = batcher.batch_indices(split, chunk) else {
                continue;
            };
            let logits = model.forward(batch.images);
            correct += count_correct(logits, batch.targets);
            seen += chunk.len();
        }

        if seen == 0 {
            0.0
        } else {
            correct as f64 / seen as f64
        }
    }
}

impl<'a, B, M, O> EpochRunner for NetworkTrainer<'a, B, M, O>
where
    B: AutodiffBackend,
    M: DigitNetwork<B> + AutodiffModule<B>,
    M::InnerModule: DigitNetwork<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    fn run_epoch(&mut self, epoch: usize) -> Result<EpochAccuracy> {
        let train = &self.dataset.train;
        if train.is_empty() {
            return Err(LabError::dataset("学習データが空です"));
        }
        if self.dataset.test.is_empty() {
            return Err(LabError::dataset("検証データが空です"));
        }

        // エポックごとに異なる順序でシャッフル（シード固定で再現可能）
        let mut indices: Vec<usize> = (0..train.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.options.seed.wrapping_add(epoch as u64));
        indices.shuffle(&mut rng);

        let batcher = DigitBatcher::<B>::new(self.device.clone());
        let loss_fn = CrossEntropyLossConfig::new().init(&self.device);

        let mut correct = 0usize;
        let mut seen = 0usize;
        for (step, chunk) in indices.chunks(self.options.batch_size).enumerate() {
            let Some(batch) = batcher.batch_indices(train, chunk) else {
                continue;
            };

            // Forward pass
            let logits = self.model.forward(batch.images);
            correct += count_correct(logits.clone(), batch.targets.clone());
            seen += chunk.len();

            let loss = loss_fn.forward(logits, batch.targets);
            if step % 200 == 0 {
                let loss_value = loss.clone().into_scalar().elem::<f64>();
                debug!(epoch, step, loss = loss_value, "学習中");
            }

            // Backward pass
            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);

            // Update weights
            self.model = self
                .optimizer
                .step(self.options.learning_rate, self.model.clone(), grads);
        }

        let train_accuracy = if seen == 0 {
            0.0
        } else {
            correct as f64 / seen as f64
        };
        let val_accuracy = self.evaluate(&self.dataset.test);

        Ok(EpochAccuracy {
            train_accuracy,
            val_accuracy,
        })
    }

    fn export_weights(&self) -> Result<Vec<u8>> {
        // f32精度のまま保存
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        Recorder::<B::InnerBackend>::record(&recorder, self.model.valid().into_record(), ())
            .map_err(|e| LabError::training(format!("モデル重みの書き出しに失敗しました: {:?}", e)))
    }
}

/// 正解数
fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = logits.dims();
    let predicted = logits.argmax(1).reshape([batch_size]);
    predicted
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

fn boxed_trainer<'a, B, M>(
    model: M,
    dataset: &'a DigitDataset,
    options: TrainerOptions,
    device: B::Device,
) -> Box<dyn EpochRunner + 'a>
where
    B: AutodiffBackend,
    M: DigitNetwork<B> + AutodiffModule<B> + 'a,
    M::InnerModule: DigitNetwork<B::InnerBackend>,
{
    let optimizer = AdamConfig::new().init::<B, M>();
    Box::new(NetworkTrainer::new(model, optimizer, dataset, options, device))
}

/// 指定バックエンドでアーキテクチャの学習器を作る
pub fn build_runner<'a, B: AutodiffBackend>(
    architecture: Architecture,
    dataset: &'a DigitDataset,
    options: TrainerOptions,
    device: B::Device,
) -> Box<dyn EpochRunner + 'a> {
    info!(architecture = %architecture, ?options, "モデルを初期化します");
    match architecture {
        Architecture::Mlp => {
            let model = MlpConfig::new().init::<B>(&device);
            boxed_trainer::<B, _>(model, dataset, options, device)
        }
        Architecture::SmallCnn => {
            let model = SmallCnnConfig::new().init::<B>(&device);
            boxed_trainer::<B, _>(model, dataset, options, device)
        }
        Architecture::DeeperCnn => {
            let model = DeeperCnnConfig::new().init::<B>(&device);
            boxed_trainer::<B, _>(model, dataset, options, device)
        }
    }
}

/// 設定されたデバイスで学習器を作る
pub fn build_runner_for_device<'a>(
    device_type: DeviceType,
    architecture: Architecture,
    dataset: &'a DigitDataset,
    options: TrainerOptions,
) -> Box<dyn EpochRunner + 'a> {
    match device_type {
        DeviceType::Wgpu => {
            info!("GPU (WGPU) モードで学習します");
            build_runner::<GpuTrainBackend>(architecture, dataset, options, WgpuDevice::default())
        }
        DeviceType::Cpu => {
            info!("CPU (NdArray) モードで学習します");
            build_runner::<CpuTrainBackend>(architecture, dataset, options, NdArrayDevice::default())
        }
    }
}
