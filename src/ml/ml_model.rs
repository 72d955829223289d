//! 数字分類ネットワークの定義
//!
//! 3種類のアーキテクチャを提供します。入力は [batch, 28, 28]、
//! 出力は10クラスのロジット [batch, 10] で共通です。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Tensor},
};

use crate::prediction::NUM_CLASSES;
use crate::preprocess::{IMAGE_PIXELS, IMAGE_SIDE};

/// 3x3畳み込み（パディングなし）後の一辺
const fn after_conv(side: usize) -> usize {
    side - 2
}

/// 2x2プーリング（ストライド2）後の一辺
const fn after_pool(side: usize) -> usize {
    side / 2
}

/// 分類ネットワーク共通のインターフェース
pub trait DigitNetwork<B: Backend>: Module<B> {
    /// 順伝播
    ///
    /// - `images`: [batch_size, 28, 28]
    /// - 戻り値: ロジット [batch_size, 10]
    fn forward(&self, images: Tensor<B, 3>) -> Tensor<B, 2>;

    /// 確率（softmax適用済み、各行の合計1）
    fn probabilities(&self, images: Tensor<B, 3>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }
}

/// MLP設定
#[derive(Config, Debug)]
pub struct MlpConfig {
    #[config(default = 128)]
    pub hidden: usize,
}

impl MlpConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        Mlp {
            fc1: LinearConfig::new(IMAGE_PIXELS, self.hidden).init(device),
            fc2: LinearConfig::new(self.hidden, NUM_CLASSES).init(device),
            activation: Relu::new(),
        }
    }
}

/// 全結合のみ
///
/// - Flatten 784
/// - FC: 784 -> 128 + ReLU
/// - FC: 128 -> 10
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    activation: Relu,
}

impl<B: Backend> DigitNetwork<B> for Mlp<B> {
    fn forward(&self, images: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch_size, height, width] = images.dims();
        let x = images.reshape([batch_size, height * width]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        self.fc2.forward(x)
    }
}

/// Small CNN設定
#[derive(Config, Debug)]
pub struct SmallCnnConfig {
    #[config(default = 32)]
    pub channels: usize,
    #[config(default = 64)]
    pub hidden: usize,
}

impl SmallCnnConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SmallCnn<B> {
        // 28 -> conv 26 -> pool 13
        let side = after_pool(after_conv(IMAGE_SIDE));
        let features = self.channels * side * side;

        SmallCnn {
            conv: Conv2dConfig::new([1, self.channels], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(features, self.hidden).init(device),
            fc2: LinearConfig::new(self.hidden, NUM_CLASSES).init(device),
            activation: Relu::new(),
        }
    }
}

/// 畳み込み1層 + プーリング
///
/// - Conv 3x3 (1 -> 32) + ReLU
/// - MaxPool 2x2
/// - FC: 5408 -> 64 + ReLU
/// - FC: 64 -> 10
#[derive(Module, Debug)]
pub struct SmallCnn<B: Backend> {
    conv: Conv2d<B>,
    pool: MaxPool2d,
    fc1: Linear<B>,
    fc2: Linear<B>,
    activation: Relu,
}

impl<B: Backend> DigitNetwork<B> for SmallCnn<B> {
    fn forward(&self, images: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch_size, height, width] = images.dims();
        let x = images.reshape([batch_size, 1, height, width]);

        let x = self.conv.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        self.fc2.forward(x)
    }
}

/// Deeper CNN設定
#[derive(Config, Debug)]
pub struct DeeperCnnConfig {
    #[config(default = 128)]
    pub hidden: usize,
    #[config(default = 0.25)]
    pub conv_dropout: f64,
    #[config(default = 0.5)]
    pub dense_dropout: f64,
}

impl DeeperCnnConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DeeperCnn<B> {
        // 28 -> conv 26 -> conv 24 -> pool 12
        let side = after_pool(after_conv(after_conv(IMAGE_SIDE)));
        let features = 64 * side * side;

        DeeperCnn {
            conv1: Conv2dConfig::new([1, 32], [3, 3])
                .with_stride([1, 1])
                .init(device),
            conv2: Conv2dConfig::new([32, 64], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dropout1: DropoutConfig::new(self.conv_dropout).init(),
            fc1: LinearConfig::new(features, self.hidden).init(device),
            dropout2: DropoutConfig::new(self.dense_dropout).init(),
            fc2: LinearConfig::new(self.hidden, NUM_CLASSES).init(device),
            activation: Relu::new(),
        }
    }
}

/// 畳み込み2層 + ドロップアウト
///
/// - Conv 3x3 (1 -> 32) + ReLU
/// - Conv 3x3 (32 -> 64) + ReLU
/// - MaxPool 2x2 + Dropout 0.25
/// - FC: 9216 -> 128 + ReLU + Dropout 0.5
/// - FC: 128 -> 10
#[derive(Module, Debug)]
pub struct DeeperCnn<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: MaxPool2d,
    dropout1: Dropout,
    fc1: Linear<B>,
    dropout2: Dropout,
    fc2: Linear<B>,
    activation: Relu,
}

impl<B: Backend> DigitNetwork<B> for DeeperCnn<B> {
    fn forward(&self, images: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch_size, height, width] = images.dims();
        let x = images.reshape([batch_size, 1, height, width]);

        let x = self.conv1.forward(x);
        let x = self.activation.forward(x);
        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool.forward(x);
        let x = self.dropout1.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout2.forward(x);
        self.fc2.forward(x)
    }
}
