//! 学習用のデータ供給
//!
//! `DigitSplit` をBurnの `Dataset` として扱い、ミニバッチのテンソルを組み立てます。

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};

use crate::dataset::DigitSplit;
use crate::preprocess::{IMAGE_PIXELS, IMAGE_SIDE};

/// データセットアイテム
#[derive(Clone, Debug)]
pub struct DigitItem {
    /// 正規化済み画素（[0, 1]、784要素）
    pub pixels: Vec<f32>,
    pub label: u8,
}

impl Dataset<DigitItem> for DigitSplit {
    fn get(&self, index: usize) -> Option<DigitItem> {
        let raw = self.image(index)?;
        let label = self.label(index)?;
        Some(DigitItem {
            pixels: raw.iter().map(|&v| v as f32 / 255.0).collect(),
            label,
        })
    }

    fn len(&self) -> usize {
        DigitSplit::len(self)
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct DigitBatch<B: Backend> {
    /// [batch_size, 28, 28]
    pub images: Tensor<B, 3>,
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// バッチャー
#[derive(Clone, Debug)]
pub struct DigitBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> DigitBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    /// `indices` の順にアイテムを集めてバッチ化
    pub fn batch_indices(&self, split: &DigitSplit, indices: &[usize]) -> Option<DigitBatch<B>> {
        let items: Vec<DigitItem> = indices.iter().filter_map(|&i| split.get(i)).collect();
        if items.is_empty() {
            return None;
        }
        Some(self.batch(items, &self.device))
    }
}

impl<B: Backend> Batcher<B, DigitItem, DigitBatch<B>> for DigitBatcher<B> {
    fn batch(&self, items: Vec<DigitItem>, device: &B::Device) -> DigitBatch<B> {
        let batch_size = items.len();
        let mut all_pixels = Vec::with_capacity(batch_size * IMAGE_PIXELS);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            all_pixels.extend_from_slice(&item.pixels);
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), device)
            .reshape([batch_size, IMAGE_SIDE, IMAGE_SIDE]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), device);

        DigitBatch { images, targets }
    }
}
