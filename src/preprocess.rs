//! 入力画像の前処理
//!
//! 任意サイズ・任意チャンネル数の画像を、分類器が受け付ける
//! 28x28・単チャンネル・[0, 1] の数値配列へ変換します。

use base64::Engine;
use image::{imageops::FilterType, DynamicImage, GrayImage, ImageFormat, Luma};
use std::io::Cursor;

use crate::error::{LabError, Result};

/// 画像の一辺のピクセル数
pub const IMAGE_SIDE: usize = 28;

/// 1枚あたりの画素数
pub const IMAGE_PIXELS: usize = IMAGE_SIDE * IMAGE_SIDE;

/// 前処理済みの数字画像（行優先、値域 [0, 1]）
#[derive(Debug, Clone, PartialEq)]
pub struct DigitImage {
    pixels: Vec<f32>,
}

impl DigitImage {
    /// 正規化済み画素列から作成
    pub fn from_pixels(pixels: Vec<f32>) -> Result<Self> {
        if pixels.len() != IMAGE_PIXELS {
            return Err(LabError::preprocessing(format!(
                "画素数が不正です: {} (期待: {})",
                pixels.len(),
                IMAGE_PIXELS
            )));
        }
        if pixels.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(LabError::preprocessing("画素値が [0, 1] の範囲外です"));
        }
        Ok(Self { pixels })
    }

    /// MNIST形式の生バイト列（0-255）から作成
    pub fn from_raw_bytes(raw: &[u8]) -> Result<Self> {
        Self::from_pixels(raw.iter().map(|&v| v as f32 / 255.0).collect())
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    /// 正規化後のプレビュー画像
    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(IMAGE_SIDE as u32, IMAGE_SIDE as u32, |x, y| {
            let value = self.pixels[y as usize * IMAGE_SIDE + x as usize];
            Luma([(value * 255.0).round() as u8])
        })
    }

    /// プレビュー画像をPNG + base64で返す
    pub fn preview_png_base64(&self) -> Result<String> {
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(self.to_gray_image())
            .write_to(&mut buffer, ImageFormat::Png)
            .map_err(|e| LabError::preprocessing(format!("プレビューの生成に失敗しました: {}", e)))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(buffer.into_inner()))
    }
}

/// バイト列を画像としてデコード
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes)
        .map_err(|e| LabError::preprocessing(format!("画像として読み込めません: {}", e)))
}

/// 輝度画像へ変換
///
/// カラー画像は色チャンネル（アルファ除く）の単純平均を輝度とする。
pub fn intensity_image(image: &DynamicImage) -> GrayImage {
    if !image.color().has_color() {
        return image.to_luma8();
    }

    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let p = rgb.get_pixel(x, y);
        let sum = p[0] as u16 + p[1] as u16 + p[2] as u16;
        Luma([((sum + 1) / 3) as u8])
    })
}

/// 平均輝度（0-255）
pub fn mean_intensity(image: &DynamicImage) -> f64 {
    let gray = intensity_image(image);
    let count = gray.width() as u64 * gray.height() as u64;
    if count == 0 {
        return 0.0;
    }
    let sum: u64 = gray.pixels().map(|p| p[0] as u64).sum();
    sum as f64 / count as f64
}

/// 手書きキャンバスの白黒反転
///
/// キャンバスは白地に黒で描かれるため、MNIST（黒地に白）に合わせて反転する。
pub fn invert_canvas(image: &DynamicImage) -> DynamicImage {
    let mut inverted = image.clone();
    inverted.invert();
    inverted
}

/// 28x28・[0, 1] へ変換
///
/// アスペクト比は保持せず固定サイズへリサイズする。
pub fn preprocess(image: &DynamicImage) -> Result<DigitImage> {
    if image.width() == 0 || image.height() == 0 {
        return Err(LabError::preprocessing("画像サイズが0です"));
    }

    let gray = intensity_image(image);
    let resized = image::imageops::resize(
        &gray,
        IMAGE_SIDE as u32,
        IMAGE_SIDE as u32,
        FilterType::Triangle,
    );

    DigitImage::from_raw_bytes(resized.as_raw())
}

/// 手書きキャンバス入力の前処理（反転してから共通処理）
pub fn preprocess_canvas(image: &DynamicImage) -> Result<DigitImage> {
    preprocess(&invert_canvas(image))
}
