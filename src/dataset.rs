//! MNISTデータセットの読み込み
//!
//! IDXファイルの解析は `mnist` クレートで行います。
//! ここではファイルの配置とサイズの確認、`.gz` の展開、`DigitSplit` への詰め替えを担当します。

use flate2::read::GzDecoder;
use mnist::{Mnist, MnistBuilder};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, MAIN_SEPARATOR};
use tracing::{debug, info};

use crate::error::{LabError, Result};
use crate::preprocess::IMAGE_PIXELS;

pub const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
pub const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
pub const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
pub const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

/// 学習用ファイルの件数
pub const TRAIN_COUNT: usize = 60_000;
/// 検証用（t10k）ファイルの件数
pub const TEST_COUNT: usize = 10_000;

/// IDXファイル1つ分の期待値
struct IdxFile {
    name: &'static str,
    header_len: u64,
    item_len: u64,
    count: usize,
}

impl IdxFile {
    fn expected_len(&self) -> u64 {
        self.header_len + self.item_len * self.count as u64
    }
}

const IDX_FILES: [IdxFile; 4] = [
    IdxFile {
        name: TRAIN_IMAGES,
        header_len: 16,
        item_len: IMAGE_PIXELS as u64,
        count: TRAIN_COUNT,
    },
    IdxFile {
        name: TRAIN_LABELS,
        header_len: 8,
        item_len: 1,
        count: TRAIN_COUNT,
    },
    IdxFile {
        name: TEST_IMAGES,
        header_len: 16,
        item_len: IMAGE_PIXELS as u64,
        count: TEST_COUNT,
    },
    IdxFile {
        name: TEST_LABELS,
        header_len: 8,
        item_len: 1,
        count: TEST_COUNT,
    },
];

/// 画像とラベルの組（学習用または検証用）
#[derive(Debug, Clone, Default)]
pub struct DigitSplit {
    images: Vec<u8>,
    labels: Vec<u8>,
}

impl DigitSplit {
    /// 生画素（1枚784バイト連結）とラベルから作成
    pub fn from_parts(images: Vec<u8>, labels: Vec<u8>) -> Result<Self> {
        if images.len() != labels.len() * IMAGE_PIXELS {
            return Err(LabError::dataset(format!(
                "画像数とラベル数が一致しません: {} バイト / {} ラベル",
                images.len(),
                labels.len()
            )));
        }
        if let Some(bad) = labels.iter().find(|&&label| label > 9) {
            return Err(LabError::dataset(format!("不正なラベルです: {}", bad)));
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn image(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(IMAGE_PIXELS)?;
        self.images.get(start..start + IMAGE_PIXELS)
    }

    pub fn label(&self, index: usize) -> Option<u8> {
        self.labels.get(index).copied()
    }
}

/// 学習用・検証用の両方を保持するデータセット
#[derive(Debug, Clone, Default)]
pub struct DigitDataset {
    pub train: DigitSplit,
    pub test: DigitSplit,
}

impl DigitDataset {
    pub fn new(train: DigitSplit, test: DigitSplit) -> Self {
        Self { train, test }
    }

    /// ディレクトリからMNISTを読み込む
    ///
    /// `max_train` / `max_test` を指定すると各ファイルの先頭からその件数だけ使う。
    pub fn load(dir: &Path, max_train: Option<usize>, max_test: Option<usize>) -> Result<Self> {
        info!(dir = %dir.display(), ?max_train, ?max_test, "MNISTデータセットを読み込みます");

        for file in &IDX_FILES {
            prepare_idx(dir, file)?;
        }

        let train_len = max_train.unwrap_or(TRAIN_COUNT).min(TRAIN_COUNT);
        let test_len = max_test.unwrap_or(TEST_COUNT).min(TEST_COUNT);
        let mnist = read_mnist(dir, train_len, test_len)?;

        let train = DigitSplit::from_parts(mnist.trn_img, mnist.trn_lbl)?;
        let test = DigitSplit::from_parts(mnist.tst_img, mnist.tst_lbl)?;

        info!(
            train = train.len(),
            test = test.len(),
            "データセット読み込み完了"
        );
        Ok(Self { train, test })
    }
}

/// 展開済みファイルを用意し、サイズがMNISTの件数と一致するか確認する
fn prepare_idx(dir: &Path, file: &IdxFile) -> Result<()> {
    let plain = dir.join(file.name);
    if !plain.is_file() {
        let gz = dir.join(format!("{}.gz", file.name));
        if !gz.is_file() {
            return Err(LabError::dataset(format!(
                "{} が見つかりません ({})",
                file.name,
                dir.display()
            )));
        }
        extract_gz(&gz, &plain)?;
    }

    let len = fs::metadata(&plain)
        .map_err(|e| LabError::dataset(format!("{} を開けません: {}", plain.display(), e)))?
        .len();
    if len != file.expected_len() {
        return Err(LabError::dataset(format!(
            "{} のサイズが不正です: {} バイト (期待: {} バイト)",
            plain.display(),
            len,
            file.expected_len()
        )));
    }
    Ok(())
}

/// `.gz` を隣に展開（一時ファイルに書いてから置き換え）
fn extract_gz(gz: &Path, plain: &Path) -> Result<()> {
    debug!(path = %gz.display(), "gzip圧縮ファイルを展開します");
    let as_dataset_error =
        |e: io::Error| LabError::dataset(format!("{} を展開できません: {}", gz.display(), e));

    let staging = plain.with_extension("tmp");
    let mut decoder = GzDecoder::new(BufReader::new(File::open(gz).map_err(as_dataset_error)?));
    let mut writer = BufWriter::new(File::create(&staging).map_err(as_dataset_error)?);
    if let Err(e) = io::copy(&mut decoder, &mut writer).and_then(|_| writer.flush()) {
        let _ = fs::remove_file(&staging);
        return Err(as_dataset_error(e));
    }
    fs::rename(&staging, plain).map_err(as_dataset_error)
}

/// `mnist` クレートで読み込む
///
/// クレートは学習用とt10kを連結してから先頭から切り分けるため、
/// 学習用の残りを検証枠に回してテスト枠がt10kの先頭から始まるようにする。
/// ヘッダ不一致はクレート内でpanicになるので、ここで `LabError` に変換する。
fn read_mnist(dir: &Path, train_len: usize, test_len: usize) -> Result<Mnist> {
    let mut base_path = dir.to_string_lossy().into_owned();
    if !base_path.ends_with(MAIN_SEPARATOR) {
        base_path.push(MAIN_SEPARATOR);
    }
    let validation_len = TRAIN_COUNT - train_len;

    panic::catch_unwind(AssertUnwindSafe(|| {
        MnistBuilder::new()
            .base_path(&base_path)
            .training_set_length(train_len as u32)
            .validation_set_length(validation_len as u32)
            .test_set_length(test_len as u32)
            .finalize()
    }))
    .map_err(|cause| {
        let message = cause
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| cause.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_else(|| "不明なエラー".to_string());
        LabError::dataset(format!(
            "MNISTファイルを解析できません ({}): {}",
            dir.display(),
            message
        ))
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    const IMAGES_MAGIC: u32 = 0x0000_0803;
    const LABELS_MAGIC: u32 = 0x0000_0801;

    /// 学習用はラベル i % 10、t10k はラベル (i + 1) % 10。画素はラベル値 × 25
    fn label_for(name: &str, index: usize) -> u8 {
        let offset = if name.starts_with("t10k") { 1 } else { 0 };
        ((index + offset) % 10) as u8
    }

    fn idx_bytes(file: &IdxFile, count_in_header: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(file.expected_len() as usize);
        if file.item_len == 1 {
            for value in [LABELS_MAGIC, count_in_header] {
                bytes.extend_from_slice(&value.to_be_bytes());
            }
            bytes.extend((0..file.count).map(|i| label_for(file.name, i)));
        } else {
            for value in [IMAGES_MAGIC, count_in_header, 28, 28] {
                bytes.extend_from_slice(&value.to_be_bytes());
            }
            for i in 0..file.count {
                let pixel = label_for(file.name, i) * 25;
                bytes.extend(std::iter::repeat(pixel).take(IMAGE_PIXELS));
            }
        }
        bytes
    }

    fn write_atomically(path: &Path, bytes: &[u8]) {
        let staging = path.with_extension(format!("{}.tmp", std::process::id()));
        fs::write(&staging, bytes).unwrap();
        fs::rename(&staging, path).unwrap();
    }

    /// 全件サイズのMNISTファイル（テスト実行間で使い回す）
    fn shared_fixture() -> &'static Path {
        static FIXTURE: OnceLock<PathBuf> = OnceLock::new();
        FIXTURE.get_or_init(|| {
            let dir = std::env::temp_dir().join("digit_lab_mnist_fixture");
            fs::create_dir_all(&dir).unwrap();
            for file in &IDX_FILES {
                let path = dir.join(file.name);
                let ready = fs::metadata(&path)
                    .map(|meta| meta.len() == file.expected_len())
                    .unwrap_or(false);
                if !ready {
                    write_atomically(&path, &idx_bytes(file, file.count as u32));
                }
            }
            dir
        })
    }

    /// `dir` にMNISTファイルを配置する（ハードリンク、できなければコピー）
    pub(crate) fn write_fixture(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        let source = shared_fixture();
        for file in &IDX_FILES {
            let from = source.join(file.name);
            let to = dir.join(file.name);
            if fs::hard_link(&from, &to).is_err() {
                fs::copy(&from, &to).unwrap();
            }
        }
    }

    fn gzip_into(dir: &Path, name: &str) {
        let bytes = fs::read(shared_fixture().join(name)).unwrap();
        let out = File::create(dir.join(format!("{}.gz", name))).unwrap();
        let mut encoder = GzEncoder::new(out, Compression::fast());
        encoder.write_all(&bytes).unwrap();
        encoder.finish().unwrap();
    }

    #[test]
    fn test_load_applies_caps_from_the_start_of_each_file() {
        let dir = tempfile::TempDir::new().unwrap();
        write_fixture(dir.path());

        let dataset = DigitDataset::load(dir.path(), Some(20), Some(7)).unwrap();
        assert_eq!(dataset.train.len(), 20);
        assert_eq!(dataset.test.len(), 7);
        assert_eq!(dataset.train.label(3), Some(3));
        assert!(dataset.train.image(3).unwrap().iter().all(|&v| v == 75));
        assert!(dataset.train.image(20).is_none());

        // 検証用はt10kの先頭から
        assert_eq!(dataset.test.label(0), Some(1));
        assert_eq!(dataset.test.label(6), Some(7));
    }

    #[test]
    fn test_gzip_files_are_extracted() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in [TRAIN_IMAGES, TRAIN_LABELS] {
            fs::hard_link(shared_fixture().join(name), dir.path().join(name))
                .or_else(|_| fs::copy(shared_fixture().join(name), dir.path().join(name)).map(|_| ()))
                .unwrap();
        }
        gzip_into(dir.path(), TEST_IMAGES);
        gzip_into(dir.path(), TEST_LABELS);

        let dataset = DigitDataset::load(dir.path(), Some(5), Some(5)).unwrap();
        assert_eq!(dataset.test.len(), 5);
        assert!(dir.path().join(TEST_IMAGES).is_file());
        assert!(!dir.path().join("t10k-images-idx3-ubyte.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = DigitDataset::load(dir.path(), None, None).unwrap_err();
        assert!(matches!(err, LabError::Dataset(_)));
        assert!(err.to_string().contains(TRAIN_IMAGES));
    }

    #[test]
    fn test_huge_count_in_header_is_a_dataset_error() {
        let dir = tempfile::TempDir::new().unwrap();
        write_fixture(dir.path());

        let mut bytes = Vec::new();
        for value in [IMAGES_MAGIC, u32::MAX, 28, 28] {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        bytes.extend_from_slice(&[0u8; 100]);
        fs::remove_file(dir.path().join(TRAIN_IMAGES)).unwrap();
        fs::write(dir.path().join(TRAIN_IMAGES), bytes).unwrap();

        let err = DigitDataset::load(dir.path(), Some(10), Some(10)).unwrap_err();
        assert!(matches!(err, LabError::Dataset(_)));
    }

    #[test]
    fn test_header_count_mismatch_is_a_dataset_error() {
        let dir = tempfile::TempDir::new().unwrap();
        write_fixture(dir.path());

        // サイズは正しいがヘッダの件数が違う
        let labels = &IDX_FILES[1];
        fs::remove_file(dir.path().join(labels.name)).unwrap();
        fs::write(
            dir.path().join(labels.name),
            idx_bytes(labels, labels.count as u32 - 1),
        )
        .unwrap();

        let err = DigitDataset::load(dir.path(), Some(10), Some(10)).unwrap_err();
        assert!(matches!(err, LabError::Dataset(_)));
    }

    #[test]
    fn test_from_parts_validates_shape_and_labels() {
        assert!(DigitSplit::from_parts(vec![0; 10], vec![1]).is_err());
        assert!(DigitSplit::from_parts(vec![0; IMAGE_PIXELS], vec![10]).is_err());
    }
}
