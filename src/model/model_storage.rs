//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（アーキテクチャ、run_id、精度など）
//! - model.bin       - モデルの重み（バイナリ）
//!
//! 保存は一時ファイルへ書き出してからリネームするため、
//! 途中で失敗しても最終パスに壊れたファイルは残りません。

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::{debug, info};

use crate::error::{LabError, Result};
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 書き込み途中のファイルパス
fn staging_path(output_path: &Path) -> PathBuf {
    let mut name = output_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    output_path.with_file_name(name)
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)
}

fn write_archive(path: &Path, metadata: &ModelMetadata, model_binary: &[u8]) -> Result<()> {
    let file = File::create(path)?;

    // Gzip圧縮を設定
    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    // tarとgzipの両方を閉じてからディスクへ同期
    let encoder = tar_builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;
    Ok(())
}

/// メタデータと共にモデルをTar.gz形式で保存
pub fn save_artifact(output_path: &Path, metadata: &ModelMetadata, model_binary: &[u8]) -> Result<()> {
    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LabError::artifact(parent, format!("ディレクトリを作成できません: {}", e)))?;
        }
    }

    let staging = staging_path(output_path);
    debug!(staging = %staging.display(), "一時ファイルへ書き込みます");

    if let Err(e) = write_archive(&staging, metadata, model_binary) {
        std::fs::remove_file(&staging).ok();
        return Err(LabError::artifact(output_path, e.to_string()));
    }

    std::fs::rename(&staging, output_path).map_err(|e| {
        std::fs::remove_file(&staging).ok();
        LabError::artifact(output_path, format!("リネームに失敗しました: {}", e))
    })?;

    info!(
        path = %output_path.display(),
        bytes = model_binary.len(),
        "モデルを保存しました"
    );
    Ok(())
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    if !tar_gz_path.is_file() {
        return Err(LabError::artifact(tar_gz_path, "ファイルが存在しません"));
    }
    let file = File::open(tar_gz_path).map_err(|e| LabError::artifact(tar_gz_path, e.to_string()))?;
    Ok(Archive::new(GzDecoder::new(file)))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_artifact(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut archive = open_archive(tar_gz_path)?;
    let corrupt = |e: std::io::Error| LabError::artifact(tar_gz_path, format!("アーカイブが壊れています: {}", e));

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let name = entry.path().map_err(corrupt)?.to_string_lossy().to_string();

        match name.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str).map_err(corrupt)?;
                let metadata = ModelMetadata::from_json_string(&json_str)
                    .map_err(|e| LabError::artifact(tar_gz_path, e.to_string()))?;
                metadata_opt = Some(metadata);
            }
            MODEL_ENTRY => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer).map_err(corrupt)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(LabError::artifact(tar_gz_path, "metadata.json がありません")),
        (_, None) => Err(LabError::artifact(tar_gz_path, "model.bin がありません")),
    }
}

/// メタデータのみ読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    load_artifact(tar_gz_path).map(|(metadata, _)| metadata)
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("アーキテクチャ: {}", metadata.architecture);
    println!("Run ID: {}", metadata.run_id);
    println!("学習エポック数: {}", metadata.num_epochs);
    println!("バッチサイズ: {}", metadata.batch_size);
    println!("検証精度: {:.2}%", metadata.val_accuracy * 100.0);
    println!("モデル入力サイズ: {}x{}", metadata.model_input_size, metadata.model_input_size);
    println!("クラス数: {}", metadata.num_classes);
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}
