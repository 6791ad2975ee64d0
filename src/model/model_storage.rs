//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（ラベル順、スキーマ、評価結果など）
//! - model.bin       - モデルの重み（バイナリ）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::error::DetectorError;
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 同じディレクトリの一時ファイルに書き出してからリネームするため、
/// 読み込み側が書きかけのファイルを見ることはありません。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<()> {
    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    let temp_path = temp_path_for(output_path);
    let result = write_archive(&temp_path, metadata, model_binary).and_then(|()| {
        std::fs::rename(&temp_path, output_path)
            .context(format!("Failed to move model into place: {:?}", output_path))
    });

    if result.is_err() {
        std::fs::remove_file(&temp_path).ok();
    }
    result
}

fn temp_path_for(output_path: &Path) -> PathBuf {
    let file_name = output_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "model".to_string());
    output_path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()))
}

fn write_archive(path: &Path, metadata: &ModelMetadata, model_binary: &[u8]) -> Result<()> {
    let tar_gz_file =
        File::create(path).context(format!("Failed to create tar.gz file: {:?}", path))?;

    // Gzip圧縮を設定
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    // メタデータをJSONとして追加
    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())
        .context("Failed to add metadata.json to tar")?;

    // モデルバイナリを追加
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)
        .context("Failed to add model.bin to tar")?;

    // tarアーカイブを完成させる
    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?;
    let mut file = encoder.finish().context("Failed to finalize gzip stream")?;
    file.flush()?;
    file.sync_all()?;

    Ok(())
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append(&header, data)?;
    Ok(())
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>, DetectorError> {
    let file = File::open(tar_gz_path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => DetectorError::ArtifactNotFound(tar_gz_path.to_path_buf()),
        _ => DetectorError::io(tar_gz_path, e),
    })?;
    Ok(Archive::new(GzDecoder::new(file)))
}

fn corrupt(path: &Path, err: impl std::fmt::Display) -> DetectorError {
    DetectorError::artifact(path, err.to_string())
}

/// アーカイブ内のエントリを読み込む（`wanted` に含まれる名前のみ）
fn read_entries(
    tar_gz_path: &Path,
    wanted: &[&str],
) -> Result<Vec<(String, Vec<u8>)>, DetectorError> {
    let mut archive = open_archive(tar_gz_path)?;
    let mut found = Vec::new();

    let entries = archive.entries().map_err(|e| corrupt(tar_gz_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(tar_gz_path, e))?;
        let name = entry
            .path()
            .map_err(|e| corrupt(tar_gz_path, e))?
            .to_string_lossy()
            .to_string();

        if wanted.contains(&name.as_str()) {
            let mut buffer = Vec::new();
            entry
                .read_to_end(&mut buffer)
                .map_err(|e| corrupt(tar_gz_path, e))?;
            found.push((name, buffer));
            if found.len() == wanted.len() {
                break;
            }
        }
    }

    Ok(found)
}

fn take_entry(
    entries: &mut Vec<(String, Vec<u8>)>,
    name: &str,
    tar_gz_path: &Path,
) -> Result<Vec<u8>, DetectorError> {
    let index = entries
        .iter()
        .position(|(n, _)| n == name)
        .ok_or_else(|| corrupt(tar_gz_path, format!("{name} not found in tar.gz archive")))?;
    Ok(entries.swap_remove(index).1)
}

fn parse_metadata(bytes: &[u8], tar_gz_path: &Path) -> Result<ModelMetadata, DetectorError> {
    let json = std::str::from_utf8(bytes).map_err(|e| corrupt(tar_gz_path, e))?;
    ModelMetadata::from_json_string(json).map_err(|e| corrupt(tar_gz_path, format!("{e:#}")))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata, DetectorError> {
    let mut entries = read_entries(tar_gz_path, &[METADATA_ENTRY])?;
    let bytes = take_entry(&mut entries, METADATA_ENTRY, tar_gz_path)?;
    parse_metadata(&bytes, tar_gz_path)
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(
    tar_gz_path: &Path,
) -> Result<(ModelMetadata, Vec<u8>), DetectorError> {
    let mut entries = read_entries(tar_gz_path, &[METADATA_ENTRY, MODEL_ENTRY])?;
    let metadata_bytes = take_entry(&mut entries, METADATA_ENTRY, tar_gz_path)?;
    let binary = take_entry(&mut entries, MODEL_ENTRY, tar_gz_path)?;
    Ok((parse_metadata(&metadata_bytes, tar_gz_path)?, binary))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== Model metadata ===");
    println!("Format version: {}", metadata.format_version);
    println!("Labels (key order): {}", metadata.labels.labels().join(", "));
    println!("Architecture: {}", metadata.architecture);
    println!("Input size: {}x{}", metadata.image_size, metadata.image_size);
    println!("Schema:");
    for column in &metadata.schema {
        println!("  {}: {:?}", column.name, column.column_type);
    }
    let h = &metadata.hyperparameters;
    println!(
        "Epochs: {}, batch size: {}, learning rate: {}, seed: {}",
        h.epochs, h.batch_size, h.learning_rate, h.seed
    );
    println!("Train/validation: {}/{}", metadata.num_train, metadata.num_valid);
    match &metadata.metrics {
        Some(m) => {
            println!("Micro accuracy: {:.4}", m.micro_accuracy);
            println!("Macro accuracy: {:.4}", m.macro_accuracy);
            println!("Log loss: {:.4}", m.log_loss);
        }
        None => println!("Metrics: not available"),
    }
    println!("Trained at: {}", metadata.trained_at);
    println!("======================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::model_metadata::sample_metadata;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("model.tar.gz");
        let metadata = sample_metadata(&["hard_hat", "no_hard_hat"]);

        save_model_with_metadata(&path, &metadata, &[1, 2, 3, 4]).unwrap();
        assert!(path.exists());

        let (loaded, binary) = load_model_with_metadata(&path).unwrap();
        assert_eq!(loaded.labels.labels(), ["hard_hat", "no_hard_hat"]);
        assert_eq!(binary, vec![1, 2, 3, 4]);
        assert_eq!(load_metadata(&path).unwrap().num_classes(), 2);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        save_model_with_metadata(&path, &sample_metadata(&["a", "b"]), b"weights").unwrap();
        save_model_with_metadata(&path, &sample_metadata(&["a", "b"]), b"weights2").unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["model.tar.gz".to_string()]);
        assert_eq!(load_model_with_metadata(&path).unwrap().1, b"weights2");
    }

    #[test]
    fn test_missing_file_is_artifact_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_metadata(&dir.path().join("model.tar.gz")).unwrap_err();
        assert!(matches!(err, DetectorError::ArtifactNotFound(_)));
    }

    #[test]
    fn test_garbage_file_is_artifact_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        std::fs::write(&path, b"definitely not gzip").unwrap();
        let err = load_model_with_metadata(&path).unwrap_err();
        assert!(matches!(err, DetectorError::Artifact { .. }));
    }
}
