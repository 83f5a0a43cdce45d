//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（アーキテクチャ、ラベルレジストリなど）
//! - model.bin       - モデルの重み（バイナリ）
//!
//! 保存は同じディレクトリの一時ファイルに書き出してからリネームするため、
//! 書き込み途中のアーティファクトが読み込まれることはありません。

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use tracing::{debug, info};

use crate::error::{ClassifierError, LoadError};
use crate::ml::ml_model::PlantClassifier;
use crate::model::model_metadata::ModelMetadata;

pub const METADATA_ENTRY: &str = "metadata.json";
pub const MODEL_ENTRY: &str = "model.bin";

/// 保存先のパスを決定（.gzで終わっていなければ .tar.gz を付ける）
pub fn artifact_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// 学習済みモデルをメタデータと共に保存
///
/// 重みはf32精度のままMessagePack形式でバイナリ化します。
pub fn save_model<B: Backend>(
    output_path: &Path,
    model: &PlantClassifier<B>,
    metadata: &ModelMetadata,
) -> Result<PathBuf, ClassifierError> {
    let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary = Recorder::<B>::record(&recorder, model.clone().into_record(), ()).map_err(|e| {
        ClassifierError::Persist {
            path: output_path.to_path_buf(),
            source: io::Error::other(format!("failed to serialize model weights: {:?}", e)),
        }
    })?;

    save_model_with_metadata(output_path, metadata, &model_binary)
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 1つのtar.gzファイルに以下を含む：
/// - metadata.json : メタデータ
/// - model.bin : モデルの重み
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf, ClassifierError> {
    let tar_gz_path = artifact_path(output_path);
    let persist_err = |source: io::Error| ClassifierError::Persist {
        path: tar_gz_path.clone(),
        source,
    };

    let json_str = metadata.to_json_string().map_err(|e| persist_err(io::Error::other(e)))?;

    // 親ディレクトリが存在しない場合は作成
    let parent = match tar_gz_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent).map_err(persist_err)?;

    // 同じディレクトリに一時ファイルを作成（失敗時はドロップで削除される）
    let temp = tempfile::NamedTempFile::new_in(&parent).map_err(persist_err)?;

    write_archive(temp.as_file(), json_str.as_bytes(), model_binary).map_err(persist_err)?;
    temp.as_file().sync_all().map_err(persist_err)?;

    temp.persist(&tar_gz_path).map_err(|e| persist_err(e.error))?;

    info!(
        "モデルを保存しました: {} (重み {:.2} MB)",
        tar_gz_path.display(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );
    Ok(tar_gz_path)
}

fn write_archive<W: Write>(writer: W, metadata_json: &[u8], model_binary: &[u8]) -> io::Result<()> {
    // Gzip圧縮を設定
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    append_entry(&mut tar_builder, METADATA_ENTRY, metadata_json)?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    // tarアーカイブとgzipストリームを完成させる
    let encoder = tar_builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data)
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>, LoadError> {
    if !tar_gz_path.exists() {
        return Err(LoadError::NotFound(tar_gz_path.to_path_buf()));
    }
    let tar_gz_file = File::open(tar_gz_path).map_err(|source| LoadError::Archive {
        path: tar_gz_path.to_path_buf(),
        source,
    })?;
    Ok(Archive::new(GzDecoder::new(tar_gz_file)))
}

/// アーカイブ内の各エントリを読み込み、必要なものだけ取り出す
fn read_entries(
    tar_gz_path: &Path,
    want_metadata: bool,
    want_model: bool,
) -> Result<(Option<ModelMetadata>, Option<Vec<u8>>), LoadError> {
    let archive_err = |source| LoadError::Archive {
        path: tar_gz_path.to_path_buf(),
        source,
    };
    let mut archive = open_archive(tar_gz_path)?;

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        let path = entry.path().map_err(archive_err)?.to_string_lossy().to_string();

        match path.as_str() {
            METADATA_ENTRY if want_metadata => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str).map_err(archive_err)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            MODEL_ENTRY if want_model => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer).map_err(archive_err)?;
                model_binary_opt = Some(buffer);
            }
            other => debug!("アーカイブ内の未使用エントリ: {}", other),
        }

        if (!want_metadata || metadata_opt.is_some()) && (!want_model || model_binary_opt.is_some()) {
            break;
        }
    }

    Ok((metadata_opt, model_binary_opt))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata, LoadError> {
    read_entries(tar_gz_path, true, false)?
        .0
        .ok_or(LoadError::MissingEntry(METADATA_ENTRY))
}

/// Tar.gzからモデルバイナリを読み込む
pub fn load_model_binary(tar_gz_path: &Path) -> Result<Vec<u8>, LoadError> {
    read_entries(tar_gz_path, false, true)?
        .1
        .ok_or(LoadError::MissingEntry(MODEL_ENTRY))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>), LoadError> {
    match read_entries(tar_gz_path, true, true)? {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(LoadError::MissingEntry(METADATA_ENTRY)),
        (_, None) => Err(LoadError::MissingEntry(MODEL_ENTRY)),
    }
}

/// メタデータをログに出力
pub fn print_metadata_info(metadata: &ModelMetadata) {
    info!("=== モデルメタデータ ===");
    info!("形式バージョン: {}", metadata.format_version);
    info!("モデル入力サイズ: {0}x{0}", metadata.architecture.image_size);
    info!("クラス数（出力幅）: {}", metadata.architecture.num_classes);
    info!("ラベル数: {}", metadata.labels.len());
    for (index, label) in metadata.labels.labels().iter().enumerate() {
        info!("  {:>3}: {}", index, label);
    }
    info!("学習エポック数: {}", metadata.num_epochs);
    info!("学習日時: {}", metadata.trained_at);
    if let Some(metrics) = &metadata.final_metrics {
        info!(
            "最終指標: train loss {:.4} / acc {:.2}%, val loss {:.4} / acc {:.2}%",
            metrics.train_loss,
            metrics.train_accuracy * 100.0,
            metrics.val_loss,
            metrics.val_accuracy * 100.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ml_model::ModelConfig;
    use crate::model::label_registry::LabelRegistry;

    fn sample_metadata() -> ModelMetadata {
        let labels = LabelRegistry::from_class_dirs(["Apple_scab", "Apple_healthy", "Grape_black_rot"]).unwrap();
        ModelMetadata::new(ModelConfig::new(3), labels, 5)
    }

    #[test]
    fn test_artifact_path() {
        assert_eq!(artifact_path(Path::new("out/model")), PathBuf::from("out/model.tar.gz"));
        assert_eq!(artifact_path(Path::new("out/model.tar.gz")), PathBuf::from("out/model.tar.gz"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = sample_metadata();
        let binary = vec![1u8, 2, 3, 4, 5];

        let path = save_model_with_metadata(&dir.path().join("nested/model"), &metadata, &binary).unwrap();
        assert!(path.ends_with("nested/model.tar.gz"));

        let (loaded, loaded_binary) = load_model_with_metadata(&path).unwrap();
        assert_eq!(loaded_binary, binary);
        assert_eq!(loaded.labels, metadata.labels);
        assert_eq!(load_metadata(&path).unwrap().labels.labels(), metadata.labels.labels());
        assert_eq!(load_model_binary(&path).unwrap(), binary);

        // 一時ファイルが残っていないこと
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_overwrite_replaces_whole_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");

        save_model_with_metadata(&path, &sample_metadata(), &[1, 1, 1]).unwrap();
        save_model_with_metadata(&path, &sample_metadata(), &[2, 2]).unwrap();
        assert_eq!(load_model_binary(&path).unwrap(), vec![2, 2]);
    }

    #[test]
    fn test_missing_and_corrupt_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_metadata(&dir.path().join("nope.tar.gz")),
            Err(LoadError::NotFound(_))
        ));

        let corrupt = dir.path().join("corrupt.tar.gz");
        std::fs::write(&corrupt, b"definitely not gzip").unwrap();
        assert!(matches!(load_model_with_metadata(&corrupt), Err(LoadError::Archive { .. })));
    }

    #[test]
    fn test_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.tar.gz");
        let file = File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = Builder::new(encoder);
        append_entry(&mut builder, MODEL_ENTRY, &[0u8; 4]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        assert!(matches!(
            load_model_with_metadata(&path),
            Err(LoadError::MissingEntry(METADATA_ENTRY))
        ));
    }

    #[test]
    fn test_failed_save_leaves_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        save_model_with_metadata(&path, &sample_metadata(), &[9, 9]).unwrap();

        // 保存先がディレクトリのためリネームに失敗する
        let blocked = dir.path().join("blocked.tar.gz");
        std::fs::create_dir(&blocked).unwrap();
        std::fs::write(blocked.join("keep"), b"x").unwrap();
        let result = save_model_with_metadata(&blocked, &sample_metadata(), &[1]);
        assert!(matches!(result, Err(ClassifierError::Persist { .. })));

        assert_eq!(load_model_binary(&path).unwrap(), vec![9, 9]);
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .count();
        assert_eq!(leftovers, 1);
    }
}
