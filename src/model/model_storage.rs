//! 分類器成果物の永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（ラベル、学習パラメータなど）
//! - model.bin       - モデルの重み（バイナリ）
//!
//! 公開は同じディレクトリの一時ファイルに書いてから rename で置き換えるため、
//! 読み手が書きかけの成果物を見ることはない。

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::error::PipelineError;
use crate::model::model_metadata::ClassifierMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const WEIGHTS_ENTRY: &str = "model.bin";

/// 学習済み分類器（メタデータ + 重み）
#[derive(Debug, Clone)]
pub struct CompiledClassifier {
    pub metadata: ClassifierMetadata,
    pub weights: Vec<u8>,
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// メタデータと共にモデルをTar.gz形式で書き出す
pub fn save_model_with_metadata<W: Write>(
    writer: W,
    metadata: &ClassifierMetadata,
    model_binary: &[u8],
) -> Result<W> {
    // Gzip圧縮を設定
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, WEIGHTS_ENTRY, model_binary)?;

    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?;
    encoder.finish().context("Failed to finalize gzip stream")
}

/// Tar.gzからメタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata<R: Read>(reader: R) -> Result<(ClassifierMetadata, Vec<u8>)> {
    let decoder = GzDecoder::new(reader);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt: Option<ClassifierMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ClassifierMetadata::from_json_string(&json_str)?);
            }
            Some(WEIGHTS_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// 公開済み分類器の置き場
///
/// 初期状態は「成果物なし」。`publish` の成功時にのみ内容が置き換わる。
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    path: PathBuf,
}

impl ArtifactStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// 成果物を原子的に置き換える
    pub fn publish(&self, classifier: &CompiledClassifier) -> std::result::Result<(), PipelineError> {
        let replace_failure = |source: std::io::Error| PipelineError::ArtifactReplaceFailure {
            path: self.path.clone(),
            source,
        };

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(replace_failure)?;

        // 同一ファイルシステム上の一時ファイルに書く（renameを原子的にするため）
        let temp = tempfile::Builder::new()
            .prefix(".classifier-")
            .suffix(".partial")
            .tempfile_in(parent)
            .map_err(replace_failure)?;

        let temp = save_model_with_metadata(temp, &classifier.metadata, &classifier.weights)
            .map_err(|e| replace_failure(std::io::Error::other(format!("{:#}", e))))?;
        temp.as_file().sync_all().map_err(replace_failure)?;

        temp.persist(&self.path).map_err(|e| replace_failure(e.error))?;

        tracing::info!(
            path = %self.path.display(),
            weights_bytes = classifier.weights.len(),
            trained_at = %classifier.metadata.trained_at,
            "classifier artifact published"
        );
        Ok(())
    }

    /// 公開済みの成果物を読み込む
    pub fn load(&self) -> std::result::Result<CompiledClassifier, PipelineError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::NoModelAvailable {
                    path: self.path.clone(),
                })
            }
            Err(e) => return Err(PipelineError::invalid_artifact(e)),
        };

        let (metadata, weights) = load_model_with_metadata(file)
            .with_context(|| format!("Failed to read classifier artifact: {:?}", self.path))
            .map_err(PipelineError::invalid_artifact)?;

        Ok(CompiledClassifier { metadata, weights })
    }

    /// 公開済みメタデータの要約をログに出す
    pub fn log_metadata_info(&self) {
        match self.load() {
            Ok(classifier) => {
                let metadata = &classifier.metadata;
                tracing::info!(
                    labels = %metadata.class_labels.join(", "),
                    model_input_size = metadata.model_input_size,
                    samples = metadata.total_samples(),
                    max_iterations = metadata.parameters.max_iterations,
                    validation_accuracy = ?metadata.validation_accuracy,
                    trained_at = %metadata.trained_at,
                    "published classifier"
                );
            }
            Err(e) => tracing::info!(error = %e, "no published classifier"),
        }
    }
}
