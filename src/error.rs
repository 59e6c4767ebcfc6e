use std::path::PathBuf;

use thiserror::Error;

/// 学習パイプラインと推論のエラー
#[derive(Error, Debug)]
pub enum PipelineError {
    /// 最低データ数に満たない（通常の no-op 結果）
    #[error("not enough training data: kept={kept}, discarded={discarded} (need {required} of each)")]
    InsufficientData {
        kept: usize,
        discarded: usize,
        required: usize,
    },

    #[error("image unavailable for photo {photo_id}: {reason}")]
    ImageUnavailable { photo_id: String, reason: String },

    #[error("failed to write training corpus at {path:?}")]
    CorpusWriteFailure {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("training job failed: {reason}")]
    TrainingJobFailure { reason: String },

    #[error("failed to replace classifier artifact at {path:?}")]
    ArtifactReplaceFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no trained classifier available at {path:?}")]
    NoModelAvailable { path: PathBuf },

    #[error("invalid classifier artifact: {reason}")]
    InvalidArtifact { reason: String },

    #[error("classification of photo {photo_id} failed: {reason}")]
    ClassificationFailure { photo_id: String, reason: String },

    #[error("batch insert failed: {reason}")]
    BatchInsertFailure { reason: String },

    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn corpus_write(
        path: impl Into<PathBuf>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::CorpusWriteFailure {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn training(reason: impl std::fmt::Display) -> Self {
        Self::TrainingJobFailure {
            reason: reason.to_string(),
        }
    }

    pub fn invalid_artifact(reason: impl std::fmt::Display) -> Self {
        Self::InvalidArtifact {
            reason: format!("{:#}", reason),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
