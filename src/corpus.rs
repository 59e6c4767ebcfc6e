//! 学習コーパス（ラベル別ディレクトリに置いた前処理済み画像）
//!
//! ```text
//! TrainingData/
//!   kept/<uuid>.jpg
//!   discarded/<uuid>.jpg
//! ```
//!
//! 書き込みのたびに作り直し、前回の内容とは混ぜない。

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::fetcher::ImageFetcher;
use crate::preprocess::ImagePreprocessor;
use crate::types::{PhotoSelection, SelectionLabel};

/// 書き込み結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusSummary {
    pub root: PathBuf,
    pub kept: usize,
    pub discarded: usize,
}

impl CorpusSummary {
    pub fn total(&self) -> usize {
        self.kept + self.discarded
    }
}

/// 学習コーパスのディレクトリ
#[derive(Debug, Clone)]
pub struct TrainingCorpus {
    root: PathBuf,
}

impl TrainingCorpus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn label_dir(&self, label: SelectionLabel) -> PathBuf {
        self.root.join(label.as_str())
    }

    /// 空のコーパスを作り直す
    pub fn reset(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PipelineError::corpus_write(self.root.clone(), e)),
        }

        for label in SelectionLabel::ALL {
            let dir = self.label_dir(label);
            std::fs::create_dir_all(&dir).map_err(|e| PipelineError::corpus_write(dir.clone(), e))?;
        }
        Ok(())
    }

    /// 書きかけのコーパスを消す
    pub fn discard(&self) {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => tracing::debug!(root = %self.root.display(), "partial corpus removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(root = %self.root.display(), error = %e, "failed to remove partial corpus"),
        }
    }

    /// 選択された写真を順に取得・縮小・書き込みする
    ///
    /// 1枚ずつ処理し、次の写真に進む前に画像を手放す。途中で失敗したら作りかけのコーパスを消す。
    pub async fn write(
        &self,
        selections: &[PhotoSelection],
        fetcher: &ImageFetcher,
        preprocessor: &ImagePreprocessor,
        cancel: &CancellationToken,
    ) -> Result<CorpusSummary> {
        let result = self.write_all(selections, fetcher, preprocessor, cancel).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "corpus write aborted");
            self.discard();
        }
        result
    }

    async fn write_all(
        &self,
        selections: &[PhotoSelection],
        fetcher: &ImageFetcher,
        preprocessor: &ImagePreprocessor,
        cancel: &CancellationToken,
    ) -> Result<CorpusSummary> {
        self.reset()?;

        let mut summary = CorpusSummary {
            root: self.root.clone(),
            kept: 0,
            discarded: 0,
        };

        for selection in selections {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let image = fetcher.fetch_full_resolution(&selection.photo).await?;
            let path = self.label_dir(selection.label).join(format!("{}.jpg", Uuid::new_v4()));

            let preprocessor = *preprocessor;
            let target = path.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let bytes = preprocessor
                    .process(&image)
                    .map_err(|e| PipelineError::corpus_write(target.clone(), e))?;
                std::fs::write(&target, bytes).map_err(|e| PipelineError::corpus_write(target.clone(), e))
            })
            .await
            .map_err(|e| PipelineError::corpus_write(path.clone(), e))??;

            match selection.label {
                SelectionLabel::Kept => summary.kept += 1,
                SelectionLabel::Discarded => summary.discarded += 1,
            }
            tracing::debug!(photo_id = %selection.photo.id, label = %selection.label, path = %path.display(), "corpus image written");
        }

        tracing::info!(kept = summary.kept, discarded = summary.discarded, root = %self.root.display(), "training corpus written");
        Ok(summary)
    }
}
