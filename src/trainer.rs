//! 学習ジョブの実行と成果物の公開

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};
use crate::ml::{train_classifier, ProgressObserver};
use crate::model::{ArtifactStore, ClassifierMetadata, TrainingParameters};

/// 学習ジョブの状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainingJobState {
    Idle,
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
}

/// 分類器の学習器
///
/// 成功したジョブだけが公開済みの成果物を置き換える。
pub struct ClassifierTrainer {
    store: ArtifactStore,
    state: watch::Sender<TrainingJobState>,
}

impl ClassifierTrainer {
    pub fn new(store: ArtifactStore) -> Self {
        let (state, _) = watch::channel(TrainingJobState::Idle);
        Self { store, state }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn subscribe(&self) -> watch::Receiver<TrainingJobState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> TrainingJobState {
        self.state.borrow().clone()
    }

    /// コーパスから学習して成果物を公開する
    ///
    /// 計算はブロッキングスレッドで行う。キャンセルはジョブ投入前とバッチごと、公開直前に確認する。
    pub async fn train(
        &self,
        corpus_dir: &Path,
        params: TrainingParameters,
        cancel: &CancellationToken,
        observer: Arc<ProgressObserver>,
    ) -> Result<ClassifierMetadata> {
        if cancel.is_cancelled() {
            self.state.send_replace(TrainingJobState::Cancelled);
            return Err(PipelineError::Cancelled);
        }

        self.state.send_replace(TrainingJobState::Running);
        let result = self.run_job(corpus_dir, params, cancel, observer).await;

        let next = match &result {
            Ok(_) => TrainingJobState::Succeeded,
            Err(PipelineError::Cancelled) => TrainingJobState::Cancelled,
            Err(e) => TrainingJobState::Failed(e.to_string()),
        };
        tracing::info!(state = ?next, "training job finished");
        self.state.send_replace(next);

        result
    }

    async fn run_job(
        &self,
        corpus_dir: &Path,
        params: TrainingParameters,
        cancel: &CancellationToken,
        observer: Arc<ProgressObserver>,
    ) -> Result<ClassifierMetadata> {
        let corpus_dir = corpus_dir.to_path_buf();
        let job_cancel = cancel.clone();

        let classifier = tokio::task::spawn_blocking(move || {
            train_classifier(&corpus_dir, &params, &job_cancel, observer.as_ref())
        })
        .await
        .map_err(|e| PipelineError::training(format!("training worker stopped: {}", e)))??;

        // 学習完了後に取り消された場合は公開しない
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let metadata = classifier.metadata.clone();
        let store = self.store.clone();
        let path = store.path().to_path_buf();
        tokio::task::spawn_blocking(move || store.publish(&classifier))
            .await
            .map_err(|e| PipelineError::ArtifactReplaceFailure {
                path,
                source: std::io::Error::other(e),
            })??;

        Ok(metadata)
    }
}
