//! 学習パイプライン全体の段取り
//!
//! 収集 → ラベル付け・件数チェック → コーパス書き込み → 学習・公開 を1回の実行として行う。
//! 新しい実行は前の実行を取り消し、前の実行が終わるのを待ってからコーパスに触る。

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::corpus::TrainingCorpus;
use crate::dataset::DatasetBuilder;
use crate::error::{PipelineError, Result};
use crate::fetcher::ImageFetcher;
use crate::library::{KeptPhotoStore, PhotoLibrary};
use crate::ml::{ProgressObserver, TrainingProgress};
use crate::model::{AppConfig, ArtifactStore, ClassifierMetadata, TrainingParameters};
use crate::preprocess::ImagePreprocessor;
use crate::runner::ClassifierRunner;
use crate::trainer::{ClassifierTrainer, TrainingJobState};
use crate::types::ImageSize;

/// 実行中の段階
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorPhase {
    Idle,
    Gathering,
    Preprocessing,
    Training,
}

/// 実行のきっかけ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingTrigger {
    /// アルバム画面の初回表示
    AlbumAppeared,
    /// 写真ピッカーを閉じた
    PickerDismissed,
}

/// 1回の実行結果
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Published(ClassifierMetadata),
    InsufficientData { kept: usize, discarded: usize },
    Cancelled,
}

struct ActiveRun {
    cancel: CancellationToken,
    /// 実行が終わると取り消される
    done: CancellationToken,
}

struct Inner {
    library: Arc<dyn PhotoLibrary>,
    records: Arc<dyn KeptPhotoStore>,
    fetcher: ImageFetcher,
    preprocessor: ImagePreprocessor,
    dataset: DatasetBuilder,
    corpus: TrainingCorpus,
    trainer: ClassifierTrainer,
    params: TrainingParameters,
    phase: watch::Sender<OrchestratorPhase>,
    active: Mutex<Option<ActiveRun>>,
}

/// 学習パイプラインの司令塔
#[derive(Clone)]
pub struct TrainingOrchestrator {
    inner: Arc<Inner>,
}

impl TrainingOrchestrator {
    pub fn new(config: &AppConfig, library: Arc<dyn PhotoLibrary>, records: Arc<dyn KeptPhotoStore>) -> Self {
        let (phase, _) = watch::channel(OrchestratorPhase::Idle);
        let store = ArtifactStore::new(config.storage.classifier_path());

        Self {
            inner: Arc::new(Inner {
                fetcher: ImageFetcher::new(Arc::clone(&library)),
                library,
                records,
                preprocessor: ImagePreprocessor::new(ImageSize::square(config.dataset.corpus_image_size)),
                dataset: DatasetBuilder::new(config.dataset.min_samples_per_class),
                corpus: TrainingCorpus::new(config.storage.training_data_dir()),
                trainer: ClassifierTrainer::new(store),
                params: config.training_parameters(),
                phase,
                active: Mutex::new(None),
            }),
        }
    }

    pub fn library(&self) -> &Arc<dyn PhotoLibrary> {
        &self.inner.library
    }

    pub fn records(&self) -> &Arc<dyn KeptPhotoStore> {
        &self.inner.records
    }

    pub fn fetcher(&self) -> &ImageFetcher {
        &self.inner.fetcher
    }

    pub fn corpus(&self) -> &TrainingCorpus {
        &self.inner.corpus
    }

    pub fn store(&self) -> &ArtifactStore {
        self.inner.trainer.store()
    }

    /// 公開済み成果物を読む実行器
    pub fn runner(&self) -> ClassifierRunner {
        ClassifierRunner::new(self.store().clone())
    }

    pub fn phase(&self) -> OrchestratorPhase {
        *self.inner.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<OrchestratorPhase> {
        self.inner.phase.subscribe()
    }

    pub fn subscribe_training(&self) -> watch::Receiver<TrainingJobState> {
        self.inner.trainer.subscribe()
    }

    fn set_phase(&self, phase: OrchestratorPhase) {
        tracing::debug!(phase = ?phase, "orchestrator phase");
        self.inner.phase.send_replace(phase);
    }

    fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// 実行をバックグラウンドで開始する
    ///
    /// 実行中のものがあれば取り消し、それが終わってから始める。失敗はログに残すだけで、
    /// 戻り値のハンドルで結果を確認できる。
    pub fn trigger(&self, trigger: TrainingTrigger) -> JoinHandle<Result<RunOutcome>> {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let previous = {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            active.replace(ActiveRun {
                cancel: cancel.clone(),
                done: done.clone(),
            })
        };

        if let Some(previous) = &previous {
            tracing::info!(trigger = ?trigger, "superseding in-flight training run");
            previous.cancel.cancel();
        } else {
            tracing::info!(trigger = ?trigger, "training run triggered");
        }

        let this = self.clone();
        tokio::spawn(async move {
            let _finished = done.drop_guard();

            if let Some(previous) = previous {
                previous.done.cancelled().await;
            }

            let result = this.run(&cancel).await;
            match &result {
                Ok(RunOutcome::Published(metadata)) => {
                    tracing::info!(samples = metadata.total_samples(), accuracy = ?metadata.validation_accuracy, "training run published a classifier")
                }
                Ok(RunOutcome::InsufficientData { kept, discarded }) => {
                    tracing::info!(kept, discarded, "not enough training data yet")
                }
                Ok(RunOutcome::Cancelled) => tracing::info!("training run cancelled"),
                Err(e) => tracing::warn!(error = %e, "training run failed"),
            }
            result
        })
    }

    /// 実行中の処理を取り消す
    pub fn cancel_active(&self) {
        let active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(run) = active.as_ref() {
            run.cancel.cancel();
        }
    }

    /// 1回分のパイプラインを実行する
    ///
    /// データ不足と取り消しは正常な結果として返す。
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunOutcome> {
        let result = self.run_stages(cancel).await;
        self.set_phase(OrchestratorPhase::Idle);

        match result {
            Ok(metadata) => Ok(RunOutcome::Published(metadata)),
            Err(PipelineError::InsufficientData { kept, discarded, .. }) => {
                Ok(RunOutcome::InsufficientData { kept, discarded })
            }
            Err(PipelineError::Cancelled) => Ok(RunOutcome::Cancelled),
            Err(e) => Err(e),
        }
    }

    async fn run_stages(&self, cancel: &CancellationToken) -> Result<ClassifierMetadata> {
        let inner = &self.inner;

        self.set_phase(OrchestratorPhase::Gathering);
        Self::ensure_not_cancelled(cancel)?;

        let records = inner.records.fetch_kept_records().await?;
        let Some((oldest, latest)) = inner.records.oldest_and_latest_taken_at().await? else {
            return Err(PipelineError::InsufficientData {
                kept: 0,
                discarded: 0,
                required: inner.dataset.min_samples_per_class(),
            });
        };

        let photos = inner.library.fetch_photos_between(oldest, latest);
        tracing::info!(records = records.len(), photos = photos.len(), %oldest, %latest, "gathered photo timeline");

        let selections = inner.dataset.build_labeled_set(&records, &photos)?;
        Self::ensure_not_cancelled(cancel)?;

        self.set_phase(OrchestratorPhase::Preprocessing);
        inner
            .corpus
            .write(&selections, &inner.fetcher, &inner.preprocessor, cancel)
            .await?;
        Self::ensure_not_cancelled(cancel)?;

        self.set_phase(OrchestratorPhase::Training);
        let observer: Arc<ProgressObserver> = Arc::new(|progress: TrainingProgress| {
            tracing::debug!(phase = ?progress.phase, items = progress.item_count, "training progress");
        });
        inner
            .trainer
            .train(inner.corpus.root(), inner.params.clone(), cancel, observer)
            .await
    }
}
