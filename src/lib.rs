mod types;

pub mod error;
pub mod logging;
pub mod model;
pub mod ml;
pub mod library;
pub mod preprocess;
pub mod fetcher;
pub mod dataset;
pub mod corpus;
pub mod trainer;
pub mod runner;
pub mod orchestrator;
pub mod album;

use std::path::Path;
use std::sync::Arc;

pub use album::{AlbumService, TrainingHandle};
pub use corpus::{CorpusSummary, TrainingCorpus};
pub use dataset::{DatasetBuilder, MIN_SAMPLES_PER_CLASS};
pub use error::{PipelineError, Result};
pub use fetcher::ImageFetcher;
pub use library::{InMemoryKeptPhotoStore, InMemoryPhotoLibrary, KeptPhotoStore, PhotoLibrary};
pub use ml::{TrainingPhase, TrainingProgress};
pub use model::{AppConfig, ArtifactStore, ClassifierMetadata, CompiledClassifier, DeviceType, TrainingParameters};
pub use orchestrator::{OrchestratorPhase, RunOutcome, TrainingOrchestrator, TrainingTrigger};
pub use preprocess::ImagePreprocessor;
pub use runner::ClassifierRunner;
pub use trainer::{ClassifierTrainer, TrainingJobState};
pub use types::{ImageQuality, ImageSize, KeptPhotoRecord, Photo, PhotoSelection, SelectionLabel, TargetSize};

/// ホストアプリからの起動
///
/// ログを初期化し、設定ファイル（無ければ既定値）を読み込んでサービスを組み立てる。
pub fn start(
    config_path: impl AsRef<Path>,
    library: Arc<dyn PhotoLibrary>,
    records: Arc<dyn KeptPhotoStore>,
) -> AlbumService {
    logging::init_tracing();

    let config = AppConfig::load_or_default(config_path);
    tracing::info!(
        device = %config.device_type,
        root = %config.storage.root_dir.display(),
        "photo selector starting"
    );

    let service = AlbumService::new(&config, library, records);
    service.orchestrator().store().log_metadata_info();
    service
}
