//! 学習パイプライン全体の結合テスト

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use image::{DynamicImage, Rgb, RgbImage};
use photo_selector_lib::{
    AlbumService, AppConfig, ClassifierRunner, DeviceType, InMemoryKeptPhotoStore, InMemoryPhotoLibrary,
    KeptPhotoRecord, Photo, PipelineError, RunOutcome, SelectionLabel, TrainingOrchestrator, TrainingTrigger,
};
use tokio_util::sync::CancellationToken;

fn reddish(seed: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(80, 60, |x, y| {
        Rgb([200 + ((x + seed) % 40) as u8, 30 + (y % 20) as u8, 40])
    }))
}

fn bluish(seed: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(60, 80, |x, y| {
        Rgb([30 + (x % 20) as u8, 40, 200 + ((y + seed) % 40) as u8])
    }))
}

fn config(root: &Path) -> AppConfig {
    let mut config = AppConfig::with_root(root);
    config.device_type = DeviceType::Cpu;
    config.dataset.corpus_image_size = 64;
    config.training.max_iterations = 2;
    config.training.batch_size = 8;
    config.training.model_input_size = 32;
    config
}

/// kept は4時間おき、discarded はその期間内に1時間おきに並べる
fn library(kept: u32, discarded: u32) -> (InMemoryPhotoLibrary, Vec<Photo>, Vec<Photo>) {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
    let mut library = InMemoryPhotoLibrary::new();
    let mut kept_photos = Vec::new();
    let mut discarded_photos = Vec::new();

    for i in 0..kept {
        let photo = Photo::new(format!("kept-{}", i), base + Duration::hours(4 * i as i64));
        library.insert(photo.clone(), reddish(i));
        kept_photos.push(photo);
    }
    for i in 0..discarded {
        let photo = Photo::new(format!("discarded-{}", i), base + Duration::minutes(30 + 60 * i as i64));
        library.insert(photo.clone(), bluish(i));
        discarded_photos.push(photo);
    }

    (library, kept_photos, discarded_photos)
}

fn orchestrator(config: &AppConfig, kept: u32, discarded: u32) -> TrainingOrchestrator {
    let (library, kept_photos, _) = library(kept, discarded);
    let records = kept_photos.iter().map(KeptPhotoRecord::from_photo).collect();
    TrainingOrchestrator::new(
        config,
        Arc::new(library),
        Arc::new(InMemoryKeptPhotoStore::with_records(records)),
    )
}

fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn classify_fails_until_a_run_publishes() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let orchestrator = orchestrator(&config, 24, 30);
    let runner = ClassifierRunner::new(orchestrator.store().clone());

    let err = runner.classify(&reddish(0)).unwrap_err();
    assert!(matches!(err, PipelineError::NoModelAvailable { .. }));

    let outcome = orchestrator.run(&CancellationToken::new()).await.unwrap();
    let metadata = match outcome {
        RunOutcome::Published(metadata) => metadata,
        other => panic!("expected a published classifier, got {:?}", other),
    };
    assert_eq!(metadata.class_labels, vec!["kept", "discarded"]);
    assert_eq!(metadata.samples_per_class, vec![24, 24]);
    assert_eq!(metadata.model_input_size, 32);

    let label = runner.classify(&reddish(3)).unwrap();
    assert!(SelectionLabel::ALL.contains(&label));
}

#[tokio::test]
async fn corpus_holds_only_current_run_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let training_data = config.storage.training_data_dir();

    std::fs::create_dir_all(training_data.join("kept")).unwrap();
    std::fs::write(training_data.join("kept").join("leftover.jpg"), b"stale").unwrap();
    std::fs::create_dir_all(training_data.join("unrelated")).unwrap();

    let orchestrator = orchestrator(&config, 21, 40);
    orchestrator.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(file_count(&training_data.join("kept")), 21);
    assert_eq!(file_count(&training_data.join("discarded")), 21);
    assert!(!training_data.join("kept").join("leftover.jpg").exists());
    assert!(!training_data.join("unrelated").exists());
}

#[tokio::test]
async fn cancel_before_submission_leaves_no_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let orchestrator = orchestrator(&config, 24, 24);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = orchestrator.run(&cancel).await.unwrap();

    assert_eq!(outcome, RunOutcome::Cancelled);
    assert!(!config.storage.classifier_path().exists());
}

#[tokio::test]
async fn failed_run_keeps_previous_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let first = orchestrator(&config, 22, 22);
    assert!(matches!(
        first.run(&CancellationToken::new()).await.unwrap(),
        RunOutcome::Published(_)
    ));
    let before = std::fs::read(config.storage.classifier_path()).unwrap();

    let mut broken = config.clone();
    broken.training.feature_extractor_revision = 7;
    let second = orchestrator(&broken, 22, 22);
    let err = second.run(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, PipelineError::TrainingJobFailure { .. }));
    assert_eq!(std::fs::read(config.storage.classifier_path()).unwrap(), before);
}

#[tokio::test]
async fn insufficient_data_is_a_quiet_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let orchestrator = orchestrator(&config, 19, 50);

    let outcome = orchestrator.trigger(TrainingTrigger::AlbumAppeared).await.unwrap().unwrap();
    assert!(matches!(outcome, RunOutcome::InsufficientData { kept: 19, .. }));
    assert!(!config.storage.classifier_path().exists());
}

#[tokio::test]
async fn new_trigger_supersedes_in_flight_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let orchestrator = orchestrator(&config, 20, 20);

    // 単一スレッドのランタイムなので、1本目が走り出す前に2本目が取り消す
    let first = orchestrator.trigger(TrainingTrigger::AlbumAppeared);
    let second = orchestrator.trigger(TrainingTrigger::PickerDismissed);

    assert_eq!(first.await.unwrap().unwrap(), RunOutcome::Cancelled);
    assert!(matches!(second.await.unwrap().unwrap(), RunOutcome::Published(_)));
    assert!(config.storage.classifier_path().exists());
}

#[tokio::test]
async fn album_flow_trains_and_enables_auto_select() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let (library, kept_photos, discarded_photos) = library(25, 25);

    let service = AlbumService::new(&config, Arc::new(library), Arc::new(InMemoryKeptPhotoStore::new()));
    assert!(!service.can_auto_select());

    service.share_to_album(&kept_photos).await.unwrap();
    let (album, handle) = service.on_picker_dismissed().await.unwrap();
    assert_eq!(album.len(), 25);
    assert!(matches!(handle.await.unwrap().unwrap(), RunOutcome::Published(_)));

    assert!(service.can_auto_select());
    let candidates = service.picker_candidates().await.unwrap();
    assert_eq!(candidates.len(), discarded_photos.len());

    let selected = service.auto_select(&candidates).await.unwrap();
    assert!(selected.len() <= candidates.len());
    assert!(selected.iter().all(|p| candidates.contains(p)));
}
