//! 公開済み分類器による推論

use std::collections::HashMap;

use image::DynamicImage;
use tokio::task::JoinSet;

use crate::error::{PipelineError, Result};
use crate::fetcher::ImageFetcher;
use crate::ml::CpuInferenceEngine;
use crate::model::ArtifactStore;
use crate::preprocess::MINIMUM_TRAINED_IMAGE_SIZE;
use crate::types::{ImageQuality, Photo, SelectionLabel, TargetSize};

/// 分類器の実行器
///
/// 共有の可変状態は持たないので、同時に何本呼び出してもよい。
#[derive(Debug, Clone)]
pub struct ClassifierRunner {
    store: ArtifactStore,
}

impl ClassifierRunner {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// 公開済みの分類器があるか
    pub fn is_available(&self) -> bool {
        self.store.exists()
    }

    /// 1枚の画像を分類する
    ///
    /// 呼び出しごとに公開済みの成果物を読み込む。無ければ `NoModelAvailable`。
    pub fn classify(&self, image: &DynamicImage) -> Result<SelectionLabel> {
        let classifier = self.store.load()?;
        CpuInferenceEngine::cpu(&classifier)?.classify(image)
    }

    /// 複数の写真を並行に分類する
    ///
    /// 成果物は最初に一度だけ読み込んでモデルを組み立てる。結果は完了順で、各写真の失敗は他に影響しない。
    /// 要求した写真にはすべて結果を返す。
    pub async fn classify_photos(
        &self,
        photos: Vec<Photo>,
        fetcher: &ImageFetcher,
    ) -> Result<Vec<(String, Result<SelectionLabel>)>> {
        let store = self.store.clone();
        let engine = tokio::task::spawn_blocking(move || -> Result<CpuInferenceEngine> {
            CpuInferenceEngine::cpu(&store.load()?)
        })
        .await
        .map_err(|e| PipelineError::invalid_artifact(format!("artifact loader stopped: {}", e)))??;

        let total = photos.len();
        let mut pending: HashMap<String, usize> = HashMap::new();
        let mut tasks = JoinSet::new();
        for photo in photos {
            *pending.entry(photo.id.clone()).or_default() += 1;
            let fetcher = fetcher.clone();
            let engine = engine.clone();
            tasks.spawn(async move {
                let result = classify_photo(&photo, &fetcher, engine).await;
                (photo.id, result)
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((photo_id, result)) => {
                    if let Err(e) = &result {
                        tracing::debug!(photo_id = %photo_id, error = %e, "photo not classified");
                    }
                    if let Some(count) = pending.get_mut(&photo_id) {
                        *count -= 1;
                    }
                    results.push((photo_id, result));
                }
                Err(e) => tracing::warn!(error = %e, "classification task failed"),
            }
        }

        // 結果を返さずに止まったタスクの写真
        for (photo_id, count) in pending {
            for _ in 0..count {
                results.push((
                    photo_id.clone(),
                    Err(PipelineError::ClassificationFailure {
                        photo_id: photo_id.clone(),
                        reason: "worker stopped before reporting".to_string(),
                    }),
                ));
            }
        }

        tracing::info!(requested = total, classified = results.iter().filter(|(_, r)| r.is_ok()).count(), "batch classification finished");
        Ok(results)
    }
}

async fn classify_photo(photo: &Photo, fetcher: &ImageFetcher, engine: CpuInferenceEngine) -> Result<SelectionLabel> {
    let image = fetcher
        .fetch(photo, TargetSize::Fit(MINIMUM_TRAINED_IMAGE_SIZE), ImageQuality::Fast)
        .await?;

    let photo_id = photo.id.clone();
    tokio::task::spawn_blocking(move || engine.classify(&image))
        .await
        .map_err(|e| PipelineError::ClassificationFailure {
            photo_id,
            reason: format!("inference worker stopped: {}", e),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::InMemoryPhotoLibrary;
    use crate::ml::{class_names, ModelConfig, NUM_CLASSES};
    use crate::library::PhotoLibrary;
    use crate::model::{ClassifierMetadata, CompiledClassifier, DeviceType, TrainingSettings};
    use crate::types::ImageSize;
    use async_trait::async_trait;
    use burn::module::Module;
    use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
    use burn_ndarray::{NdArray, NdArrayDevice};
    use chrono::{DateTime, Utc};
    use std::sync::Arc;

    fn publish_untrained(store: &ArtifactStore) {
        let mut settings = TrainingSettings::default();
        settings.model_input_size = 24;
        let model = ModelConfig::new(NUM_CLASSES)
            .with_image_size(24)
            .init::<NdArray>(&NdArrayDevice::Cpu)
            .unwrap();
        let weights = Recorder::<NdArray>::record(
            &BinBytesRecorder::<FullPrecisionSettings>::default(),
            model.into_record(),
            (),
        )
        .unwrap();
        let metadata = ClassifierMetadata::new(class_names(), settings.to_parameters(DeviceType::Cpu), vec![20, 20], None);
        store.publish(&CompiledClassifier { metadata, weights }).unwrap();
    }

    #[test]
    fn test_classify_without_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ClassifierRunner::new(ArtifactStore::new(dir.path().join("missing.tar.gz")));
        assert!(!runner.is_available());

        let err = runner.classify(&DynamicImage::new_rgb8(10, 10)).unwrap_err();
        assert!(matches!(err, PipelineError::NoModelAvailable { .. }));
    }

    #[tokio::test]
    async fn test_classify_photos_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("model.tar.gz"));
        publish_untrained(&store);

        let mut library = InMemoryPhotoLibrary::new();
        let mut photos = Vec::new();
        for i in 0..4 {
            let photo = Photo::new(format!("p{}", i), Utc::now());
            library.insert(photo.clone(), DynamicImage::new_rgb8(120, 80));
            photos.push(photo);
        }
        let cloud = Photo::new("cloud", Utc::now());
        library.insert_without_image(cloud.clone());
        photos.push(cloud);

        let runner = ClassifierRunner::new(store);
        let fetcher = ImageFetcher::new(Arc::new(library));
        let results = runner.classify_photos(photos, &fetcher).await.unwrap();

        assert_eq!(results.len(), 5);
        for (id, result) in &results {
            if id == "cloud" {
                assert!(matches!(result, Err(PipelineError::ImageUnavailable { .. })));
            } else {
                assert!(result.is_ok(), "{} failed: {:?}", id, result);
            }
        }
    }

    #[tokio::test]
    async fn test_classify_photos_without_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ClassifierRunner::new(ArtifactStore::new(dir.path().join("missing.tar.gz")));
        let fetcher = ImageFetcher::new(Arc::new(InMemoryPhotoLibrary::new()));
        let err = runner.classify_photos(vec![], &fetcher).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoModelAvailable { .. }));
    }

    /// 特定の写真の取得中にパニックするライブラリ
    struct PanickingLibrary {
        inner: InMemoryPhotoLibrary,
        broken_id: String,
    }

    #[async_trait]
    impl PhotoLibrary for PanickingLibrary {
        fn fetch_photos_excluding(&self, ids: &[String]) -> Vec<Photo> {
            self.inner.fetch_photos_excluding(ids)
        }

        fn fetch_photos_with_ids(&self, ids: &[String]) -> Vec<Photo> {
            self.inner.fetch_photos_with_ids(ids)
        }

        fn fetch_photos_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Photo> {
            self.inner.fetch_photos_between(from, to)
        }

        async fn fetch_image(&self, photo: &Photo, target: TargetSize, quality: ImageQuality) -> Result<DynamicImage> {
            if photo.id == self.broken_id {
                panic!("decoder crashed on {}", photo.id);
            }
            self.inner.fetch_image(photo, target, quality).await
        }
    }

    #[tokio::test]
    async fn test_classify_photos_reports_stopped_worker() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("model.tar.gz"));
        publish_untrained(&store);

        let mut inner = InMemoryPhotoLibrary::new();
        let mut photos = Vec::new();
        for i in 0..3 {
            let photo = Photo::new(format!("p{}", i), Utc::now());
            inner.insert(photo.clone(), DynamicImage::new_rgb8(60, 60));
            photos.push(photo);
        }
        let library = PanickingLibrary {
            inner,
            broken_id: "p1".to_string(),
        };

        let runner = ClassifierRunner::new(store);
        let fetcher = ImageFetcher::new(Arc::new(library));
        let results = runner.classify_photos(photos, &fetcher).await.unwrap();

        // 止まったタスクの写真も結果に残る
        assert_eq!(results.len(), 3);
        let mut ids: Vec<_> = results.iter().map(|(id, _)| id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["p0", "p1", "p2"]);
        for (id, result) in &results {
            if id == "p1" {
                assert!(matches!(result, Err(PipelineError::ClassificationFailure { photo_id, .. }) if photo_id == "p1"));
            } else {
                assert!(result.is_ok(), "{} failed: {:?}", id, result);
            }
        }
    }

    #[test]
    fn test_engine_clone_classifies_like_original() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("model.tar.gz"));
        publish_untrained(&store);

        let engine = CpuInferenceEngine::cpu(&store.load().unwrap()).unwrap();
        let copy = engine.clone();
        let image = crate::preprocess::resize(&DynamicImage::new_rgb8(90, 40), ImageSize::square(30));
        assert_eq!(engine.classify(&image).unwrap(), copy.classify(&image).unwrap());
    }
}
