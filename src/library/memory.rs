//! メモリ上の写真ライブラリとストア

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::DynamicImage;

use super::{KeptPhotoStore, PhotoLibrary};
use crate::error::{PipelineError, Result};
use crate::types::{ImageQuality, KeptPhotoRecord, Photo, TargetSize};

/// メモリ上の写真ライブラリ
#[derive(Default)]
pub struct InMemoryPhotoLibrary {
    photos: Vec<Photo>,
    images: HashMap<String, Arc<DynamicImage>>,
}

impl InMemoryPhotoLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// 画像付きで写真を追加
    pub fn insert(&mut self, photo: Photo, image: DynamicImage) {
        self.images.insert(photo.id.clone(), Arc::new(image));
        self.insert_without_image(photo);
    }

    /// 画像が取得できない写真を追加（クラウド上にしか無い写真など）
    pub fn insert_without_image(&mut self, photo: Photo) {
        self.photos.retain(|p| p.id != photo.id);
        self.photos.push(photo);
        // 新しい順で保持
        self.photos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    }

    pub fn len(&self) -> usize {
        self.photos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.photos.is_empty()
    }
}

#[async_trait]
impl PhotoLibrary for InMemoryPhotoLibrary {
    fn fetch_photos_excluding(&self, ids: &[String]) -> Vec<Photo> {
        let excluded: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.photos
            .iter()
            .filter(|p| !excluded.contains(p.id.as_str()))
            .cloned()
            .collect()
    }

    fn fetch_photos_with_ids(&self, ids: &[String]) -> Vec<Photo> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.photos
            .iter()
            .filter(|p| wanted.contains(p.id.as_str()))
            .cloned()
            .collect()
    }

    fn fetch_photos_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Photo> {
        self.photos
            .iter()
            .filter(|p| p.created_at >= from && p.created_at <= to)
            .cloned()
            .collect()
    }

    async fn fetch_image(&self, photo: &Photo, target: TargetSize, _quality: ImageQuality) -> Result<DynamicImage> {
        let image = self
            .images
            .get(&photo.id)
            .ok_or_else(|| PipelineError::ImageUnavailable {
                photo_id: photo.id.clone(),
                reason: "no image data in library".to_string(),
            })?;

        Ok(match target {
            TargetSize::Maximum => image.as_ref().clone(),
            TargetSize::Fit(size) => crate::preprocess::resize(image, size),
        })
    }
}

/// メモリ上の共有済み写真ストア
#[derive(Default)]
pub struct InMemoryKeptPhotoStore {
    records: Mutex<Vec<KeptPhotoRecord>>,
}

impl InMemoryKeptPhotoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 既存の記録から作る
    ///
    /// 同じ写真IDが複数あれば最初の1件だけを残す。
    pub fn with_records(records: Vec<KeptPhotoRecord>) -> Self {
        let total = records.len();
        let mut seen = HashSet::new();
        let records: Vec<_> = records
            .into_iter()
            .filter(|r| seen.insert(r.photo_id.clone()))
            .collect();

        if records.len() < total {
            tracing::warn!(dropped = total - records.len(), "duplicate kept records ignored");
        }

        Self {
            records: Mutex::new(records),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<KeptPhotoRecord>>> {
        self.records.lock().map_err(|_| PipelineError::BatchInsertFailure {
            reason: "record store lock poisoned".to_string(),
        })
    }
}

#[async_trait]
impl KeptPhotoStore for InMemoryKeptPhotoStore {
    async fn fetch_kept_records(&self) -> Result<Vec<KeptPhotoRecord>> {
        Ok(self.lock()?.clone())
    }

    async fn insert_kept_records(&self, photos: &[Photo]) -> Result<()> {
        let mut records = self.lock()?;

        // 先に全件検証し、1件でも不正なら何も追加しない
        let mut seen: HashSet<&str> = records.iter().map(|r| r.photo_id.as_str()).collect();
        for photo in photos {
            if !seen.insert(photo.id.as_str()) {
                return Err(PipelineError::BatchInsertFailure {
                    reason: format!("photo {} is already in the album", photo.id),
                });
            }
        }

        records.extend(photos.iter().map(KeptPhotoRecord::from_photo));
        Ok(())
    }

    async fn oldest_and_latest_taken_at(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let records = self.lock()?;
        let oldest = records.iter().map(|r| r.taken_at).min();
        let latest = records.iter().map(|r| r.taken_at).max();
        Ok(oldest.zip(latest))
    }
}
