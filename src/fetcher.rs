//! 写真IDから画像を取り出す

use std::sync::Arc;

use image::DynamicImage;

use crate::error::{PipelineError, Result};
use crate::library::PhotoLibrary;
use crate::types::{ImageQuality, Photo, TargetSize};

/// 写真ライブラリから画像を取得する
#[derive(Clone)]
pub struct ImageFetcher {
    library: Arc<dyn PhotoLibrary>,
}

impl ImageFetcher {
    pub fn new(library: Arc<dyn PhotoLibrary>) -> Self {
        Self { library }
    }

    /// 画像を取得する
    ///
    /// ライブラリ側のどんな失敗も `ImageUnavailable` として返す。
    pub async fn fetch(&self, photo: &Photo, target: TargetSize, quality: ImageQuality) -> Result<DynamicImage> {
        let image = self
            .library
            .fetch_image(photo, target, quality)
            .await
            .map_err(|e| match e {
                e @ PipelineError::ImageUnavailable { .. } => e,
                other => PipelineError::ImageUnavailable {
                    photo_id: photo.id.clone(),
                    reason: other.to_string(),
                },
            })?;

        if image.width() == 0 || image.height() == 0 {
            return Err(PipelineError::ImageUnavailable {
                photo_id: photo.id.clone(),
                reason: "library returned an empty image".to_string(),
            });
        }

        tracing::debug!(photo_id = %photo.id, width = image.width(), height = image.height(), "image fetched");
        Ok(image)
    }

    /// コーパス用：最大解像度・高品質で取得
    pub async fn fetch_full_resolution(&self, photo: &Photo) -> Result<DynamicImage> {
        self.fetch(photo, TargetSize::Maximum, ImageQuality::HighQuality).await
    }
}
