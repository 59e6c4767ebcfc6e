//! 外部コラボレータ（写真ライブラリ・永続化）のインターフェース
//!
//! OSの写真ライブラリやデータベースはホストアプリ側で実装する。
//! テストやライブラリを持たない環境向けにメモリ実装を同梱している。

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::DynamicImage;

use crate::error::Result;
use crate::types::{ImageQuality, KeptPhotoRecord, Photo, TargetSize};

pub use memory::{InMemoryKeptPhotoStore, InMemoryPhotoLibrary};

/// 写真ライブラリ
#[async_trait]
pub trait PhotoLibrary: Send + Sync {
    /// 指定ID以外の写真（新しい順）
    fn fetch_photos_excluding(&self, ids: &[String]) -> Vec<Photo>;

    /// 指定IDの写真（新しい順）
    fn fetch_photos_with_ids(&self, ids: &[String]) -> Vec<Photo>;

    /// `[from, to]` に撮影された写真（新しい順、両端を含む）
    fn fetch_photos_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Photo>;

    /// 画像を取得する
    ///
    /// 取得できない場合は `PipelineError::ImageUnavailable` を返す。
    async fn fetch_image(&self, photo: &Photo, target: TargetSize, quality: ImageQuality) -> Result<DynamicImage>;
}

/// アルバムに共有済みの写真の記録を保持するストア
#[async_trait]
pub trait KeptPhotoStore: Send + Sync {
    async fn fetch_kept_records(&self) -> Result<Vec<KeptPhotoRecord>>;

    /// まとめて追加する（全件成功か、何も追加しないかのどちらか）
    async fn insert_kept_records(&self, photos: &[Photo]) -> Result<()>;

    /// 最古と最新の撮影日時（記録が無ければNone）
    async fn oldest_and_latest_taken_at(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>>;
}
