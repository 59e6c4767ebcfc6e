//! パイプライン全体で共有するデータ型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 写真ライブラリ上のアセットへの参照
///
/// 画素データは持たない。画像が必要な場合は `ImageFetcher` 経由で取得する。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Photo {
    /// ライブラリ内で安定した識別子
    pub id: String,
    /// 撮影日時
    pub created_at: DateTime<Utc>,
}

impl Photo {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
        }
    }
}

/// アルバムに共有済みの写真の記録
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeptPhotoRecord {
    pub id: Uuid,
    pub photo_id: String,
    pub taken_at: DateTime<Utc>,
}

impl KeptPhotoRecord {
    /// 写真からレコードを作成（IDは新規発行）
    pub fn from_photo(photo: &Photo) -> Self {
        Self {
            id: Uuid::new_v4(),
            photo_id: photo.id.clone(),
            taken_at: photo.created_at,
        }
    }
}

/// 二値分類のラベル
///
/// クラスIDの並びは `SelectionLabel::ALL` の順序で固定。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionLabel {
    Kept,
    Discarded,
}

impl SelectionLabel {
    pub const ALL: [SelectionLabel; 2] = [SelectionLabel::Kept, SelectionLabel::Discarded];

    /// コーパスのサブディレクトリ名兼クラス名
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionLabel::Kept => "kept",
            SelectionLabel::Discarded => "discarded",
        }
    }

    pub fn class_index(&self) -> usize {
        match self {
            SelectionLabel::Kept => 0,
            SelectionLabel::Discarded => 1,
        }
    }

    pub fn from_class_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|label| label.as_str() == name)
    }
}

impl std::fmt::Display for SelectionLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 1回の学習でのみ有効な写真とラベルの組
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoSelection {
    pub photo: Photo,
    pub label: SelectionLabel,
}

impl PhotoSelection {
    pub fn new(photo: Photo, label: SelectionLabel) -> Self {
        Self { photo, label }
    }

    pub fn is_kept(&self) -> bool {
        self.label == SelectionLabel::Kept
    }
}

/// 画像サイズ（ピクセル）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn square(side: u32) -> Self {
        Self::new(side, side)
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 画像取得時の要求サイズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSize {
    /// ライブラリが持つ最大解像度
    Maximum,
    /// 指定サイズに収まる程度
    Fit(ImageSize),
}

/// 画像取得時の品質モード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageQuality {
    #[default]
    HighQuality,
    Fast,
}
