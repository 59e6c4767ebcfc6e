//! 共有履歴からラベル付き学習データセットを作る
//!
//! 1. 共有済み記録の最古〜最新の期間に撮影された写真だけを対象にする
//! 2. 共有済みなら `kept`、それ以外は `discarded`
//! 3. 少ない方のクラス数 `n` が最低数未満なら学習しない
//! 4. 新しい順に各クラス `n` 枚ずつ取り、多い方のクラスの古い写真を捨てる

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::error::{PipelineError, Result};
use crate::types::{KeptPhotoRecord, Photo, PhotoSelection, SelectionLabel};

/// 各クラスに必要な最低枚数の既定値
pub const MIN_SAMPLES_PER_CLASS: usize = 20;

/// ラベル付きデータセットの構築器
#[derive(Debug, Clone, Copy)]
pub struct DatasetBuilder {
    min_samples_per_class: usize,
}

impl Default for DatasetBuilder {
    fn default() -> Self {
        Self::new(MIN_SAMPLES_PER_CLASS)
    }
}

impl DatasetBuilder {
    pub fn new(min_samples_per_class: usize) -> Self {
        Self { min_samples_per_class }
    }

    pub fn min_samples_per_class(&self) -> usize {
        self.min_samples_per_class
    }

    /// ラベル付け・件数チェック・クラスバランス調整を行う
    ///
    /// 戻り値は `kept` の `n` 件、続いて `discarded` の `n` 件（それぞれ新しい順）。
    pub fn build_labeled_set(&self, kept_records: &[KeptPhotoRecord], photos: &[Photo]) -> Result<Vec<PhotoSelection>> {
        let selections = label_photos(kept_records, photos);

        let kept = selections.iter().filter(|s| s.is_kept()).count();
        let discarded = selections.len() - kept;
        let n = kept.min(discarded);

        tracing::info!(kept, discarded, "photo selections labeled");

        if n < self.min_samples_per_class {
            return Err(PipelineError::InsufficientData {
                kept,
                discarded,
                required: self.min_samples_per_class,
            });
        }

        let balanced = balance(selections, n);
        tracing::info!(per_class = n, total = balanced.len(), "selections balanced");
        Ok(balanced)
    }
}

/// 共有済み記録の期間（両端を含む）
pub fn time_span(kept_records: &[KeptPhotoRecord]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let oldest = kept_records.iter().map(|r| r.taken_at).min()?;
    let latest = kept_records.iter().map(|r| r.taken_at).max()?;
    Some((oldest, latest))
}

/// 期間内の写真にラベルを付ける
pub fn label_photos(kept_records: &[KeptPhotoRecord], photos: &[Photo]) -> Vec<PhotoSelection> {
    let Some((oldest, latest)) = time_span(kept_records) else {
        return Vec::new();
    };

    let kept_ids: HashSet<&str> = kept_records.iter().map(|r| r.photo_id.as_str()).collect();

    photos
        .iter()
        .filter(|photo| photo.created_at >= oldest && photo.created_at <= latest)
        .map(|photo| {
            let label = if kept_ids.contains(photo.id.as_str()) {
                SelectionLabel::Kept
            } else {
                SelectionLabel::Discarded
            };
            PhotoSelection::new(photo.clone(), label)
        })
        .collect()
}

/// 新しい順に各クラス `limit` 件まで取る
pub fn balance(mut selections: Vec<PhotoSelection>, limit: usize) -> Vec<PhotoSelection> {
    // 安定ソート：同時刻は入力順を保つ
    selections.sort_by(|a, b| b.photo.created_at.cmp(&a.photo.created_at));

    let mut kept = Vec::with_capacity(limit);
    let mut discarded = Vec::with_capacity(limit);

    for selection in selections {
        if kept.len() >= limit && discarded.len() >= limit {
            break;
        }

        let bucket = if selection.is_kept() { &mut kept } else { &mut discarded };
        if bucket.len() < limit {
            bucket.push(selection);
        }
    }

    kept.extend(discarded);
    kept
}
