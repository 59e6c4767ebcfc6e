//! アルバム画面・写真ピッカーの操作
//!
//! ホストアプリの画面はこのサービスだけを呼べばよい。

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::Result;
use crate::library::{KeptPhotoStore, PhotoLibrary};
use crate::model::AppConfig;
use crate::orchestrator::{RunOutcome, TrainingOrchestrator, TrainingTrigger};
use crate::runner::ClassifierRunner;
use crate::types::{Photo, SelectionLabel};

/// 画面表示と同時に始めた学習の結果
pub type TrainingHandle = JoinHandle<Result<RunOutcome>>;

pub struct AlbumService {
    orchestrator: TrainingOrchestrator,
    runner: ClassifierRunner,
}

impl AlbumService {
    pub fn new(config: &AppConfig, library: Arc<dyn PhotoLibrary>, records: Arc<dyn KeptPhotoStore>) -> Self {
        Self::with_orchestrator(TrainingOrchestrator::new(config, library, records))
    }

    pub fn with_orchestrator(orchestrator: TrainingOrchestrator) -> Self {
        let runner = orchestrator.runner();
        Self { orchestrator, runner }
    }

    pub fn orchestrator(&self) -> &TrainingOrchestrator {
        &self.orchestrator
    }

    async fn kept_ids(&self) -> Result<Vec<String>> {
        let records = self.orchestrator.records().fetch_kept_records().await?;
        Ok(records.into_iter().map(|r| r.photo_id).collect())
    }

    /// アルバムに共有済みの写真（新しい順）
    pub async fn album_photos(&self) -> Result<Vec<Photo>> {
        let ids = self.kept_ids().await?;
        Ok(self.orchestrator.library().fetch_photos_with_ids(&ids))
    }

    /// ピッカーに並べる候補（共有済みを除く）
    pub async fn picker_candidates(&self) -> Result<Vec<Photo>> {
        let ids = self.kept_ids().await?;
        Ok(self.orchestrator.library().fetch_photos_excluding(&ids))
    }

    /// 自動選択ボタンを出せるか
    pub fn can_auto_select(&self) -> bool {
        self.runner.is_available()
    }

    /// 候補から `kept` と判定された写真を選ぶ
    ///
    /// 分類できなかった写真は選ばない。戻り値は候補と同じ順序。
    pub async fn auto_select(&self, candidates: &[Photo]) -> Result<Vec<Photo>> {
        let results = self
            .runner
            .classify_photos(candidates.to_vec(), self.orchestrator.fetcher())
            .await?;

        let kept: HashSet<String> = results
            .into_iter()
            .filter_map(|(id, result)| match result {
                Ok(SelectionLabel::Kept) => Some(id),
                Ok(SelectionLabel::Discarded) => None,
                Err(e) => {
                    tracing::debug!(photo_id = %id, error = %e, "skipping photo in auto-select");
                    None
                }
            })
            .collect();

        tracing::info!(candidates = candidates.len(), selected = kept.len(), "auto-select finished");
        Ok(candidates.iter().filter(|p| kept.contains(&p.id)).cloned().collect())
    }

    /// 選んだ写真をアルバムに共有する（全件成功か、何も追加しないか）
    pub async fn share_to_album(&self, photos: &[Photo]) -> Result<()> {
        self.orchestrator.records().insert_kept_records(photos).await?;
        tracing::info!(count = photos.len(), "photos shared to album");
        Ok(())
    }

    /// アルバム画面の表示
    ///
    /// アルバムの写真を返し、裏で学習を始める。
    pub async fn on_album_appeared(&self) -> Result<(Vec<Photo>, TrainingHandle)> {
        let photos = self.album_photos().await?;
        Ok((photos, self.orchestrator.trigger(TrainingTrigger::AlbumAppeared)))
    }

    /// 写真ピッカーを閉じた
    ///
    /// 共有後のアルバムを読み直し、進行中の学習を置き換える。
    pub async fn on_picker_dismissed(&self) -> Result<(Vec<Photo>, TrainingHandle)> {
        let photos = self.album_photos().await?;
        Ok((photos, self.orchestrator.trigger(TrainingTrigger::PickerDismissed)))
    }
}
