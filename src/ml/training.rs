//! コーパスからの分類器学習

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};
use crate::ml::ml_model::{class_names, prepare_model_input, ModelConfig, SelectionClassifier, NUM_CLASSES};
use crate::model::{Augmentation, ClassifierMetadata, CompiledClassifier, DeviceType, TrainingParameters};
use crate::types::SelectionLabel;

/// 対応している特徴抽出器のリビジョン
pub const SUPPORTED_FEATURE_EXTRACTOR_REVISION: u32 = 1;

/// 学習ジョブの段階
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    LoadingCorpus,
    Training,
    Validating,
    Compiling,
}

/// 進捗イベント
///
/// `item_count` は段階ごとの意味を持つ：
/// 読み込み済み画像数、完了エポック数、検証済み画像数、重みのバイト数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingProgress {
    pub phase: TrainingPhase,
    pub item_count: usize,
}

impl TrainingProgress {
    pub fn new(phase: TrainingPhase, item_count: usize) -> Self {
        Self { phase, item_count }
    }
}

/// 進捗の通知先
pub type ProgressObserver = dyn Fn(TrainingProgress) + Send + Sync;

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            ext == "png" || ext == "jpg" || ext == "jpeg"
        })
        .unwrap_or(false)
}

/// 学習コーパス（パスのリストのみ保持）
#[derive(Debug, Clone)]
pub struct CorpusDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    start_idx: usize,
    end_idx: usize,
}

impl CorpusDataset {
    /// `kept` / `discarded` ディレクトリから読み込む
    ///
    /// 全ファイルのヘッダを先に読んで、壊れた画像があれば学習を始める前に失敗させる。
    pub fn from_directory(corpus_dir: &Path) -> anyhow::Result<Self> {
        let mut samples = Vec::new();

        for label in SelectionLabel::ALL {
            let class_dir = corpus_dir.join(label.as_str());
            let mut paths = Vec::new();

            let entries = std::fs::read_dir(&class_dir)
                .with_context(|| format!("Class directory unreadable: {}", class_dir.display()))?;
            for entry in entries {
                let path = entry?.path();
                if path.is_file() && is_image_file(&path) {
                    paths.push(path);
                }
            }

            if paths.is_empty() {
                anyhow::bail!("Class '{}' has no images in {}", label, class_dir.display());
            }

            // read_dirの順序はOS依存なので揃える
            paths.sort();
            for path in paths {
                image::image_dimensions(&path)
                    .with_context(|| format!("Undecodable corpus image: {}", path.display()))?;
                samples.push((path, label.class_index()));
            }
        }

        let len = samples.len();
        Ok(Self {
            samples,
            start_idx: 0,
            end_idx: len,
        })
    }

    /// クラスID順のサンプル数
    pub fn samples_per_class(&self) -> Vec<usize> {
        let mut counts = vec![0; NUM_CLASSES];
        for (_, class_id) in &self.samples[self.start_idx..self.end_idx] {
            counts[*class_id] += 1;
        }
        counts
    }

    /// データセットを学習用と検証用に分割（インデックス範囲のみ）
    pub fn split(self, train_ratio: f32, seed: u64) -> (Self, Self) {
        let mut samples = self.samples[self.start_idx..self.end_idx].to_vec();
        let mut rng = StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let total_len = samples.len();
        let train_len = ((total_len as f32 * train_ratio) as usize).min(total_len);

        let train = Self {
            samples: samples.clone(),
            start_idx: 0,
            end_idx: train_len,
        };
        let valid = Self {
            samples,
            start_idx: train_len,
            end_idx: total_len,
        };

        (train, valid)
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct CorpusItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<CorpusItem> for CorpusDataset {
    fn get(&self, index: usize) -> Option<CorpusItem> {
        let actual_index = self.start_idx + index;
        if actual_index >= self.end_idx {
            return None;
        }

        let (path, label) = self.samples.get(actual_index)?;
        Some(CorpusItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.end_idx - self.start_idx
    }
}

/// データ拡張を適用する
///
/// 有効な拡張それぞれを確率1/2で適用する。
pub fn augment<R: Rng>(image: DynamicImage, augmentations: &[Augmentation], rng: &mut R) -> DynamicImage {
    let mut image = image;

    for &augmentation in augmentations {
        if !rng.gen_bool(0.5) {
            continue;
        }

        image = match augmentation {
            Augmentation::Crop => {
                let scale = rng.gen_range(0.8..=1.0);
                let w = ((image.width() as f64 * scale).round() as u32).clamp(1, image.width().max(1));
                let h = ((image.height() as f64 * scale).round() as u32).clamp(1, image.height().max(1));
                let x = rng.gen_range(0..=image.width().saturating_sub(w));
                let y = rng.gen_range(0..=image.height().saturating_sub(h));
                image.crop_imm(x, y, w, h)
            }
            Augmentation::Blur => image.blur(rng.gen_range(0.5..1.5)),
            Augmentation::Exposure => image.brighten(rng.gen_range(-30..=30)),
            Augmentation::Flip => image.fliph(),
            Augmentation::Noise => add_noise(&image, rng),
            Augmentation::Rotation => match rng.gen_range(0..3) {
                0 => image.rotate90(),
                1 => image.rotate180(),
                _ => image.rotate270(),
            },
        };
    }

    image
}

fn add_noise<R: Rng>(image: &DynamicImage, rng: &mut R) -> DynamicImage {
    let mut rgb = image.to_rgb8();
    for pixel in rgb.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            let noisy = *channel as i16 + rng.gen_range(-10..=10);
            *channel = noisy.clamp(0, 255) as u8;
        }
    }
    DynamicImage::ImageRgb8(rgb)
}

/// バッチャー
#[derive(Clone)]
pub struct CorpusBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    augmentations: Vec<Augmentation>,
    seed: u64,
    batch_counter: Arc<AtomicU64>,
}

impl<B: Backend> CorpusBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self {
            device,
            image_size,
            augmentations: Vec::new(),
            seed: 0,
            batch_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 学習用：データ拡張を有効にする
    pub fn with_augmentations(mut self, augmentations: &[Augmentation], seed: u64) -> Self {
        self.augmentations = augmentations.to_vec();
        self.seed = seed;
        self
    }

    fn load(&self, item: &CorpusItem, rng: &mut StdRng) -> anyhow::Result<Vec<f32>> {
        let image = image::open(&item.path)?;
        let image = augment(image, &self.augmentations, rng);
        Ok(prepare_model_input(&image, self.image_size))
    }
}

impl<B: Backend> Batcher<B, CorpusItem, CorpusBatch<B>> for CorpusBatcher<B> {
    fn batch(&self, items: Vec<CorpusItem>, _device: &B::Device) -> CorpusBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets_vec = Vec::with_capacity(batch_size);

        let batch_index = self.batch_counter.fetch_add(1, Ordering::Relaxed);
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(batch_index));

        for item in items {
            match self.load(&item, &mut rng) {
                Ok(image_data) => all_pixels.extend_from_slice(&image_data),
                Err(e) => {
                    tracing::warn!(path = %item.path.display(), error = %e, "corpus image failed to load, zero-filling");
                    all_pixels.extend(std::iter::repeat(0.0f32).take(3 * size * size));
                }
            }
            targets_vec.push(item.label as i64);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        CorpusBatch { images, targets }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct CorpusBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}

/// 学習ループ
///
/// バッチごとにキャンセルを確認する。検証データが空なら正解率は `None`。
fn fit<B: AutodiffBackend>(
    device: &B::Device,
    train: CorpusDataset,
    valid: CorpusDataset,
    params: &TrainingParameters,
    cancel: &CancellationToken,
    observer: &ProgressObserver,
) -> Result<(SelectionClassifier<B::InnerBackend>, Option<f64>)> {
    let model_config = ModelConfig::new(NUM_CLASSES)
        .with_dropout(params.dropout)
        .with_image_size(params.model_input_size);
    let mut model = model_config
        .init::<B>(device)
        .map_err(|e| PipelineError::training(format!("{:#}", e)))?;
    let mut optim = AdamConfig::new().init::<B, SelectionClassifier<B>>();

    let valid_len = valid.len();

    let batcher_train = CorpusBatcher::<B>::new(device.clone(), params.model_input_size)
        .with_augmentations(&params.augmentations, params.seed);
    let batcher_valid = CorpusBatcher::<B::InnerBackend>::new(device.clone(), params.model_input_size);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(params.batch_size)
        .shuffle(params.seed)
        .num_workers(0)
        .build(train);
    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(params.batch_size)
        .num_workers(0)
        .build(valid);

    tracing::info!(
        epochs = params.max_iterations,
        batch_size = params.batch_size,
        learning_rate = params.learning_rate,
        "training started"
    );

    for epoch in 1..=params.max_iterations {
        let mut loss_sum = 0.0;
        let mut batches = 0usize;

        for batch in dataloader_train.iter() {
            ensure_not_cancelled(cancel)?;

            let output = model.forward_classification(batch.images, batch.targets);
            loss_sum += output.loss.clone().into_scalar().elem::<f64>();
            batches += 1;

            let grads = GradientsParams::from_grads(output.loss.backward(), &model);
            model = optim.step(params.learning_rate, model, grads);
        }

        let mean_loss = if batches > 0 { loss_sum / batches as f64 } else { 0.0 };
        tracing::debug!(epoch, loss = mean_loss, "epoch finished");
        observer(TrainingProgress::new(TrainingPhase::Training, epoch));
    }

    let model = model.valid();

    if valid_len == 0 {
        tracing::info!("validation split is empty, skipping validation");
        return Ok((model, None));
    }

    observer(TrainingProgress::new(TrainingPhase::Validating, 0));
    let mut correct = 0usize;
    let mut total = 0usize;

    for batch in dataloader_valid.iter() {
        ensure_not_cancelled(cancel)?;

        let [batch_size] = batch.targets.dims();
        let predictions = model.forward(batch.images).argmax(1).reshape([batch_size]);
        let hits = predictions
            .equal(batch.targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();

        correct += hits.max(0) as usize;
        total += batch_size;
        observer(TrainingProgress::new(TrainingPhase::Validating, total));
    }

    let accuracy = if total > 0 { Some(correct as f64 / total as f64) } else { None };
    tracing::info!(correct, total, accuracy = ?accuracy, "validation finished");

    Ok((model, accuracy))
}

fn train_on<B: AutodiffBackend>(
    device: B::Device,
    corpus_dir: &Path,
    params: &TrainingParameters,
    cancel: &CancellationToken,
    observer: &ProgressObserver,
) -> Result<CompiledClassifier> {
    observer(TrainingProgress::new(TrainingPhase::LoadingCorpus, 0));

    let dataset = CorpusDataset::from_directory(corpus_dir)
        .map_err(|e| PipelineError::training(format!("{:#}", e)))?;
    let samples_per_class = dataset.samples_per_class();
    tracing::info!(samples = dataset.len(), per_class = ?samples_per_class, "corpus loaded");
    observer(TrainingProgress::new(TrainingPhase::LoadingCorpus, dataset.len()));

    let (train, valid) = dataset.split(params.train_ratio, params.seed);
    if train.len() == 0 {
        return Err(PipelineError::training("training split is empty"));
    }
    tracing::info!(train = train.len(), valid = valid.len(), "corpus split");

    ensure_not_cancelled(cancel)?;
    let (model, validation_accuracy) = fit::<B>(&device, train, valid, params, cancel, observer)?;
    ensure_not_cancelled(cancel)?;

    // f32精度のまま保存する
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let weights = Recorder::<B::InnerBackend>::record(&recorder, model.into_record(), ())
        .map_err(|e| PipelineError::training(format!("failed to serialize weights: {:?}", e)))?;
    observer(TrainingProgress::new(TrainingPhase::Compiling, weights.len()));

    let metadata = ClassifierMetadata::new(class_names(), params.clone(), samples_per_class, validation_accuracy);

    Ok(CompiledClassifier { metadata, weights })
}

/// 分類器を学習する（ブロッキング）
///
/// `params.device` に応じてバックエンドを選ぶ。キャンセルされた場合は `PipelineError::Cancelled`。
pub fn train_classifier(
    corpus_dir: &Path,
    params: &TrainingParameters,
    cancel: &CancellationToken,
    observer: &ProgressObserver,
) -> Result<CompiledClassifier> {
    if params.feature_extractor_revision != SUPPORTED_FEATURE_EXTRACTOR_REVISION {
        return Err(PipelineError::training(format!(
            "unsupported feature extractor revision {}",
            params.feature_extractor_revision
        )));
    }

    tracing::info!(device = %params.device, corpus = %corpus_dir.display(), "training job starting");

    match params.device {
        DeviceType::Cpu => {
            train_on::<Autodiff<NdArray>>(NdArrayDevice::Cpu, corpus_dir, params, cancel, observer)
        }
        DeviceType::Wgpu => {
            train_on::<Autodiff<Wgpu>>(WgpuDevice::DefaultDevice, corpus_dir, params, cancel, observer)
        }
    }
}
