//! モデル推論機能

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, ElementConversion, Tensor},
};
use burn_ndarray::{NdArray, NdArrayDevice};
use image::DynamicImage;

use crate::error::{PipelineError, Result};
use crate::ml::ml_model::{prepare_model_input, ModelConfig, SelectionClassifier};
use crate::model::{CompiledClassifier, InferenceConfig};
use crate::types::SelectionLabel;

/// 推論エンジン
///
/// 複製しても重みのテンソルは共有されるので、ワーカーごとに複製して使える。
#[derive(Clone)]
pub struct InferenceEngine<B: Backend> {
    model: SelectionClassifier<B>,
    config: InferenceConfig,
    device: B::Device,
}

/// CPU (NdArray) 上の推論エンジン
pub type CpuInferenceEngine = InferenceEngine<NdArray>;

impl CpuInferenceEngine {
    pub fn cpu(classifier: &CompiledClassifier) -> Result<Self> {
        Self::from_classifier(classifier, NdArrayDevice::Cpu)
    }
}

impl<B: Backend> InferenceEngine<B> {
    /// 成果物から推論エンジンを初期化
    pub fn from_classifier(classifier: &CompiledClassifier, device: B::Device) -> Result<Self> {
        let config = InferenceConfig::from_metadata(&classifier.metadata)?;

        let model = ModelConfig::new(config.num_classes())
            .with_dropout(config.dropout)
            .with_image_size(config.model_input_size)
            .init::<B>(&device)
            .map_err(PipelineError::invalid_artifact)?;

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = Recorder::<B>::load(&recorder, classifier.weights.clone(), &device)
            .map_err(|e| PipelineError::invalid_artifact(format!("failed to load weights: {:?}", e)))?;

        Ok(Self {
            model: model.load_record(record),
            config,
            device,
        })
    }

    /// 単一画像を分類
    pub fn classify(&self, image: &DynamicImage) -> Result<SelectionLabel> {
        let size = self.config.model_input_size;
        let image_data = prepare_model_input(image, size);

        let tensor = Tensor::<B, 1>::from_floats(image_data.as_slice(), &self.device).reshape([1, 3, size, size]);

        let class_idx = self
            .model
            .forward(tensor)
            .argmax(1)
            .into_scalar()
            .elem::<i64>();

        usize::try_from(class_idx)
            .ok()
            .and_then(|idx| self.config.class_index_to_label(idx))
            .ok_or_else(|| PipelineError::invalid_artifact(format!("class index {} out of range", class_idx)))
    }

    /// 複数画像をまとめて分類
    pub fn classify_batch(&self, images: &[DynamicImage]) -> Result<Vec<SelectionLabel>> {
        images.iter().map(|image| self.classify(image)).collect()
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}
