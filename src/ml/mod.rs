pub mod ml_model;
pub mod training;
pub mod inference;

pub use ml_model::{class_names, prepare_model_input, ModelConfig, SelectionClassifier, NUM_CLASSES};
pub use training::{
    augment, train_classifier, CorpusBatch, CorpusBatcher, CorpusDataset, CorpusItem, ProgressObserver, TrainingPhase,
    TrainingProgress, SUPPORTED_FEATURE_EXTRACTOR_REVISION,
};
pub use inference::{CpuInferenceEngine, InferenceEngine};
