pub mod model_metadata;
pub mod model_storage;
pub mod inference_config;
pub mod config;

pub use model_metadata::ClassifierMetadata;
pub use model_storage::{save_model_with_metadata, load_model_with_metadata, ArtifactStore, CompiledClassifier};
pub use inference_config::InferenceConfig;
pub use config::{AppConfig, Augmentation, DatasetSettings, DeviceType, StorageSettings, TrainingParameters, TrainingSettings};
