//! アプリケーション設定管理モジュール
//!
//! 計算デバイスや学習設定などをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データ拡張の種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Augmentation {
    Crop,
    Blur,
    Exposure,
    Flip,
    Noise,
    Rotation,
}

impl Augmentation {
    pub const ALL: [Augmentation; 6] = [
        Augmentation::Crop,
        Augmentation::Blur,
        Augmentation::Exposure,
        Augmentation::Flip,
        Augmentation::Noise,
        Augmentation::Rotation,
    ];
}

/// ファイル配置設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// 学習データと分類器を置くルートディレクトリ
    pub root_dir: PathBuf,
}

impl StorageSettings {
    pub fn training_data_dir(&self) -> PathBuf {
        self.root_dir.join("TrainingData")
    }

    pub fn classifier_path(&self) -> PathBuf {
        self.root_dir
            .join("Classifier")
            .join("photo_selection_classifier.tar.gz")
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("photo_selection"),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// 各クラスに必要な最低枚数
    pub min_samples_per_class: usize,
    /// コーパス画像の最小フットプリント（正方形、ピクセル）
    pub corpus_image_size: u32,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            min_samples_per_class: 20,
            corpus_image_size: 300,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// 特徴抽出器のリビジョン
    pub feature_extractor_revision: u32,
    /// 最大イテレーション数（エポック数）
    pub max_iterations: usize,
    /// 有効なデータ拡張
    pub augmentations: Vec<Augmentation>,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// トレーニングデータの割合
    pub train_ratio: f32,
    /// モデル入力サイズ（正方形）
    pub model_input_size: usize,
    /// ドロップアウト率
    pub dropout: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            feature_extractor_revision: 1,
            max_iterations: 20,
            augmentations: Augmentation::ALL.to_vec(),
            batch_size: 16,
            learning_rate: 1e-3,
            seed: 42,
            train_ratio: 0.8,
            model_input_size: 64,
            dropout: 0.5,
        }
    }
}

impl TrainingSettings {
    /// 1回の学習で使う不変パラメータを作成
    pub fn to_parameters(&self, device: DeviceType) -> TrainingParameters {
        let mut augmentations = self.augmentations.clone();
        augmentations.sort();
        augmentations.dedup();

        TrainingParameters {
            feature_extractor_revision: self.feature_extractor_revision,
            max_iterations: self.max_iterations,
            augmentations,
            batch_size: self.batch_size.max(1),
            learning_rate: self.learning_rate,
            seed: self.seed,
            train_ratio: self.train_ratio.clamp(0.0, 1.0),
            model_input_size: self.model_input_size,
            dropout: self.dropout,
            device,
        }
    }
}

/// 学習パラメータ（学習ごとに生成され、以後変更されない）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParameters {
    pub feature_extractor_revision: u32,
    pub max_iterations: usize,
    pub augmentations: Vec<Augmentation>,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
    pub train_ratio: f32,
    pub model_input_size: usize,
    pub dropout: f64,
    pub device: DeviceType,
}

impl TrainingParameters {
    pub fn augments(&self, augmentation: Augmentation) -> bool {
        self.augmentations.contains(&augmentation)
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// ファイル配置
    #[serde(default)]
    pub storage: StorageSettings,
    /// データセット設定
    #[serde(default)]
    pub dataset: DatasetSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("photo_selection.json")
    }

    /// 指定ルートを使うデフォルト設定
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageSettings {
                root_dir: root_dir.into(),
            },
            ..Self::default()
        }
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "config loaded");
                config
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %format!("{:#}", e), "config unreadable, using defaults");
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// 今回の学習パラメータ
    pub fn training_parameters(&self) -> TrainingParameters {
        self.training.to_parameters(self.device_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.dataset.min_samples_per_class, 20);
        assert_eq!(config.dataset.corpus_image_size, 300);
        assert_eq!(config.training.max_iterations, 20);
        assert_eq!(config.training.feature_extractor_revision, 1);
        assert_eq!(config.training.augmentations.len(), 6);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::with_root("/tmp/photos");
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.storage.root_dir, deserialized.storage.root_dir);
        assert_eq!(config.training.augmentations, deserialized.training.augmentations);
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let config: AppConfig = serde_json::from_str(r#"{"device_type":"Wgpu"}"#).unwrap();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.dataset.min_samples_per_class, 20);
    }

    #[test]
    fn test_save_and_load_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = AppConfig::with_root(dir.path());
        config.training.max_iterations = 3;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.training.max_iterations, 3);
    }

    #[test]
    fn test_load_or_default_falls_back_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        let config = AppConfig::load_or_default(&path);
        assert_eq!(config.training.max_iterations, 20);
    }

    #[test]
    fn test_parameters_are_normalized() {
        let mut settings = TrainingSettings::default();
        settings.augmentations = vec![Augmentation::Flip, Augmentation::Blur, Augmentation::Flip];
        settings.batch_size = 0;
        let params = settings.to_parameters(DeviceType::Cpu);
        assert_eq!(params.augmentations, vec![Augmentation::Blur, Augmentation::Flip]);
        assert_eq!(params.batch_size, 1);
        assert!(params.augments(Augmentation::Flip));
        assert!(!params.augments(Augmentation::Noise));
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }

    #[test]
    fn test_storage_layout() {
        let storage = StorageSettings {
            root_dir: PathBuf::from("/data"),
        };
        assert_eq!(storage.training_data_dir(), PathBuf::from("/data/TrainingData"));
        assert!(storage.classifier_path().ends_with("Classifier/photo_selection_classifier.tar.gz"));
    }
}
