//! 分類器メタデータの定義
//!
//! tar.gz形式で重みと一緒に保存され、推論時にモデル構成の復元に使われます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::config::TrainingParameters;

/// 分類器メタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierMetadata {
    /// クラスラベル（クラスID順）
    /// 例: ["kept", "discarded"]
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（CNNへの入力解像度、正方形）
    pub model_input_size: u32,

    /// 学習時のパラメータ
    pub parameters: TrainingParameters,

    /// クラスごとの学習サンプル数（class_labelsと同じ順序）
    pub samples_per_class: Vec<usize>,

    /// 検証データでの正解率（検証データが無い場合はNone）
    #[serde(default)]
    pub validation_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ClassifierMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_labels: Vec<String>,
        parameters: TrainingParameters,
        samples_per_class: Vec<usize>,
        validation_accuracy: Option<f64>,
    ) -> Self {
        Self {
            class_labels,
            model_input_size: parameters.model_input_size as u32,
            parameters,
            samples_per_class,
            validation_accuracy,
            trained_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn total_samples(&self) -> usize {
        self.samples_per_class.iter().sum()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
