//! メタデータから推論に必要な情報を取り出す

use crate::error::{PipelineError, Result};
use crate::model::model_metadata::ClassifierMetadata;
use crate::types::SelectionLabel;

/// 推論設定
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// クラスID順のラベル
    pub labels: Vec<SelectionLabel>,
    /// モデル入力解像度
    pub model_input_size: usize,
    pub dropout: f64,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    ///
    /// 未知のクラス名や2クラス以外の構成は壊れた成果物として扱う。
    pub fn from_metadata(metadata: &ClassifierMetadata) -> Result<Self> {
        let labels = metadata
            .class_labels
            .iter()
            .map(|name| {
                SelectionLabel::from_name(name)
                    .ok_or_else(|| PipelineError::invalid_artifact(format!("unknown class label '{}'", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        if labels != SelectionLabel::ALL {
            return Err(PipelineError::invalid_artifact(format!(
                "unexpected class layout: {}",
                metadata.class_labels.join(", ")
            )));
        }

        if metadata.model_input_size == 0 {
            return Err(PipelineError::invalid_artifact("model input size is zero"));
        }

        Ok(Self {
            labels,
            model_input_size: metadata.model_input_size as usize,
            dropout: metadata.parameters.dropout,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    /// クラスインデックスからラベルを取得
    pub fn class_index_to_label(&self, index: usize) -> Option<SelectionLabel> {
        self.labels.get(index).copied()
    }
}
