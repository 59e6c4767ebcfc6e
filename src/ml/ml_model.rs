//! 機械学習モデルの共通定義
//!
//! 写真の採用/不採用を判定する小さなCNNと、その入力の作り方を提供します。

use anyhow::Result;
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use image::DynamicImage;

use crate::preprocess::center_crop_square;
use crate::types::SelectionLabel;

/// クラス数
pub const NUM_CLASSES: usize = SelectionLabel::ALL.len();

/// 最終畳み込み層のチャネル数
const FEATURE_CHANNELS: usize = 64;

/// クラス名の定義（クラスID順）
pub fn class_names() -> Vec<String> {
    SelectionLabel::ALL.iter().map(|l| l.as_str().to_string()).collect()
}

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 64)]
    pub image_size: usize,
}

impl ModelConfig {
    /// 最終畳み込み後の特徴マップの一辺
    ///
    /// Conv(3x3, padding無し)で2減り、Pool(2x2, stride 2)で半分になる。
    pub fn feature_map_size(&self) -> usize {
        let after_conv1 = self.image_size.saturating_sub(2);
        let after_pool1 = after_conv1 / 2;
        let after_conv2 = after_pool1.saturating_sub(2);
        let after_pool2 = after_conv2 / 2;
        after_pool2.saturating_sub(2)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<SelectionClassifier<B>> {
        let feature_map_size = self.feature_map_size();
        if feature_map_size == 0 {
            anyhow::bail!("Input size too small: {} (need at least 18x18)", self.image_size);
        }
        if self.num_classes == 0 {
            anyhow::bail!("Model needs at least one class");
        }

        tracing::debug!(
            image_size = self.image_size,
            feature_map_size,
            channels = FEATURE_CHANNELS,
            num_classes = self.num_classes,
            "initializing selection classifier"
        );

        Ok(SelectionClassifier {
            conv1: Conv2dConfig::new([3, 16], [3, 3]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: Conv2dConfig::new([16, 32], [3, 3]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv3: Conv2dConfig::new([32, FEATURE_CHANNELS], [3, 3]).init(device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(FEATURE_CHANNELS, FEATURE_CHANNELS / 2).init(device),
            fc2: LinearConfig::new(FEATURE_CHANNELS / 2, self.num_classes).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            activation: Relu::new(),
        })
    }
}

/// 写真の採用判定用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (no padding) + ReLU + MaxPool 2x2} x 2層
/// - Conv 3x3 (no padding) + ReLU
/// - Global Average Pooling
/// - FC: 64 -> 32 + ReLU + Dropout
/// - FC: 32 -> num_classes
#[derive(Module, Debug)]
pub struct SelectionClassifier<B: Backend> {
    conv1: Conv2d<B>, // 3 -> 16
    pool1: MaxPool2d,
    conv2: Conv2d<B>, // 16 -> 32
    pool2: MaxPool2d,
    conv3: Conv2d<B>, // 32 -> 64
    global_pool: AdaptiveAvgPool2d,

    fc1: Linear<B>,
    fc2: Linear<B>,

    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> SelectionClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);

        // [b, c, 1, 1] -> [b, c]
        let x = self.global_pool.forward(x);
        let [_, c, _, _] = x.dims();
        let x = x.reshape([batch_size, c]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);

        self.fc2.forward(x)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// モデル入力を作る
///
/// 中央を正方形に切り抜いて `size` x `size` に縮小し、ImageNetの平均と標準偏差で正規化する。
/// 学習と推論で同じ処理を使うこと。
///
/// # 戻り値
/// - 正規化されたRGB画像データ (C, H, W) の順で平坦化
pub fn prepare_model_input(image: &DynamicImage, size: usize) -> Vec<f32> {
    let img = center_crop_square(image, size as u32).to_rgb8();
    let (width, height) = img.dimensions();

    let mut data = Vec::with_capacity(3 * size * size);

    let mean = [0.485, 0.456, 0.406];
    let std = [0.229, 0.224, 0.225];

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let pixel = img.get_pixel(x, y);
                let value = pixel[channel] as f32 / 255.0;
                data.push((value - mean[channel]) / std[channel]);
            }
        }
    }

    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    #[test]
    fn test_feature_map_size() {
        assert_eq!(ModelConfig::new(2).with_image_size(64).feature_map_size(), 12);
        assert_eq!(ModelConfig::new(2).with_image_size(32).feature_map_size(), 4);
        assert_eq!(ModelConfig::new(2).with_image_size(18).feature_map_size(), 1);
        assert_eq!(ModelConfig::new(2).with_image_size(17).feature_map_size(), 0);
    }

    #[test]
    fn test_init_rejects_tiny_input() {
        let device = NdArrayDevice::Cpu;
        assert!(ModelConfig::new(2).with_image_size(10).init::<NdArray>(&device).is_err());
    }

    #[test]
    fn test_forward_shape() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(NUM_CLASSES)
            .with_image_size(32)
            .init::<NdArray>(&device)
            .unwrap();
        let images = Tensor::<NdArray, 4>::zeros([3, 3, 32, 32], &device);
        assert_eq!(model.forward(images).dims(), [3, NUM_CLASSES]);
    }

    #[test]
    fn test_prepare_model_input_layout() {
        let image = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(50, 30, image::Rgb([255, 0, 0])));
        let data = prepare_model_input(&image, 16);
        assert_eq!(data.len(), 3 * 16 * 16);

        // 赤チャネルが先頭、青チャネルが最後
        let red = (1.0 - 0.485) / 0.229;
        let blue = (0.0 - 0.406) / 0.225;
        assert!((data[0] - red).abs() < 1e-3);
        assert!((data[data.len() - 1] - blue).abs() < 1e-3);
    }

    #[test]
    fn test_class_names_follow_label_order() {
        assert_eq!(class_names(), vec!["kept", "discarded"]);
    }
}
