//! 画像の前処理（縮小・再エンコード）
//!
//! コーパス生成と推論の両方で同じ処理を使う。

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

use crate::types::ImageSize;

/// コーパス画像の既定フットプリント
pub const MINIMUM_TRAINED_IMAGE_SIZE: ImageSize = ImageSize::square(300);

/// JPEG再エンコード品質（最高品質）
pub const JPEG_QUALITY: u8 = 100;

/// アスペクト比を保って `target` に収まるサイズを計算
///
/// 倍率は幅・高さの比の小さい方。各軸は四捨五入して `[1, target]` に収める。
pub fn fit_within(source: ImageSize, target: ImageSize) -> ImageSize {
    if source.width == 0 || source.height == 0 {
        return source;
    }

    let width_ratio = target.width as f64 / source.width as f64;
    let height_ratio = target.height as f64 / source.height as f64;
    let ratio = width_ratio.min(height_ratio);

    let scale = |value: u32, limit: u32| -> u32 {
        ((value as f64 * ratio).round() as u32).clamp(1, limit.max(1))
    };

    ImageSize::new(scale(source.width, target.width), scale(source.height, target.height))
}

/// 画像の前処理器
#[derive(Debug, Clone, Copy)]
pub struct ImagePreprocessor {
    target: ImageSize,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new(MINIMUM_TRAINED_IMAGE_SIZE)
    }
}

impl ImagePreprocessor {
    pub fn new(target: ImageSize) -> Self {
        Self { target }
    }

    pub fn target(&self) -> ImageSize {
        self.target
    }

    /// アスペクト比を保ったまま `target` に収まるよう拡大縮小する（切り抜き・余白なし）
    pub fn resize(&self, image: &DynamicImage) -> DynamicImage {
        resize(image, self.target)
    }

    /// 縮小してJPEGバイト列にする
    pub fn process(&self, image: &DynamicImage) -> image::ImageResult<Vec<u8>> {
        encode_jpeg(&self.resize(image))
    }
}

/// アスペクト比を保ったまま `target` に収まるよう拡大縮小する
pub fn resize(image: &DynamicImage, target: ImageSize) -> DynamicImage {
    let source = ImageSize::new(image.width(), image.height());
    let size = fit_within(source, target);

    // 同じサイズなら再サンプリングしない（再適用しても結果が変わらない）
    if size == source {
        return image.clone();
    }

    image.resize_exact(size.width, size.height, FilterType::Lanczos3)
}

/// 最高品質のJPEGにエンコードする
///
/// アルファは落としてRGBで書き出す。同じ入力なら同じバイト列になる。
pub fn encode_jpeg(image: &DynamicImage) -> image::ImageResult<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut buffer = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY);
    rgb.write_with_encoder(encoder)?;
    Ok(buffer.into_inner())
}

/// 中央を正方形に切り抜いて `side` x `side` にする（モデル入力用）
pub fn center_crop_square(image: &DynamicImage, side: u32) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let edge = width.min(height).max(1);
    let x = (width.saturating_sub(edge)) / 2;
    let y = (height.saturating_sub(edge)) / 2;

    let cropped = image.crop_imm(x, y, edge, edge);
    if edge == side {
        return cropped;
    }
    cropped.resize_exact(side, side, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let img: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_fit_within_uses_smaller_ratio() {
        // 横長: 幅が律速
        assert_eq!(fit_within(ImageSize::new(600, 400), ImageSize::square(300)), ImageSize::new(300, 200));
        // 縦長: 高さが律速
        assert_eq!(fit_within(ImageSize::new(400, 600), ImageSize::square(300)), ImageSize::new(200, 300));
        // 小さい画像は拡大される
        assert_eq!(fit_within(ImageSize::new(60, 40), ImageSize::square(300)), ImageSize::new(300, 200));
    }

    #[test]
    fn test_fit_within_never_exceeds_target_and_keeps_aspect() {
        let target = ImageSize::new(300, 300);
        for &(w, h) in &[(1, 1), (3, 1000), (1000, 3), (4032, 3024), (299, 301), (7, 13), (300, 300)] {
            let size = fit_within(ImageSize::new(w, h), target);
            assert!(size.width <= target.width && size.height <= target.height, "{}x{} -> {}", w, h, size);
            assert!(size.width >= 1 && size.height >= 1);

            // 各軸の丸め誤差は0.5ピクセル以内
            let skew = (size.width as i64 * h as i64 - size.height as i64 * w as i64).abs();
            assert!(skew <= (w as i64 + h as i64) / 2 + 1, "{}x{} -> {}", w, h, size);
        }
    }

    #[test]
    fn test_resize_is_idempotent() {
        let preprocessor = ImagePreprocessor::default();
        for &(w, h) in &[(640, 480), (480, 640), (50, 20), (1000, 3)] {
            let once = preprocessor.resize(&gradient(w, h));
            let twice = preprocessor.resize(&once);
            assert_eq!((once.width(), once.height()), (twice.width(), twice.height()));
            assert_eq!(once.to_rgb8().as_raw(), twice.to_rgb8().as_raw());
        }
    }

    #[test]
    fn test_encode_is_deterministic() {
        let image = gradient(120, 90);
        let preprocessor = ImagePreprocessor::default();
        let a = preprocessor.process(&image).unwrap();
        let b = preprocessor.process(&image).unwrap();
        assert_eq!(a, b);

        let decoded = image::load_from_memory(&a).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (300, 225));
    }

    #[test]
    fn test_center_crop_square() {
        let cropped = center_crop_square(&gradient(300, 200), 64);
        assert_eq!((cropped.width(), cropped.height()), (64, 64));
    }
}
