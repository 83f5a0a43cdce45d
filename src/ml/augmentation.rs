//! 学習時のデータ拡張
//!
//! 回転・ズーム・左右反転をそれぞれ独立に確率的に適用します。
//! 固定サイズへのリサイズ・正規化の前段で使用し、推論時には使用しません。

use image::{imageops, Rgb, RgbImage};
use rand::Rng;

use crate::model::config::AugmentationSettings;

/// データ拡張器
#[derive(Debug, Clone)]
pub struct Augmenter {
    /// 最大回転角（度）。[-rotation_degrees, rotation_degrees] から一様に選ぶ
    rotation_degrees: f32,
    /// ズーム幅。倍率は [1 - zoom_range, 1 + zoom_range] から一様に選ぶ
    zoom_range: f32,
    /// 左右反転を行うか
    horizontal_flip: bool,
    /// 各変換を適用する確率
    probability: f64,
}

impl Default for Augmenter {
    fn default() -> Self {
        Self::from_settings(&AugmentationSettings::default())
    }
}

impl Augmenter {
    pub fn new(rotation_degrees: f32, zoom_range: f32, horizontal_flip: bool, probability: f64) -> Self {
        Self {
            rotation_degrees: rotation_degrees.abs(),
            zoom_range: zoom_range.abs().min(0.99),
            horizontal_flip,
            probability: probability.clamp(0.0, 1.0),
        }
    }

    pub fn from_settings(settings: &AugmentationSettings) -> Self {
        Self::new(
            settings.rotation_degrees,
            settings.zoom_range,
            settings.horizontal_flip,
            settings.probability,
        )
    }

    /// ランダムな拡張を適用
    pub fn apply<R: Rng + ?Sized>(&self, img: RgbImage, rng: &mut R) -> RgbImage {
        let angle = if self.rotation_degrees > 0.0 && rng.gen_bool(self.probability) {
            rng.gen_range(-self.rotation_degrees..=self.rotation_degrees)
        } else {
            0.0
        };
        let zoom = if self.zoom_range > 0.0 && rng.gen_bool(self.probability) {
            rng.gen_range(1.0 - self.zoom_range..=1.0 + self.zoom_range)
        } else {
            1.0
        };

        let img = if angle != 0.0 || zoom != 1.0 {
            rotate_zoom(&img, angle.to_radians(), zoom)
        } else {
            img
        };

        if self.horizontal_flip && rng.gen_bool(self.probability) {
            imageops::flip_horizontal(&img)
        } else {
            img
        }
    }
}

/// 画像中心を基準に回転・ズーム（出力サイズは入力と同じ）
///
/// 逆写像でバイリニア補間し、範囲外は最も近い端のピクセルで埋めます。
/// `zoom` < 1 で拡大（中心付近を切り出す）、> 1 で縮小。
pub fn rotate_zoom(img: &RgbImage, angle_rad: f32, zoom: f32) -> RgbImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img.clone();
    }

    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let (sin, cos) = angle_rad.sin_cos();

    RgbImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let sx = (cos * dx + sin * dy) * zoom + cx;
        let sy = (-sin * dx + cos * dy) * zoom + cy;
        sample_bilinear(img, sx, sy)
    })
}

fn sample_bilinear(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 7]))
    }

    #[test]
    fn test_identity_transform() {
        let img = gradient(9, 7);
        let out = rotate_zoom(&img, 0.0, 1.0);
        assert_eq!(out, img);
    }

    #[test]
    fn test_flip_only() {
        let img = gradient(4, 3);
        let augmenter = Augmenter::new(0.0, 0.0, true, 1.0);
        let mut rng = StdRng::seed_from_u64(42);
        let out = augmenter.apply(img.clone(), &mut rng);
        assert_eq!(out.get_pixel(0, 0), img.get_pixel(3, 0));
        assert_eq!(out.get_pixel(3, 2), img.get_pixel(0, 2));
    }

    #[test]
    fn test_disabled_augmenter_is_noop() {
        let img = gradient(8, 8);
        let augmenter = Augmenter::new(30.0, 0.2, true, 0.0);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(augmenter.apply(img.clone(), &mut rng), img);
    }

    #[test]
    fn test_preserves_dimensions() {
        let img = gradient(20, 12);
        let augmenter = Augmenter::new(30.0, 0.2, true, 1.0);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            let out = augmenter.apply(img.clone(), &mut rng);
            assert_eq!(out.dimensions(), (20, 12));
        }
    }

    #[test]
    fn test_uniform_image_stays_uniform() {
        // 端のピクセルで埋めるため、単色画像は回転・ズーム後も単色
        let img = RgbImage::from_pixel(16, 16, Rgb([30, 160, 40]));
        let out = rotate_zoom(&img, 25f32.to_radians(), 1.2);
        assert!(out.pixels().all(|p| *p == Rgb([30, 160, 40])));
    }
}
