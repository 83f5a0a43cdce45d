//! 画像前処理
//!
//! 任意の画像バイト列を固定サイズ・[0, 1]正規化済みのテンソルに変換します。
//! 学習（データ拡張あり）と推論で同じ処理を使います。

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use image::{imageops::FilterType, ImageError, ImageReader, Limits, RgbImage};
use rand::Rng;

use crate::error::{ClassifierError, DecodeError};
use crate::ml::augmentation::Augmenter;

/// 受け付ける画像の最大バイト数（10 MiB）
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// デコード後の画像の最大辺（ピクセル）
pub const MAX_DECODED_DIMENSION: u32 = 8192;

/// リサイズに使うフィルタ（学習・推論で同一であること）
pub const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// 正規化済み画像テンソル
///
/// HWC順（高さ, 幅, RGB）で平坦化した [0, 1] の値を保持します。
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl ImageTensor {
    /// 形状 (H, W, 3)
    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, 3]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// ネットワークの入力形状と一致するか検証
    pub fn ensure_shape(&self, image_size: usize) -> Result<(), ClassifierError> {
        let expected = [image_size, image_size, 3];
        if self.shape() != expected {
            return Err(ClassifierError::InputShapeMismatch {
                expected,
                found: self.shape(),
            });
        }
        Ok(())
    }

    /// 画像テンソル列をバッチ化 (N, H, W, 3) -> [N, 3, H, W]
    pub fn to_batch<B: Backend>(images: &[ImageTensor], device: &B::Device) -> Result<Tensor<B, 4>, ClassifierError> {
        let first = images
            .first()
            .ok_or_else(|| ClassifierError::Tensor("cannot build a batch from zero images".to_string()))?;
        let [height, width, channels] = first.shape();

        let mut data = Vec::with_capacity(images.len() * height * width * channels);
        for image in images {
            if image.shape() != first.shape() {
                return Err(ClassifierError::InputShapeMismatch {
                    expected: first.shape(),
                    found: image.shape(),
                });
            }
            data.extend_from_slice(&image.data);
        }

        Ok(Tensor::<B, 1>::from_floats(data.as_slice(), device)
            .reshape([images.len(), height, width, channels])
            .permute([0, 3, 1, 2]))
    }
}

/// 画像前処理器
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    image_size: u32,
    max_bytes: usize,
}

impl ImagePreprocessor {
    pub fn new(image_size: usize) -> Self {
        Self {
            image_size: image_size as u32,
            max_bytes: MAX_UPLOAD_BYTES,
        }
    }

    /// 受け付ける最大バイト数を変更
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn image_size(&self) -> usize {
        self.image_size as usize
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// バイト列をRGB画像にデコード（サイズ上限・デコード上限を適用）
    pub fn decode(&self, bytes: &[u8]) -> Result<RgbImage, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        if bytes.len() > self.max_bytes {
            return Err(DecodeError::TooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }

        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| DecodeError::Malformed(ImageError::IoError(e)))?;

        let mut limits = Limits::default();
        limits.max_image_width = Some(MAX_DECODED_DIMENSION);
        limits.max_image_height = Some(MAX_DECODED_DIMENSION);
        reader.limits(limits);

        let img = reader.decode().map_err(DecodeError::Malformed)?;
        // アルファ除去・グレースケール展開
        Ok(img.to_rgb8())
    }

    /// 推論用の前処理（データ拡張なし）
    pub fn preprocess(&self, bytes: &[u8]) -> Result<ImageTensor, DecodeError> {
        let img = self.decode(bytes)?;
        Ok(self.to_tensor(&img))
    }

    /// 学習用の前処理（リサイズ前にデータ拡張を適用）
    pub fn preprocess_augmented<R: Rng + ?Sized>(
        &self,
        bytes: &[u8],
        augmenter: &Augmenter,
        rng: &mut R,
    ) -> Result<ImageTensor, DecodeError> {
        let img = self.decode(bytes)?;
        let img = augmenter.apply(img, rng);
        Ok(self.to_tensor(&img))
    }

    /// ファイルを読み込み（サイズ上限を超える分は読まない）
    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>, DecodeError> {
        let read_err = |source| DecodeError::Read {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(read_err)?;
        let size = file.metadata().map_err(read_err)?.len();
        if size > self.max_bytes as u64 {
            return Err(DecodeError::TooLarge {
                size: size as usize,
                limit: self.max_bytes,
            });
        }

        // 読み込み中にファイルが伸びても上限+1バイトで打ち切る
        let mut bytes = Vec::with_capacity(size as usize);
        file.take(self.max_bytes as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(read_err)?;
        if bytes.len() > self.max_bytes {
            return Err(DecodeError::TooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }
        Ok(bytes)
    }

    /// 画像ファイルを最後までデコードできるか確認
    pub fn decode_file(&self, path: &Path) -> Result<RgbImage, DecodeError> {
        let bytes = self.read_file(path)?;
        self.decode(&bytes)
    }

    /// 画像ファイルを前処理（データ拡張なし）
    pub fn preprocess_file(&self, path: &Path) -> Result<ImageTensor, DecodeError> {
        let bytes = self.read_file(path)?;
        self.preprocess(&bytes)
    }

    /// 固定サイズへリサイズし、[0, 1] に正規化
    ///
    /// アスペクト比は保持しません（レターボックスなし）。
    pub fn to_tensor(&self, img: &RgbImage) -> ImageTensor {
        let size = self.image_size;
        let resized;
        let img = if img.dimensions() == (size, size) {
            img
        } else {
            resized = image::imageops::resize(img, size, size, RESIZE_FILTER);
            &resized
        };

        let data = img
            .pixels()
            .flat_map(|p| p.0)
            .map(|v| v as f32 / 255.0)
            .collect();

        ImageTensor {
            height: size as usize,
            width: size as usize,
            data,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::{GrayImage, ImageFormat, Luma, Rgb, Rgba, RgbaImage};

    pub(crate) fn encode_png(img: &RgbImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_rejects_empty_payload() {
        let pre = ImagePreprocessor::new(128);
        assert!(matches!(pre.preprocess(&[]), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_size_limit_boundary() {
        let pre = ImagePreprocessor::new(128);
        let oversized = vec![0u8; MAX_UPLOAD_BYTES + 1];
        assert!(matches!(
            pre.preprocess(&oversized),
            Err(DecodeError::TooLarge { size, limit }) if size == MAX_UPLOAD_BYTES + 1 && limit == MAX_UPLOAD_BYTES
        ));

        // ちょうど上限のサイズはサイズ判定を通過し、デコードで失敗する
        let at_limit = vec![0u8; MAX_UPLOAD_BYTES];
        assert!(matches!(pre.preprocess(&at_limit), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_rejects_garbage_and_truncated() {
        let pre = ImagePreprocessor::new(32);
        assert!(matches!(pre.preprocess(b"not an image"), Err(DecodeError::Malformed(_))));

        let png = encode_png(&RgbImage::from_pixel(40, 40, Rgb([1, 2, 3])));
        let truncated = &png[..png.len() / 2];
        assert!(matches!(pre.preprocess(truncated), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_resize_and_scale() {
        let pre = ImagePreprocessor::new(128);
        let png = encode_png(&RgbImage::from_pixel(300, 200, Rgb([255, 0, 51])));
        let tensor = pre.preprocess(&png).unwrap();

        assert_eq!(tensor.shape(), [128, 128, 3]);
        assert!(tensor.ensure_shape(128).is_ok());
        assert!(tensor.ensure_shape(64).is_err());
        assert!((tensor.data()[0] - 1.0).abs() < 1e-6);
        assert!(tensor.data()[1].abs() < 1e-6);
        assert!((tensor.data()[2] - 0.2).abs() < 1e-6);
        assert!(tensor.data().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_grayscale_and_alpha_become_rgb() {
        let pre = ImagePreprocessor::new(16);

        let mut buf = Cursor::new(Vec::new());
        GrayImage::from_pixel(10, 10, Luma([128]))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        let gray = pre.preprocess(buf.get_ref()).unwrap();
        assert_eq!(gray.shape(), [16, 16, 3]);
        assert!(gray.data().iter().all(|v| (v - 128.0 / 255.0).abs() < 1e-6));

        let mut buf = Cursor::new(Vec::new());
        RgbaImage::from_pixel(10, 10, Rgba([0, 255, 0, 10]))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        let rgba = pre.preprocess(buf.get_ref()).unwrap();
        assert_eq!(rgba.shape(), [16, 16, 3]);
        assert!((rgba.data()[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_is_deterministic() {
        let pre = ImagePreprocessor::new(64);
        let img = RgbImage::from_fn(97, 53, |x, y| Rgb([x as u8, y as u8, (x + y) as u8]));
        let png = encode_png(&img);
        assert_eq!(pre.preprocess(&png).unwrap(), pre.preprocess(&png).unwrap());
    }

    #[test]
    fn test_to_batch_is_nchw() {
        let pre = ImagePreprocessor::new(2);
        let img = RgbImage::from_fn(2, 2, |x, y| Rgb([(x * 100) as u8, (y * 100) as u8, 255]));
        let tensor = pre.to_tensor(&img);

        let device = Default::default();
        let batch = ImageTensor::to_batch::<NdArray>(&[tensor.clone(), tensor], &device).unwrap();
        assert_eq!(batch.dims(), [2, 3, 2, 2]);

        let values = batch.into_data().to_vec::<f32>().unwrap();
        // 1枚目のRチャネル: (0,0)=0, (1,0)=100, (0,1)=0, (1,1)=100
        assert!((values[1] - 100.0 / 255.0).abs() < 1e-6);
        // 1枚目のBチャネルはすべて1.0
        assert!(values[8..12].iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_to_batch_rejects_mixed_shapes() {
        let device = Default::default();
        let a = ImagePreprocessor::new(4).to_tensor(&RgbImage::new(4, 4));
        let b = ImagePreprocessor::new(8).to_tensor(&RgbImage::new(8, 8));
        assert!(ImageTensor::to_batch::<NdArray>(&[a, b], &device).is_err());
        assert!(ImageTensor::to_batch::<NdArray>(&[], &device).is_err());
    }

    #[test]
    fn test_read_file_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![0u8; 65]).unwrap();

        let pre = ImagePreprocessor::new(16).with_max_bytes(64);
        assert!(matches!(pre.preprocess_file(&path), Err(DecodeError::TooLarge { size: 65, limit: 64 })));
        assert!(matches!(
            pre.preprocess_file(&dir.path().join("missing.png")),
            Err(DecodeError::Read { .. })
        ));

        let exact = dir.path().join("exact.bin");
        std::fs::write(&exact, vec![7u8; 64]).unwrap();
        assert_eq!(pre.read_file(&exact).unwrap().len(), 64);
    }

    #[test]
    fn test_decode_file_rejects_truncated_body() {
        let dir = tempfile::tempdir().unwrap();
        let png = encode_png(&RgbImage::from_pixel(40, 40, Rgb([9, 99, 9])));
        let whole = dir.path().join("whole.png");
        let cut = dir.path().join("cut.png");
        std::fs::write(&whole, &png).unwrap();
        std::fs::write(&cut, &png[..png.len() / 2]).unwrap();

        let pre = ImagePreprocessor::new(16);
        assert_eq!(pre.decode_file(&whole).unwrap().dimensions(), (40, 40));
        assert!(matches!(pre.decode_file(&cut), Err(DecodeError::Malformed(_))));
    }
}
