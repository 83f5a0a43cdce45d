//! 機械学習モデルの共通定義
//!
//! 葉の病害分類用CNNモデルと関連する設定を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{
        activation::{log_softmax, softmax},
        backend::Backend,
        ElementConversion, Int, Tensor,
    },
    train::ClassificationOutput,
};
use tracing::debug;

use crate::error::ClassifierError;

/// 画像サイズ（学習済みモデルの入力解像度）
pub const IMAGE_SIZE: usize = 128;

/// 畳み込み各段のチャネル数
pub const CONV_CHANNELS: [usize; 3] = [32, 64, 128];

/// 全結合層（隠れ層）のユニット数
pub const HIDDEN_UNITS: usize = 128;

/// モデル設定（アーキテクチャ記述としてアーティファクトにも保存される）
#[derive(Config, Debug, PartialEq)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 128)]
    pub image_size: usize,
}

impl ModelConfig {
    /// 3段の {Conv 3x3 (no padding) + MaxPool 2x2} 後の特徴マップサイズ
    ///
    /// 入力が小さすぎて途中で0になる場合は `None`。
    pub fn feature_map_size(&self) -> Option<usize> {
        let mut size = self.image_size;
        for _ in 0..CONV_CHANNELS.len() {
            size = size.checked_sub(2)? / 2;
        }
        (size > 0).then_some(size)
    }

    /// Flatten後の特徴次元
    pub fn flattened_features(&self) -> Option<usize> {
        self.feature_map_size()
            .map(|size| CONV_CHANNELS[CONV_CHANNELS.len() - 1] * size * size)
    }

    /// 設定値の検証
    pub fn validate(&self) -> Result<(), ClassifierError> {
        if self.num_classes == 0 {
            return Err(ClassifierError::InvalidArchitecture(
                "num_classes must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ClassifierError::InvalidArchitecture(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.feature_map_size().is_none() {
            return Err(ClassifierError::InvalidArchitecture(format!(
                "input size {}x{} is too small for three conv/pool stages (minimum 22x22)",
                self.image_size, self.image_size
            )));
        }
        Ok(())
    }

    /// モデルを初期化（重みはランダム）
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<PlantClassifier<B>, ClassifierError> {
        self.validate()?;
        let feature_map_size = self.feature_map_size().unwrap_or_default();
        let d = CONV_CHANNELS[2] * feature_map_size * feature_map_size;

        debug!(
            "[Model] 入力: {0}x{0}, 特徴マップ: {1} x {2}x{2}, Flatten: {3}, FC: {3} -> {4} -> {5}",
            self.image_size, CONV_CHANNELS[2], feature_map_size, d, HIDDEN_UNITS, self.num_classes
        );

        Ok(PlantClassifier {
            conv1: Conv2dConfig::new([3, CONV_CHANNELS[0]], [3, 3]).init(device),
            conv2: Conv2dConfig::new([CONV_CHANNELS[0], CONV_CHANNELS[1]], [3, 3]).init(device),
            conv3: Conv2dConfig::new([CONV_CHANNELS[1], CONV_CHANNELS[2]], [3, 3]).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(d, HIDDEN_UNITS).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(HIDDEN_UNITS, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// 葉の病害分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (no padding) + ReLU + MaxPool 2x2} x 3段 (32 -> 64 -> 128 ch)
/// - Flatten
/// - FC: d -> 128 + ReLU
/// - Dropout 0.5（autodiffバックエンド上でのみ有効）
/// - FC: 128 -> num_classes
/// - Softmax (分類時)
///
/// # サイズ計算 (128x128入力)
/// 126 -> 63 -> 61 -> 30 -> 28 -> 14、特徴次元 d = 128 * 14 * 14 = 25088
#[derive(Module, Debug)]
pub struct PlantClassifier<B: Backend> {
    conv1: Conv2d<B>, // 3 -> 32
    conv2: Conv2d<B>, // 32 -> 64
    conv3: Conv2d<B>, // 64 -> 128
    pool: MaxPool2d,  // 2x2, stride 2

    fc1: Linear<B>, // d -> 128
    dropout: Dropout,
    fc2: Linear<B>, // 128 -> num_classes

    activation: Relu,
}

impl<B: Backend> PlantClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.stage(&self.conv1, images);
        let x = self.stage(&self.conv2, x);
        let x = self.stage(&self.conv3, x);

        // Flatten
        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);

        self.fc2.forward(x)
    }

    fn stage(&self, conv: &Conv2d<B>, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = conv.forward(x);
        let x = self.activation.forward(x);
        self.pool.forward(x)
    }

    /// 順伝播 + Softmax（クラスごとの確率分布）
    pub fn forward_softmax(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 出力クラス数（最終全結合層の幅）
    pub fn num_classes(&self) -> usize {
        self.fc2.weight.val().dims()[1]
    }

    /// 順伝播と損失計算（学習・検証用）
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    /// - `labels`: one-hotラベル [batch_size, num_classes]
    /// - `targets`: クラスID [batch_size]
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        labels: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = categorical_cross_entropy(output.clone(), labels);

        ClassificationOutput::new(loss, output, targets)
    }
}

/// one-hotラベルとSoftmax出力のカテゴリカル交差エントロピー（バッチ平均）
pub fn categorical_cross_entropy<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 2>) -> Tensor<B, 1> {
    let log_probs = log_softmax(logits, 1);
    (log_probs * labels).sum_dim(1).mean().neg()
}

/// Top-1で正解したサンプル数
pub fn correct_predictions<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = logits.dims();
    let predictions = logits.argmax(1).reshape([batch_size]);
    let correct: i64 = predictions.equal(targets).int().sum().into_scalar().elem();
    correct as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_feature_map_size() {
        assert_eq!(ModelConfig::new(2).feature_map_size(), Some(14));
        assert_eq!(ModelConfig::new(2).flattened_features(), Some(25088));
        assert_eq!(ModelConfig::new(2).with_image_size(32).feature_map_size(), Some(2));
        assert_eq!(ModelConfig::new(2).with_image_size(20).feature_map_size(), None);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let device = Default::default();
        assert!(ModelConfig::new(0).init::<TestBackend>(&device).is_err());
        assert!(ModelConfig::new(3).with_image_size(16).init::<TestBackend>(&device).is_err());
        assert!(ModelConfig::new(3).with_dropout(1.0).init::<TestBackend>(&device).is_err());
    }

    #[test]
    fn test_forward_shapes_and_softmax() {
        let device = Default::default();
        let model = ModelConfig::new(5)
            .with_image_size(32)
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(model.num_classes(), 5);

        let images = Tensor::<TestBackend, 4>::ones([2, 3, 32, 32], &device);
        let probs = model.forward_softmax(images);
        assert_eq!(probs.dims(), [2, 5]);

        let sums = probs.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_forward_is_deterministic_without_autodiff() {
        let device = Default::default();
        let model = ModelConfig::new(3)
            .with_image_size(32)
            .init::<TestBackend>(&device)
            .unwrap();
        let images = Tensor::<TestBackend, 4>::random(
            [1, 3, 32, 32],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let a = model.forward(images.clone()).into_data().to_vec::<f32>().unwrap();
        let b = model.forward(images).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_cross_entropy_and_accuracy() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[10.0, 0.0], [0.0, 10.0]], &device);
        let labels = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [1.0, 0.0]], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 0], &device);

        let loss: f32 = categorical_cross_entropy(logits.clone(), labels).into_scalar().elem();
        // 1件目はほぼ0、2件目は約10
        assert!((loss - 5.0).abs() < 0.01);
        assert_eq!(correct_predictions(logits, targets), 1);
    }
}
