//! アプリケーション設定管理モジュール
//!
//! 計算デバイスやモデル・学習・推論の設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::ClassifierError;
use crate::ml::ml_model::IMAGE_SIZE;
use crate::ml::preprocess::MAX_UPLOAD_BYTES;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
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

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// モデルアーティファクト（tar.gz）のパス
    pub model_path: String,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// ドロップアウト率
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: "models/plant_disease_cnn.tar.gz".to_string(),
            image_size: IMAGE_SIZE,
            dropout: 0.5,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード（分割・シャッフル用）
    pub seed: u64,
    /// 検証ディレクトリがない場合のトレーニングデータの割合
    pub train_ratio: f32,
    /// 検証精度が改善しないエポックがこの数続いたら打ち切る（未指定なら全エポック実行）
    #[serde(default)]
    pub patience: Option<usize>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 5,
            batch_size: 32,
            learning_rate: 1e-3,
            seed: 42,
            train_ratio: 0.8,
            patience: None,
        }
    }
}

impl TrainingSettings {
    /// 設定値の検証
    pub fn validate(&self) -> Result<(), ClassifierError> {
        if self.num_epochs == 0 {
            return Err(ClassifierError::InvalidSettings("num_epochs must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ClassifierError::InvalidSettings("batch_size must be at least 1".to_string()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ClassifierError::InvalidSettings(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.train_ratio > 0.0 && self.train_ratio < 1.0) {
            return Err(ClassifierError::InvalidSettings(format!(
                "train_ratio must be in (0, 1), got {}",
                self.train_ratio
            )));
        }
        if self.patience == Some(0) {
            return Err(ClassifierError::InvalidSettings("patience must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// データ拡張設定（学習時のみ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentationSettings {
    /// データ拡張を行うか
    pub enabled: bool,
    /// 最大回転角（度）
    pub rotation_degrees: f32,
    /// ズーム幅（0.2 = ±20%）
    pub zoom_range: f32,
    /// 左右反転
    pub horizontal_flip: bool,
    /// 各変換の適用確率
    pub probability: f64,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            rotation_degrees: 30.0,
            zoom_range: 0.2,
            horizontal_flip: true,
            probability: 0.5,
        }
    }
}

/// 推論設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSettings {
    /// 受け付ける画像の最大バイト数
    pub max_upload_bytes: usize,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            max_upload_bytes: MAX_UPLOAD_BYTES,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// データ拡張設定
    #[serde(default)]
    pub augmentation: AugmentationSettings,
    /// 推論設定
    #[serde(default)]
    pub inference: InferenceSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 計算デバイスを設定
    pub fn set_device_type(&mut self, device_type: DeviceType) {
        self.device_type = device_type;
    }

    /// モデルパスを設定
    pub fn set_model_path(&mut self, path: String) {
        self.model.model_path = path;
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        info!("=== アプリケーション設定 ===");
        info!("計算デバイス: {}", self.device_type);
        info!("モデルパス: {}", self.model.model_path);
        info!("入力サイズ: {0}x{0}", self.model.image_size);
        info!("ドロップアウト率: {}", self.model.dropout);
        info!(
            "エポック数: {}, バッチサイズ: {}, 学習率: {}, シード: {}",
            self.training.num_epochs, self.training.batch_size, self.training.learning_rate, self.training.seed
        );
        if self.augmentation.enabled {
            info!(
                "データ拡張: 回転±{}°, ズーム±{}%, 左右反転={}",
                self.augmentation.rotation_degrees,
                self.augmentation.zoom_range * 100.0,
                self.augmentation.horizontal_flip
            );
        } else {
            info!("データ拡張: 無効");
        }
        info!("最大アップロードサイズ: {} バイト", self.inference.max_upload_bytes);
    }
}
