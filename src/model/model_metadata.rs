//! モデルメタデータの定義
//!
//! tar.gz形式でモデルと一緒に保存される情報。アーキテクチャ記述とラベルレジストリを
//! 重みと同じアーティファクトに含めることで、学習時と推論時のクラス順序を一致させます。

use serde::{Deserialize, Serialize};

use crate::error::LoadError;
use crate::ml::ml_model::ModelConfig;
use crate::model::label_registry::LabelRegistry;
use crate::types::EpochMetrics;

/// アーティファクト形式のバージョン（互換性のない変更で更新する）
pub const FORMAT_VERSION: u32 = 2;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// アーティファクト形式のバージョン
    pub format_version: u32,

    /// アーキテクチャ記述（クラス数・入力サイズ・ドロップアウト率）
    pub architecture: ModelConfig,

    /// クラスインデックス → 病名
    /// 学習データのクラスディレクトリ名をソートした順序
    pub labels: LabelRegistry,

    /// 実際に学習したエポック数
    pub num_epochs: u32,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,

    /// 最終エポックの指標
    #[serde(default)]
    pub final_metrics: Option<EpochMetrics>,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(architecture: ModelConfig, labels: LabelRegistry, num_epochs: u32) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            architecture,
            labels,
            num_epochs,
            trained_at: chrono::Local::now().to_rfc3339(),
            final_metrics: None,
        }
    }

    pub fn with_final_metrics(mut self, metrics: Option<EpochMetrics>) -> Self {
        self.final_metrics = metrics;
        self
    }

    /// モデル入力サイズ
    pub fn input_size(&self) -> usize {
        self.architecture.image_size
    }

    /// 読み込んだメタデータの検証
    ///
    /// レジストリ長とクラス数の一致はここでは検証しません（推論時に検証）。
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.format_version != FORMAT_VERSION {
            return Err(LoadError::UnsupportedVersion {
                found: self.format_version,
                expected: FORMAT_VERSION,
            });
        }
        self.labels.validate()?;
        self.architecture
            .validate()
            .map_err(|e| LoadError::Architecture(e.to_string()))
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModelMetadata {
        let labels = LabelRegistry::from_class_dirs(["Apple_scab", "Apple_healthy"]).unwrap();
        ModelMetadata::new(ModelConfig::new(2), labels, 5)
    }

    #[test]
    fn test_json_roundtrip() {
        let metadata = sample();
        let json = metadata.to_json_string().unwrap();
        let restored = ModelMetadata::from_json_string(&json).unwrap();

        assert_eq!(restored.format_version, FORMAT_VERSION);
        assert_eq!(restored.architecture, metadata.architecture);
        assert_eq!(restored.labels.labels(), &["Apple_healthy", "Apple_scab"]);
        assert_eq!(restored.input_size(), 128);
        assert!(restored.validate().is_ok());
    }

    #[test]
    fn test_rejects_other_versions() {
        let mut metadata = sample();
        metadata.format_version = FORMAT_VERSION + 1;
        assert!(matches!(metadata.validate(), Err(LoadError::UnsupportedVersion { .. })));
    }

    #[test]
    fn test_rejects_invalid_architecture() {
        let mut metadata = sample();
        metadata.architecture = ModelConfig::new(2).with_image_size(8);
        assert!(matches!(metadata.validate(), Err(LoadError::Architecture(_))));
    }
}
