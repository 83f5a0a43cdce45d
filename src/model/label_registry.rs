//! ラベルレジストリ
//!
//! クラスインデックスと病名の対応表。学習時にクラスディレクトリ名をソートして一度だけ作成し、
//! モデルと同じアーティファクトに保存します。推論時は出力数との一致を必ず検証します。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{ClassifierError, LoadError};

/// クラスインデックス → ラベル名の順序付きリスト
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelRegistry {
    labels: Vec<String>,
}

impl LabelRegistry {
    /// ラベル列からレジストリを作成（順序はそのまま保持）
    ///
    /// 空のリストや重複したラベルはエラーになります。
    pub fn new(labels: Vec<String>) -> Result<Self, LoadError> {
        let registry = Self { labels };
        registry.validate()?;
        Ok(registry)
    }

    /// クラスディレクトリ名からレジストリを作成
    ///
    /// 名前はバイト順（辞書順）にソートされ、その位置がクラスインデックスになります。
    pub fn from_class_dirs<I, S>(names: I) -> Result<Self, LoadError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut labels: Vec<String> = names.into_iter().map(Into::into).collect();
        labels.sort();
        Self::new(labels)
    }

    /// 空でないこと・重複がないことを検証
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.labels.is_empty() {
            return Err(LoadError::InvalidRegistry("registry is empty".to_string()));
        }
        let mut seen = HashSet::with_capacity(self.labels.len());
        for label in &self.labels {
            if label.is_empty() {
                return Err(LoadError::InvalidRegistry("empty label name".to_string()));
            }
            if !seen.insert(label.as_str()) {
                return Err(LoadError::InvalidRegistry(format!("duplicate label '{}'", label)));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// クラスインデックスからラベル名を取得
    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// ラベル名からクラスインデックスを取得
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// ネットワークの出力数とレジストリ長が一致するか検証
    pub fn ensure_output_width(&self, outputs: usize) -> Result<(), ClassifierError> {
        if self.labels.len() != outputs {
            return Err(ClassifierError::LabelMappingMismatch {
                labels: self.labels.len(),
                outputs,
            });
        }
        Ok(())
    }

    /// 学習セットと検証セットのクラス構成が一致するか検証
    pub fn ensure_same_classes(&self, validation: &LabelRegistry) -> Result<(), ClassifierError> {
        if self.len() != validation.len() {
            return Err(ClassifierError::ClassCountMismatch {
                train: self.len(),
                validation: validation.len(),
            });
        }
        for (index, (train, val)) in self.labels.iter().zip(validation.labels.iter()).enumerate() {
            if train != val {
                return Err(ClassifierError::ClassOrderMismatch {
                    index,
                    train: train.clone(),
                    validation: val.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_class_dirs_sorts() {
        let registry = LabelRegistry::from_class_dirs(["Apple_scab", "Apple_healthy", "Tomato_leaf_mold"]).unwrap();
        assert_eq!(registry.labels(), &["Apple_healthy", "Apple_scab", "Tomato_leaf_mold"]);
        assert_eq!(registry.index_of("Apple_scab"), Some(1));
        assert_eq!(registry.label(0), Some("Apple_healthy"));
        assert_eq!(registry.label(3), None);
    }

    #[test]
    fn test_rejects_empty_and_duplicates() {
        assert!(LabelRegistry::new(vec![]).is_err());
        assert!(LabelRegistry::new(vec!["a".into(), "b".into(), "a".into()]).is_err());
    }

    #[test]
    fn test_output_width_mismatch() {
        let labels: Vec<String> = (0..36).map(|i| format!("class_{:02}", i)).collect();
        let registry = LabelRegistry::new(labels).unwrap();
        assert!(registry.ensure_output_width(36).is_ok());
        match registry.ensure_output_width(37) {
            Err(ClassifierError::LabelMappingMismatch { labels, outputs }) => {
                assert_eq!(labels, 36);
                assert_eq!(outputs, 37);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_same_classes() {
        let train = LabelRegistry::from_class_dirs(["a", "b"]).unwrap();
        let same = LabelRegistry::from_class_dirs(["b", "a"]).unwrap();
        let fewer = LabelRegistry::from_class_dirs(["a"]).unwrap();
        let renamed = LabelRegistry::from_class_dirs(["a", "c"]).unwrap();

        assert!(train.ensure_same_classes(&same).is_ok());
        assert!(matches!(
            train.ensure_same_classes(&fewer),
            Err(ClassifierError::ClassCountMismatch { train: 2, validation: 1 })
        ));
        assert!(matches!(
            train.ensure_same_classes(&renamed),
            Err(ClassifierError::ClassOrderMismatch { index: 1, .. })
        ));
    }

    #[test]
    fn test_serde_roundtrip_preserves_order() {
        let registry = LabelRegistry::new(vec!["z".into(), "a".into(), "m".into()]).unwrap();
        let json = serde_json::to_string(&registry).unwrap();
        assert_eq!(json, r#"["z","a","m"]"#);
        let restored: LabelRegistry = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, registry);
    }
}
