//! 学習履歴（エポックごとの指標）のCSV入出力

use std::path::Path;

use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};

use crate::types::EpochMetrics;

/// 学習履歴
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn epochs(&self) -> &[EpochMetrics] {
        &self.epochs
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    /// 検証精度が最も高いエポック
    pub fn best(&self) -> Option<&EpochMetrics> {
        self.epochs
            .iter()
            .max_by(|a, b| a.val_accuracy.total_cmp(&b.val_accuracy))
    }

    /// CSVに書き出す（ヘッダー付き）
    pub fn save_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = WriterBuilder::new()
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;

        for metrics in &self.epochs {
            writer.serialize(metrics)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn load_csv(path: &Path) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let mut history = Self::new();
        for result in reader.deserialize() {
            let metrics: EpochMetrics = result?;
            history.push(metrics);
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(epoch: usize, val_accuracy: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            train_loss: 1.0 / epoch as f64,
            train_accuracy: 0.5,
            val_loss: 0.9,
            val_accuracy,
        }
    }

    #[test]
    fn test_csv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history/metrics.csv");

        let mut history = TrainingHistory::new();
        history.push(metrics(1, 0.4));
        history.push(metrics(2, 0.7));
        history.push(metrics(3, 0.6));
        history.save_csv(&path).unwrap();

        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("epoch,train_loss,train_accuracy,val_loss,val_accuracy"));

        let loaded = TrainingHistory::load_csv(&path).unwrap();
        assert_eq!(loaded, history);
        assert_eq!(loaded.best().map(|m| m.epoch), Some(2));
        assert_eq!(loaded.last().map(|m| m.epoch), Some(3));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TrainingHistory::load_csv(&dir.path().join("none.csv")).is_err());
    }
}
