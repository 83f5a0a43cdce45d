//! 植物の葉の病害分類
//!
//! クラスごとのディレクトリに分けた葉の画像からCNNを学習し、
//! 学習済みモデルで1枚ずつ病名と確信度を推定します。

pub mod backend;
pub mod error;
pub mod history;
pub mod logging;
pub mod ml;
pub mod model;
pub mod types;

pub use error::{ClassifierError, DecodeError, LoadError, Result};
pub use history::TrainingHistory;
pub use ml::{InferenceEngine, TrainingReport, TrainingRequest};
pub use model::{AppConfig, DeviceType, LabelRegistry, ModelMetadata};
pub use types::{DetectionResponse, EpochMetrics, PredictionResult};
