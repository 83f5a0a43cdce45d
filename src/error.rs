//! エラー型の定義
//!
//! 入力画像・データセット・モデル読み込み・推論の失敗をそれぞれ区別できるように、
//! 呼び出し側が種類ごとに処理できるエラー型を提供します。

use std::path::PathBuf;

use thiserror::Error;

/// 画像デコード時のエラー（クライアント入力の不備）
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("image payload is empty (0 bytes)")]
    Empty,
    #[error("image payload is too large: {size} bytes (limit {limit} bytes)")]
    TooLarge { size: usize, limit: usize },
    #[error("image payload could not be decoded: {0}")]
    Malformed(#[source] image::ImageError),
    #[error("failed to read image file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// モデルアーティファクト読み込み時のエラー
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model artifact not found: {0:?}")]
    NotFound(PathBuf),
    #[error("failed to read model artifact {path:?}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} not found in model artifact")]
    MissingEntry(&'static str),
    #[error("invalid model metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("unsupported artifact format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("invalid label registry: {0}")]
    InvalidRegistry(String),
    #[error("invalid architecture description: {0}")]
    Architecture(String),
    #[error("failed to restore model weights: {0}")]
    Weights(String),
    #[error("model weights do not match the architecture ({expected} parameters expected, {found} found)")]
    ShapeMismatch { expected: usize, found: usize },
}

/// 分類器全体のエラー
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("model is not loaded")]
    ModelNotLoaded,

    #[error("label registry has {labels} entries but the network outputs {outputs} classes")]
    LabelMappingMismatch { labels: usize, outputs: usize },

    #[error("class directory '{class}' contains no readable images ({path:?})")]
    EmptyDataset { class: String, path: PathBuf },

    #[error("no class directories found in {0:?}")]
    NoClasses(PathBuf),

    #[error("training set has {train} classes but validation set has {validation}")]
    ClassCountMismatch { train: usize, validation: usize },

    #[error("class {index} is '{train}' in the training set but '{validation}' in the validation set")]
    ClassOrderMismatch {
        index: usize,
        train: String,
        validation: String,
    },

    #[error("input tensor shape {found:?} does not match the network input {expected:?}")]
    InputShapeMismatch {
        expected: [usize; 3],
        found: [usize; 3],
    },

    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("{count} image(s) in a batch could not be read, first {path:?}: {reason}")]
    UnreadableTrainingImage {
        path: PathBuf,
        reason: String,
        count: usize,
    },

    #[error("training diverged at epoch {epoch}: loss is {loss}")]
    TrainingDiverged { epoch: usize, loss: f64 },

    #[error("failed to persist model artifact {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tensor data error: {0}")]
    Tensor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClassifierError>;
