pub mod augmentation;
pub mod dataset;
pub mod inference;
pub mod ml_model;
pub mod preprocess;
pub mod training;

pub use augmentation::Augmenter;
pub use dataset::{check_dataset, discover_classes, load_splits, DatasetReport, ImageFolder, LeafBatch, LeafBatcher, LeafItem};
pub use inference::{InferenceEngine, LoadedModel};
pub use ml_model::{ModelConfig, PlantClassifier, IMAGE_SIZE};
pub use preprocess::{ImagePreprocessor, ImageTensor, MAX_UPLOAD_BYTES};
pub use training::{train, train_model, TrainingReport, TrainingRequest};
