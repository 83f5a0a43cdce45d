pub mod config;
pub mod label_registry;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, AugmentationSettings, DeviceType, InferenceSettings, ModelSettings, TrainingSettings};
pub use label_registry::LabelRegistry;
pub use model_metadata::{ModelMetadata, FORMAT_VERSION};
pub use model_storage::{load_metadata, load_model_binary, load_model_with_metadata, print_metadata_info, save_model, save_model_with_metadata};
