pub mod config;
pub mod label_encoder;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, Architecture, DeviceType, ServingSettings, TrainingSettings};
pub use label_encoder::LabelEncoder;
pub use model_metadata::{Column, ColumnType, Hyperparameters, ModelMetadata};
pub use model_storage::{
    load_metadata, load_model_with_metadata, print_metadata_info, save_model_with_metadata,
};
