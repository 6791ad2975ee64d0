pub mod ml_model;
pub mod resnet;
pub mod trainer;
pub mod training;
pub mod inference;

pub use ml_model::{
    decode_and_normalize_image, Backbone, ClassifierConfig, ClassifierHead, HardHatClassifier,
};
pub use trainer::{EpochStats, FittedModel, Trainer, TransferTrainer, WeightsFormat};
pub use training::{run_training, train_model, TrainingReport};
pub use inference::{model_to_bytes, InferenceEngine};
