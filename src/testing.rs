//! テスト用ヘルパー

use std::io::Cursor;
use std::path::Path;

use image::{ImageBuffer, ImageFormat, Rgb};

use crate::ml::{model_to_bytes, ClassifierConfig};
use crate::model::{
    save_model_with_metadata, Architecture, Hyperparameters, LabelEncoder, ModelMetadata,
};

pub type TestBackend = burn_ndarray::NdArray<f32>;
pub type TestAutodiffBackend = burn_autodiff::Autodiff<TestBackend>;

/// 単色のPNG画像を作る
pub fn png_bytes(color: [u8; 3], width: u32, height: u32) -> Vec<u8> {
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(width, height, Rgb(color));
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
}

/// 未学習（初期値）のモデルファイルを書き出す
pub fn write_test_artifact(path: &Path, labels: &[&str]) -> ModelMetadata {
    let encoder = LabelEncoder::from_labels(labels.iter().map(|l| l.to_string()).collect());
    let config = ClassifierConfig::new(encoder.num_classes(), Architecture::ConvSmall)
        .with_image_size(16)
        .with_dropout(0.0);
    let model = config.init::<TestBackend>(&Default::default());

    let metadata = ModelMetadata::new(
        encoder,
        Architecture::ConvSmall,
        16,
        Hyperparameters {
            epochs: 1,
            batch_size: 2,
            learning_rate: 0.01,
            split_fraction: 0.2,
            seed: 42,
            dropout: 0.0,
        },
        0,
        0,
        None,
    );
    save_model_with_metadata(path, &metadata, &model_to_bytes(model).unwrap()).unwrap();
    metadata
}
