//! モデル推論機能

use std::path::Path;

use anyhow::anyhow;
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};

use crate::error::DetectorError;
use crate::metrics::argmax;
use crate::ml::ml_model::{
    decode_and_normalize_image, images_to_tensor, ClassifierConfig, HardHatClassifier,
};
use crate::model::{load_model_with_metadata, ModelMetadata};
use crate::prediction::Prediction;

/// モデルの重みをバイト列に変換
pub fn model_to_bytes<B: Backend>(model: HardHatClassifier<B>) -> anyhow::Result<Vec<u8>> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.into_record(), ())
        .map_err(|e| anyhow!("failed to serialize model weights: {:?}", e))
}

/// 推論エンジン
///
/// 1インスタンスを同時に複数スレッドから使わないこと（プール側で排他します）。
pub struct InferenceEngine<B: Backend> {
    model: HardHatClassifier<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// メタデータと重みからエンジンを組み立てる
    pub fn from_parts(
        metadata: ModelMetadata,
        model_binary: Vec<u8>,
        device: &B::Device,
    ) -> Result<Self, DetectorError> {
        let config = ClassifierConfig::new(metadata.num_classes(), metadata.architecture)
            .with_image_size(metadata.image_size)
            .with_dropout(0.0);
        let model = config.init::<B>(device);

        // モデルの重みを復元
        let record = BinBytesRecorder::<FullPrecisionSettings>::default()
            .load(model_binary, device)
            .map_err(|e| DetectorError::Prediction(format!("failed to load model weights: {:?}", e)))?;

        Ok(Self {
            model: model.load_record(record),
            metadata,
            device: device.clone(),
        })
    }

    /// モデルファイルを読み込んで推論エンジンを初期化
    pub fn load(model_path: &Path, device: &B::Device) -> Result<Self, DetectorError> {
        let (metadata, binary) = load_model_with_metadata(model_path)?;
        Self::from_parts(metadata, binary, device).map_err(|e| match e {
            DetectorError::Prediction(message) => DetectorError::artifact(model_path, message),
            other => other,
        })
    }

    /// 画像バイト列を分類
    pub fn predict(&self, image: &[u8]) -> Result<Prediction, DetectorError> {
        let mut predictions = self.predict_batch(&[image])?;
        predictions
            .pop()
            .ok_or_else(|| DetectorError::Prediction("model returned no output".to_string()))
    }

    /// 複数画像をまとめて分類（入力と同じ順序で返す）
    pub fn predict_batch(&self, images: &[&[u8]]) -> Result<Vec<Prediction>, DetectorError> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let size = self.metadata.image_size;
        let mut pixels = Vec::with_capacity(images.len() * 3 * size * size);
        for image in images {
            pixels.extend(decode_and_normalize_image(image, size)?);
        }

        let tensor = images_to_tensor::<B>(&pixels, images.len(), size, &self.device);
        let proba = self
            .model
            .predict_proba(tensor)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| DetectorError::Prediction(format!("failed to read scores: {:?}", e)))?;

        let labels = self.metadata.labels.labels();
        Ok(proba
            .chunks(labels.len())
            .map(|scores| Prediction {
                predicted_label: labels[argmax(scores)].clone(),
                scores: scores.to_vec(),
                labels: labels.to_vec(),
            })
            .collect())
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::model_metadata::sample_metadata;
    use crate::model::Architecture;
    use crate::testing::{png_bytes, write_test_artifact, TestBackend};

    #[test]
    fn test_scores_follow_artifact_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        // 辞書順ではない順序で保存しても、そのまま使われること
        write_test_artifact(&path, &["no_hard_hat", "hard_hat"]);

        let engine = InferenceEngine::<TestBackend>::load(&path, &Default::default()).unwrap();
        let prediction = engine.predict(&png_bytes([200, 180, 20], 20, 20)).unwrap();

        assert_eq!(prediction.labels, vec!["no_hard_hat", "hard_hat"]);
        assert_eq!(prediction.scores.len(), 2);
        let sum: f32 = prediction.scores.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        assert_eq!(
            prediction.predicted_label,
            prediction.labels[argmax(&prediction.scores)]
        );
    }

    #[test]
    fn test_resnet_architecture_restored_from_metadata() {
        let device = Default::default();
        let mut metadata = sample_metadata(&["hard_hat", "no_hard_hat"]);
        metadata.architecture = Architecture::ResNet18;
        metadata.image_size = 32;
        let model = ClassifierConfig::new(2, Architecture::ResNet18)
            .with_image_size(32)
            .init::<TestBackend>(&device);

        let engine =
            InferenceEngine::<TestBackend>::from_parts(metadata, model_to_bytes(model).unwrap(), &device)
                .unwrap();
        let prediction = engine.predict(&png_bytes([200, 180, 20], 40, 40)).unwrap();
        assert_eq!(prediction.scores.len(), 2);
    }

    #[test]
    fn test_batch_matches_single_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        write_test_artifact(&path, &["hard_hat", "no_hard_hat", "vest"]);
        let engine = InferenceEngine::<TestBackend>::load(&path, &Default::default()).unwrap();

        let a = png_bytes([10, 200, 30], 16, 16);
        let b = png_bytes([240, 20, 90], 32, 8);
        let batch = engine.predict_batch(&[&a, &b]).unwrap();
        let single_b = engine.predict(&b).unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].predicted_label, single_b.predicted_label);
        for (x, y) in batch[1].scores.iter().zip(&single_b.scores) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_malformed_upload_is_prediction_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        write_test_artifact(&path, &["hard_hat", "no_hard_hat"]);
        let engine = InferenceEngine::<TestBackend>::load(&path, &Default::default()).unwrap();

        let err = engine.predict(b"\xff\xd8\xff garbage").unwrap_err();
        assert!(matches!(err, DetectorError::Prediction(_)));
    }

    #[test]
    fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let result = InferenceEngine::<TestBackend>::load(
            &dir.path().join("none.tar.gz"),
            &Default::default(),
        );
        assert!(matches!(result, Err(DetectorError::ArtifactNotFound(_))));
    }
}
