//! モデル学習パイプライン
//!
//! フォルダ構成の読み込み → シャッフル → ラベルのキー化 → 画像読み込み →
//! 学習/検証分割 → 転移学習 → 評価 → モデルファイル保存 を順に行います。

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::dataset::{self, EncodedSample, Sample};
use crate::error::DetectorError;
use crate::metrics::{EvaluationMetrics, MetricsError};
use crate::ml::inference::{model_to_bytes, InferenceEngine};
use crate::ml::ml_model::ClassifierConfig;
use crate::ml::trainer::{EpochStats, Trainer, TransferTrainer};
use crate::model::config::{AppConfig, DeviceType, TrainingSettings};
use crate::model::{save_model_with_metadata, Hyperparameters, LabelEncoder, ModelMetadata};

/// 学習結果のまとめ
#[derive(Debug)]
pub struct TrainingReport {
    /// クラスごとの枚数（ラベル名順）
    pub class_counts: BTreeMap<String, usize>,
    /// キー順のラベル
    pub labels: Vec<String>,
    pub num_train: usize,
    pub num_valid: usize,
    pub history: Vec<EpochStats>,
    /// 評価に失敗した場合もモデルは保存される
    pub metrics: Result<EvaluationMetrics, MetricsError>,
    pub artifact_path: PathBuf,
    pub artifact_size: u64,
}

/// シードに従ってサンプルを並び替える
pub fn shuffle_samples(samples: &mut [Sample], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    samples.shuffle(&mut rng);
}

/// ラベルキーを付与し、画像ファイルを読み込む
///
/// 1枚でも読めなければそのパスを含むエラーで中断します。
pub fn encode_samples(
    samples: &[Sample],
    encoder: &LabelEncoder,
) -> Result<Vec<EncodedSample>, DetectorError> {
    samples
        .iter()
        .map(|sample| {
            let key = encoder.encode(&sample.label).ok_or_else(|| {
                DetectorError::configuration(format!(
                    "label '{}' is missing from the label encoder",
                    sample.label
                ))
            })?;
            let image =
                std::fs::read(&sample.path).map_err(|e| DetectorError::io(&sample.path, e))?;
            Ok(EncodedSample {
                sample: sample.clone(),
                key,
                image,
            })
        })
        .collect()
}

/// 検証データの件数（学習データが空にならないよう調整）
pub fn validation_len(total: usize, split_fraction: f64) -> usize {
    let valid = (total as f64 * split_fraction).round() as usize;
    valid.min(total.saturating_sub(1))
}

/// 学習用と検証用に分割（前半が学習、後半が検証）
pub fn split_samples<T>(mut items: Vec<T>, split_fraction: f64) -> (Vec<T>, Vec<T>) {
    let valid_len = validation_len(items.len(), split_fraction);
    let valid = items.split_off(items.len() - valid_len);
    (items, valid)
}

/// 検証データに対する評価
pub fn evaluate<B: Backend>(
    engine: &InferenceEngine<B>,
    valid: &[EncodedSample],
    batch_size: usize,
) -> Result<Result<EvaluationMetrics, MetricsError>> {
    let mut actual = Vec::with_capacity(valid.len());
    let mut scores = Vec::with_capacity(valid.len());

    for chunk in valid.chunks(batch_size.max(1)) {
        let images: Vec<&[u8]> = chunk.iter().map(|s| s.image.as_slice()).collect();
        let predictions = engine
            .predict_batch(&images)
            .context("failed to run the model over the validation partition")?;
        for (sample, prediction) in chunk.iter().zip(predictions) {
            actual.push(sample.key);
            scores.push(prediction.scores);
        }
    }

    Ok(EvaluationMetrics::compute(
        &actual,
        &scores,
        engine.metadata().num_classes(),
    ))
}

/// 学習パイプライン本体
pub fn run_training<T: Trainer>(settings: &TrainingSettings, trainer: &T) -> Result<TrainingReport> {
    // 1. フォルダ構成から読み込み
    let scanned = dataset::load_samples(&settings.data_dir)?;
    let class_counts = scanned.class_counts();
    let mut samples = scanned.samples;
    for (label, count) in &class_counts {
        tracing::info!("  {}: {} images", label, count);
    }

    // 2. 並び順の偏りをなくす
    shuffle_samples(&mut samples, settings.seed);

    // 3. 分割前に全体でラベルをキー化
    let encoder = LabelEncoder::fit(&samples);
    tracing::info!("label keys: {}", encoder.labels().join(", "));

    // 4. 画像読み込み
    let encoded = encode_samples(&samples, &encoder)?;

    // 5. 学習/検証データに分割
    let (train, valid) = split_samples(encoded, settings.split_fraction);
    tracing::info!("train set: {} images, validation set: {} images", train.len(), valid.len());

    let params = Hyperparameters {
        epochs: settings.epochs,
        batch_size: settings.batch_size,
        learning_rate: settings.learning_rate,
        split_fraction: settings.split_fraction,
        seed: settings.seed,
        dropout: settings.dropout,
    };
    let config = ClassifierConfig::new(encoder.num_classes(), settings.architecture)
        .with_image_size(settings.image_size)
        .with_dropout(settings.dropout);

    // 6. 学習
    let fitted = trainer.fit(&train, &valid, &params, &config)?;
    let model_binary = model_to_bytes(fitted.model)?;

    let metadata = ModelMetadata::new(
        encoder.clone(),
        settings.architecture,
        settings.image_size,
        params,
        train.len(),
        valid.len(),
        None,
    );

    // 7. 評価（失敗しても保存は続ける）
    let engine = InferenceEngine::<T::Backend>::from_parts(
        metadata.clone(),
        model_binary.clone(),
        &trainer.device(),
    )?;
    let metrics = evaluate(&engine, &valid, settings.batch_size)?;
    if let Err(e) = &metrics {
        tracing::warn!("evaluation metrics unavailable: {}", e);
    }

    // 8. 保存
    let metadata = ModelMetadata {
        metrics: metrics.as_ref().ok().cloned(),
        ..metadata
    };
    save_model_with_metadata(&settings.model_output_path, &metadata, &model_binary)?;
    let artifact_size = std::fs::metadata(&settings.model_output_path)
        .context("saved model file is missing")?
        .len();
    tracing::info!(
        "model saved to {} ({} bytes)",
        settings.model_output_path.display(),
        artifact_size
    );

    Ok(TrainingReport {
        class_counts,
        labels: encoder.labels().to_vec(),
        num_train: train.len(),
        num_valid: valid.len(),
        history: fitted.history,
        metrics,
        artifact_path: settings.model_output_path.clone(),
        artifact_size,
    })
}

/// 設定に従ってバックエンドを選び学習を実行
pub fn train_model(
    config: &AppConfig,
    on_epoch: impl Fn(&EpochStats) + Send + Sync + 'static,
) -> Result<TrainingReport> {
    config.validate()?;
    let settings = &config.training;

    match config.device_type {
        DeviceType::Wgpu => {
            type Backend = burn_autodiff::Autodiff<burn_wgpu::Wgpu>;
            let trainer = TransferTrainer::<Backend>::new(burn_wgpu::WgpuDevice::default())
                .with_backbone_weights(settings.backbone_weights.clone())
                .on_epoch(on_epoch);
            run_training(settings, &trainer)
        }
        DeviceType::Cpu => {
            type Backend = burn_autodiff::Autodiff<burn_ndarray::NdArray<f32>>;
            let trainer = TransferTrainer::<Backend>::new(burn_ndarray::NdArrayDevice::Cpu)
                .with_backbone_weights(settings.backbone_weights.clone())
                .on_epoch(on_epoch);
            run_training(settings, &trainer)
        }
    }
}
