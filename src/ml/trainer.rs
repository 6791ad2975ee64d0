//! 転移学習トレーナー
//!
//! バックボーンの重みは固定し、分類ヘッドだけを学習します。
//! バックボーンの出力（ボトルネック特徴）は最初に1回だけ計算してメモリ上にキャッシュし、
//! 全エポックで使い回します。

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoaderBuilder},
        dataset::InMemDataset,
    },
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor, TensorData,
    },
};
use burn_import::{
    pytorch::PyTorchFileRecorder,
    safetensors::{AdapterType, SafetensorsFileRecorder},
};
use serde::{Deserialize, Serialize};

use crate::dataset::EncodedSample;
use crate::metrics::argmax;
use crate::ml::ml_model::{
    decode_and_normalize_image, images_to_tensor, Backbone, ClassifierConfig, ClassifierHead,
    HardHatClassifier,
};
use crate::ml::resnet::ResNet;
use crate::model::model_metadata::Hyperparameters;

/// 1エポック分の学習結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    /// 検証データが空の場合はNone
    pub valid_loss: Option<f64>,
    pub valid_accuracy: Option<f64>,
}

/// 学習済みモデル
#[derive(Debug)]
pub struct FittedModel<B: Backend> {
    pub model: HardHatClassifier<B>,
    pub config: ClassifierConfig,
    pub history: Vec<EpochStats>,
}

/// 学習処理の境界
///
/// パイプラインはこのトレイトを通してのみ数値計算側を呼び出します。
pub trait Trainer {
    /// 学習済みモデルのバックエンド
    type Backend: Backend;

    fn device(&self) -> <Self::Backend as Backend>::Device;

    fn fit(
        &self,
        train: &[EncodedSample],
        valid: &[EncodedSample],
        params: &Hyperparameters,
        config: &ClassifierConfig,
    ) -> Result<FittedModel<Self::Backend>>;
}

type EpochCallback = Box<dyn Fn(&EpochStats) + Send + Sync>;

/// 固定バックボーン + 分類ヘッドの転移学習
pub struct TransferTrainer<B: AutodiffBackend> {
    device: B::Device,
    backbone_weights: Option<PathBuf>,
    on_epoch: Option<EpochCallback>,
}

impl<B: AutodiffBackend> TransferTrainer<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            backbone_weights: None,
            on_epoch: None,
        }
    }

    /// 事前学習済みバックボーンの重みファイル
    ///
    /// ResNetには torchvision の `.pth` / `.pt` / `.safetensors` をそのまま渡せます。
    /// `.mpk` はburnで保存したバックボーン全体として読み込みます。
    pub fn with_backbone_weights(mut self, path: Option<PathBuf>) -> Self {
        self.backbone_weights = path;
        self
    }

    /// エポック終了ごとに呼ばれるコールバック
    pub fn on_epoch(mut self, callback: impl Fn(&EpochStats) + Send + Sync + 'static) -> Self {
        self.on_epoch = Some(Box::new(callback));
        self
    }

    fn load_backbone(&self, config: &ClassifierConfig) -> Result<Backbone<B::InnerBackend>> {
        let backbone = config.init_backbone::<B::InnerBackend>(&self.device);
        let Some(path) = &self.backbone_weights else {
            tracing::warn!("no pretrained backbone weights configured, using default initialization");
            return Ok(backbone);
        };

        let format = WeightsFormat::from_path(path)?;
        tracing::info!(?format, "loading backbone weights from {}", path.display());

        match (format, backbone) {
            (WeightsFormat::BurnMpk, backbone) => backbone
                .load_file(
                    path.clone(),
                    &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
                    &self.device,
                )
                .map_err(|e| anyhow!("failed to load backbone weights {:?}: {:?}", path, e)),
            (WeightsFormat::PyTorch, Backbone::ResNet(resnet)) => {
                let mut args = burn_import::pytorch::LoadArgs::new(path.clone());
                for (pattern, replacement) in TORCHVISION_KEY_REMAP {
                    args = args.with_key_remap(pattern, replacement);
                }
                let record = <PyTorchFileRecorder<FullPrecisionSettings> as Recorder<
                    B::InnerBackend,
                >>::load::<ResNetRecord<B::InnerBackend>>(
                    &PyTorchFileRecorder::default(), args, &self.device
                )
                .map_err(|e| anyhow!("failed to load backbone weights {:?}: {:?}", path, e))?;
                Ok(Backbone::ResNet(resnet.load_record(record)))
            }
            (WeightsFormat::Safetensors, Backbone::ResNet(resnet)) => {
                let mut args = burn_import::safetensors::LoadArgs::new(path.clone())
                    .with_adapter_type(AdapterType::PyTorch);
                for (pattern, replacement) in TORCHVISION_KEY_REMAP {
                    args = args.with_key_remap(pattern, replacement);
                }
                let record = <SafetensorsFileRecorder<FullPrecisionSettings> as Recorder<
                    B::InnerBackend,
                >>::load::<ResNetRecord<B::InnerBackend>>(
                    &SafetensorsFileRecorder::default(), args, &self.device
                )
                .map_err(|e| anyhow!("failed to load backbone weights {:?}: {:?}", path, e))?;
                Ok(Backbone::ResNet(resnet.load_record(record)))
            }
            (format, Backbone::Conv(_)) => Err(anyhow!(
                "{:?} weights {} need a resnet architecture, got {}",
                format,
                path.display(),
                config.architecture
            )),
        }
    }
}

type ResNetRecord<B> = <ResNet<B> as Module<B>>::Record;

/// torchvisionのショートカット `downsample.0` / `downsample.1` をフィールド名に合わせる
const TORCHVISION_KEY_REMAP: [(&str, &str); 2] = [
    (r"downsample\.0\.", "downsample.conv."),
    (r"downsample\.1\.", "downsample.bn."),
];

/// バックボーン重みファイルの形式（拡張子で判定）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsFormat {
    /// torchvisionの `state_dict` (.pth / .pt)
    PyTorch,
    /// .safetensors
    Safetensors,
    /// burnの NamedMpkFileRecorder で保存したバックボーン全体
    BurnMpk,
}

impl WeightsFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension.as_deref() {
            Some("pth") | Some("pt") => Ok(WeightsFormat::PyTorch),
            Some("safetensors") => Ok(WeightsFormat::Safetensors),
            Some("mpk") => Ok(WeightsFormat::BurnMpk),
            _ => Err(anyhow!(
                "unsupported backbone weights file {} (expected .pth, .pt, .safetensors or .mpk)",
                path.display()
            )),
        }
    }
}

impl<B: AutodiffBackend> Trainer for TransferTrainer<B> {
    type Backend = B::InnerBackend;

    fn device(&self) -> B::Device {
        self.device.clone()
    }

    fn fit(
        &self,
        train: &[EncodedSample],
        valid: &[EncodedSample],
        params: &Hyperparameters,
        config: &ClassifierConfig,
    ) -> Result<FittedModel<B::InnerBackend>> {
        anyhow::ensure!(!train.is_empty(), "training partition is empty");

        let backbone = self.load_backbone(config)?;

        // ボトルネック特徴は1回だけ計算する
        let image_size = config.image_size;
        let train_cache =
            BottleneckCache::build(&backbone, train, image_size, params.batch_size, &self.device)?;
        let valid_cache =
            BottleneckCache::build(&backbone, valid, image_size, params.batch_size, &self.device)?;
        tracing::info!(
            train = train_cache.len(),
            valid = valid_cache.len(),
            feature_dim = config.architecture.feature_dim(),
            "bottleneck features cached"
        );

        let num_train = train_cache.len();
        let num_valid = valid_cache.len();

        let dataloader_train =
            DataLoaderBuilder::new(FeatureBatcher::<B>::new(self.device.clone()))
                .batch_size(params.batch_size)
                .shuffle(params.seed)
                .num_workers(0)
                .build(train_cache.into_dataset());

        let dataloader_valid =
            DataLoaderBuilder::new(FeatureBatcher::<B::InnerBackend>::new(self.device.clone()))
                .batch_size(params.batch_size)
                .num_workers(0)
                .build(valid_cache.into_dataset());

        let mut head = config.init_head::<B>(&self.device);
        let mut optim = AdamConfig::new().init::<B, ClassifierHead<B>>();
        let mut history = Vec::with_capacity(params.epochs);

        for epoch in 1..=params.epochs {
            let mut train_loss = 0.0;
            let mut train_correct = 0;

            for batch in dataloader_train.iter() {
                let batch_len = batch.labels.len();
                let (output, loss) = head.forward_loss(batch.features, batch.targets);
                train_loss += loss.clone().into_scalar().elem::<f64>() * batch_len as f64;
                train_correct += count_correct(output, &batch.labels)?;

                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &head);
                head = optim.step(params.learning_rate, head, grads);
            }

            let (valid_loss, valid_accuracy) = if num_valid == 0 {
                (None, None)
            } else {
                let valid_head = head.valid();
                let mut valid_loss = 0.0;
                let mut valid_correct = 0;
                for batch in dataloader_valid.iter() {
                    let batch_len = batch.labels.len();
                    let (output, loss) = valid_head.forward_loss(batch.features, batch.targets);
                    valid_loss += loss.into_scalar().elem::<f64>() * batch_len as f64;
                    valid_correct += count_correct(output, &batch.labels)?;
                }
                (
                    Some(valid_loss / num_valid as f64),
                    Some(valid_correct as f64 / num_valid as f64),
                )
            };

            let stats = EpochStats {
                epoch,
                train_loss: train_loss / num_train as f64,
                train_accuracy: train_correct as f64 / num_train as f64,
                valid_loss,
                valid_accuracy,
            };
            tracing::info!(
                epoch,
                train_loss = stats.train_loss,
                train_accuracy = stats.train_accuracy,
                valid_loss = ?stats.valid_loss,
                valid_accuracy = ?stats.valid_accuracy,
                "epoch finished"
            );
            if let Some(callback) = &self.on_epoch {
                callback(&stats);
            }
            history.push(stats);
        }

        Ok(FittedModel {
            model: HardHatClassifier::new(backbone, head.valid()),
            config: config.clone(),
            history,
        })
    }
}

fn count_correct<B: Backend>(output: Tensor<B, 2>, labels: &[u32]) -> Result<usize> {
    let [_, num_classes] = output.dims();
    let logits = output
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("failed to read model output: {:?}", e))?;

    Ok(logits
        .chunks(num_classes)
        .zip(labels)
        .filter(|(row, label)| argmax(row) == **label as usize)
        .count())
}

/// キャッシュされた特徴1件
#[derive(Clone, Debug)]
pub struct FeatureItem {
    pub features: Vec<f32>,
    pub label: u32,
}

/// ボトルネック特徴のキャッシュ
pub struct BottleneckCache {
    items: Vec<FeatureItem>,
}

impl BottleneckCache {
    /// 全サンプルをデコードしてバックボーンに通す
    pub fn build<B: Backend>(
        backbone: &Backbone<B>,
        samples: &[EncodedSample],
        image_size: usize,
        batch_size: usize,
        device: &B::Device,
    ) -> Result<Self> {
        let mut items = Vec::with_capacity(samples.len());

        for chunk in samples.chunks(batch_size.max(1)) {
            let mut pixels = Vec::with_capacity(chunk.len() * 3 * image_size * image_size);
            for sample in chunk {
                let data = decode_and_normalize_image(&sample.image, image_size)
                    .with_context(|| format!("failed to decode {}", sample.sample.path.display()))?;
                pixels.extend_from_slice(&data);
            }

            let images = images_to_tensor::<B>(&pixels, chunk.len(), image_size, device);
            let features = backbone.forward(images);
            let [_, dim] = features.dims();
            let values = features
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| anyhow!("failed to read bottleneck features: {:?}", e))?;

            for (row, sample) in values.chunks(dim).zip(chunk) {
                items.push(FeatureItem {
                    features: row.to_vec(),
                    label: sample.key,
                });
            }
        }

        Ok(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_dataset(self) -> InMemDataset<FeatureItem> {
        InMemDataset::new(self.items)
    }
}

/// 特徴バッチャー
#[derive(Clone)]
pub struct FeatureBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> FeatureBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct FeatureBatch<B: Backend> {
    pub features: Tensor<B, 2>,
    pub targets: Tensor<B, 1, Int>,
    pub labels: Vec<u32>,
}

impl<B: Backend> Batcher<B, FeatureItem, FeatureBatch<B>> for FeatureBatcher<B> {
    fn batch(&self, items: Vec<FeatureItem>, _device: &B::Device) -> FeatureBatch<B> {
        let batch_size = items.len();
        let dim = items.first().map(|item| item.features.len()).unwrap_or(0);

        let mut values = Vec::with_capacity(batch_size * dim);
        let mut labels = Vec::with_capacity(batch_size);
        for item in items {
            values.extend_from_slice(&item.features);
            labels.push(item.label);
        }

        let features =
            Tensor::<B, 2>::from_data(TensorData::new(values, [batch_size, dim]), &self.device);
        let targets_vec: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        FeatureBatch {
            features,
            targets,
            labels,
        }
    }
}
