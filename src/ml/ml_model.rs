//! 機械学習モデルの共通定義
//!
//! 固定バックボーン（3層CNNまたはResNet）と学習対象の分類ヘッド、
//! および学習・推論で共通の画像デコード処理を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
};
use image::imageops::FilterType;

use crate::error::DetectorError;
use crate::ml::resnet::ResNet;
use crate::model::config::Architecture;

/// ImageNetの平均と標準偏差
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// モデル設定
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// バックボーンの種類
    pub architecture: Architecture,
    /// 入力画像サイズ（正方形）
    #[config(default = 64)]
    pub image_size: usize,
    /// 分類ヘッドのドロップアウト率
    #[config(default = 0.1)]
    pub dropout: f64,
}

impl ClassifierConfig {
    /// バックボーンを初期化
    pub fn init_backbone<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        match (self.architecture.conv_channels(), self.architecture.resnet_blocks()) {
            (Some(channels), _) => Backbone::Conv(ConvBackbone::new(channels, device)),
            (None, Some(blocks)) => Backbone::ResNet(ResNet::new(blocks, device)),
            (None, None) => unreachable!("every architecture is either a conv stack or a resnet"),
        }
    }

    /// 分類ヘッドを初期化
    pub fn init_head<B: Backend>(&self, device: &B::Device) -> ClassifierHead<B> {
        ClassifierHead {
            dropout: DropoutConfig::new(self.dropout).init(),
            linear: LinearConfig::new(self.architecture.feature_dim(), self.num_classes)
                .init(device),
        }
    }

    /// バックボーンとヘッドをまとめて初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> HardHatClassifier<B> {
        HardHatClassifier {
            backbone: self.init_backbone(device),
            head: self.init_head(device),
        }
    }
}

/// 特徴抽出ネットワーク（学習中は重みを更新しない）
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    Conv(ConvBackbone<B>),
    ResNet(ResNet<B>),
}

impl<B: Backend> Backbone<B> {
    /// ボトルネック特徴を計算
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - 特徴ベクトル [batch_size, feature_dim]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            Backbone::Conv(conv) => conv.forward(images),
            Backbone::ResNet(resnet) => resnet.forward(images),
        }
    }
}

/// 小さな3層CNN
///
/// # アーキテクチャ
/// - {Conv 3x3 (padding 1) + ReLU + MaxPool 2x2} x 2層
/// - Conv 3x3 (padding 1) + ReLU
/// - Global Average Pooling → [batch, channels]
#[derive(Module, Debug)]
pub struct ConvBackbone<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,
    conv3: Conv2d<B>,
    gap: AdaptiveAvgPool2d,
    activation: Relu,
}

impl<B: Backend> ConvBackbone<B> {
    fn new([c1, c2, c3]: [usize; 3], device: &B::Device) -> Self {
        // 3x3 (padding 1) でサイズを保ち、プーリングで半分にする
        let conv = |input: usize, output: usize| {
            Conv2dConfig::new([input, output], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        let pool = || MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();

        Self {
            conv1: conv(3, c1),
            pool1: pool(),
            conv2: conv(c1, c2),
            pool2: pool(),
            conv3: conv(c2, c3),
            gap: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            activation: Relu::new(),
        }
    }

    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);

        let x = self.gap.forward(x);
        let [_, c, _, _] = x.dims();
        x.reshape([batch_size, c])
    }
}

/// 学習対象の分類ヘッド
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    dropout: Dropout,
    linear: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    /// 特徴 [batch_size, feature_dim] → ロジット [batch_size, num_classes]
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.dropout.forward(features);
        self.linear.forward(x)
    }

    /// ロジットとクロスエントロピー損失
    pub fn forward_loss(
        &self,
        features: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let output = self.forward(features);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets);
        (output, loss)
    }
}

/// 推論用の完全なモデル（バックボーン + 分類ヘッド）
#[derive(Module, Debug)]
pub struct HardHatClassifier<B: Backend> {
    backbone: Backbone<B>,
    head: ClassifierHead<B>,
}

impl<B: Backend> HardHatClassifier<B> {
    pub fn new(backbone: Backbone<B>, head: ClassifierHead<B>) -> Self {
        Self { backbone, head }
    }

    /// 順伝播 [batch_size, 3, size, size] → ロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }
}

/// 画像バイト列をデコードして正規化
///
/// 学習・推論の両方でこの関数を使います。`expected_size` の正方形にリサイズし、
/// ImageNetの平均と標準偏差で正規化します。
///
/// # 戻り値
/// - 正規化されたRGB画像データ (C, H, W) の順で平坦化
pub fn decode_and_normalize_image(
    bytes: &[u8],
    expected_size: usize,
) -> Result<Vec<f32>, DetectorError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| DetectorError::Prediction(format!("failed to decode image: {e}")))?;
    let size = expected_size as u32;
    let img = img.resize_exact(size, size, FilterType::Triangle).to_rgb8();

    let mut data = Vec::with_capacity(3 * expected_size * expected_size);
    for channel in 0..3 {
        for y in 0..size {
            for x in 0..size {
                let pixel = img.get_pixel(x, y);
                let value = pixel[channel] as f32 / 255.0;
                data.push((value - MEAN[channel]) / STD[channel]);
            }
        }
    }

    Ok(data)
}

/// 正規化済み画像を [batch, 3, size, size] のテンソルにまとめる
pub fn images_to_tensor<B: Backend>(
    pixels: &[f32],
    batch_size: usize,
    image_size: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    Tensor::<B, 1>::from_floats(pixels, device).reshape([batch_size, 3, image_size, image_size])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{png_bytes, TestBackend};

    #[test]
    fn test_decode_resizes_and_normalizes() {
        let bytes = png_bytes([255, 0, 0], 10, 7);
        let data = decode_and_normalize_image(&bytes, 16).unwrap();
        assert_eq!(data.len(), 3 * 16 * 16);

        let red = (1.0 - MEAN[0]) / STD[0];
        let green = (0.0 - MEAN[1]) / STD[1];
        assert!((data[0] - red).abs() < 1e-4);
        assert!((data[16 * 16] - green).abs() < 1e-4);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_and_normalize_image(b"GIF89a nope", 16).unwrap_err();
        assert!(matches!(err, DetectorError::Prediction(_)));
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let config = ClassifierConfig::new(3, Architecture::ConvSmall).with_image_size(16);
        let model = config.init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);
        let features = model.backbone.forward(images.clone());
        assert_eq!(features.dims(), [2, 128]);

        let proba = model.predict_proba(images);
        assert_eq!(proba.dims(), [2, 3]);
        let sums = proba.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_resnet_classifier_forward_shapes() {
        let device = Default::default();
        let config = ClassifierConfig::new(2, Architecture::ResNet18).with_image_size(32);
        let model = config.init::<TestBackend>(&device);
        assert!(matches!(model.backbone, Backbone::ResNet(_)));

        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        assert_eq!(model.backbone.forward(images.clone()).dims(), [1, 512]);

        let proba = model.predict_proba(images);
        assert_eq!(proba.dims(), [1, 2]);
        let sums = proba.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }
}
