//! ResNet-18 / ResNet-34 バックボーン
//!
//! パラメータ名はtorchvisionの `resnet18` / `resnet34` に合わせてあり、
//! ImageNetで学習済みの重み（`.pth` / `.safetensors`）をそのまま読み込めます。
//! 最終の全結合層 `fc` は持たず、Global Average Pooling の出力（512次元）を特徴とします。

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// 最終ブロックの出力チャネル数
pub const RESNET_FEATURE_DIM: usize = 512;

const STAGE_CHANNELS: [usize; 4] = [64, 128, 256, 512];

fn conv3x3<B: Backend>(input: usize, output: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([input, output], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

/// ショートカット側の 1x1 Conv + BN
///
/// torchvisionでは `downsample.0` / `downsample.1`。
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> Downsample<B> {
    fn new(input: usize, output: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([input, output], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(output).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    relu: Relu,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> BasicBlock<B> {
    fn new(input: usize, output: usize, stride: usize, device: &B::Device) -> Self {
        let downsample =
            (stride != 1 || input != output).then(|| Downsample::new(input, output, stride, device));

        Self {
            conv1: conv3x3(input, output, stride, device),
            bn1: BatchNormConfig::new(output).init(device),
            relu: Relu::new(),
            conv2: conv3x3(output, output, 1, device),
            bn2: BatchNormConfig::new(output).init(device),
            downsample,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = self.relu.forward(self.bn1.forward(self.conv1.forward(x)));
        let out = self.bn2.forward(self.conv2.forward(out));
        self.relu.forward(out + identity)
    }
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    relu: Relu,
    maxpool: MaxPool2d,
    layer1: Vec<BasicBlock<B>>,
    layer2: Vec<BasicBlock<B>>,
    layer3: Vec<BasicBlock<B>>,
    layer4: Vec<BasicBlock<B>>,
    avgpool: AdaptiveAvgPool2d,
}

impl<B: Backend> ResNet<B> {
    /// `blocks` はステージごとのブロック数（ResNet-18: [2, 2, 2, 2]、ResNet-34: [3, 4, 6, 3]）
    pub fn new(blocks: [usize; 4], device: &B::Device) -> Self {
        let mut input = STAGE_CHANNELS[0];
        let mut stages = Vec::with_capacity(4);
        for (stage, (&count, &output)) in blocks.iter().zip(&STAGE_CHANNELS).enumerate() {
            let stride = if stage == 0 { 1 } else { 2 };
            let layer: Vec<_> = (0..count)
                .map(|i| {
                    let block_input = if i == 0 { input } else { output };
                    let block_stride = if i == 0 { stride } else { 1 };
                    BasicBlock::new(block_input, output, block_stride, device)
                })
                .collect();
            stages.push(layer);
            input = output;
        }
        let [layer1, layer2, layer3, layer4]: [Vec<BasicBlock<B>>; 4] = match stages.try_into() {
            Ok(stages) => stages,
            Err(_) => unreachable!("exactly four stages are built"),
        };

        Self {
            conv1: Conv2dConfig::new([3, STAGE_CHANNELS[0]], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(STAGE_CHANNELS[0]).init(device),
            relu: Relu::new(),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1,
            layer2,
            layer3,
            layer4,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }

    /// [batch_size, 3, H, W] → [batch_size, 512]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.relu.forward(self.bn1.forward(x));
        let mut x = self.maxpool.forward(x);

        for block in self
            .layer1
            .iter()
            .chain(&self.layer2)
            .chain(&self.layer3)
            .chain(&self.layer4)
        {
            x = block.forward(x);
        }

        self.avgpool.forward(x).reshape([batch_size, RESNET_FEATURE_DIM])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBackend;

    #[test]
    fn test_resnet18_feature_shape() {
        let device = Default::default();
        let resnet = ResNet::<TestBackend>::new([2, 2, 2, 2], &device);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        assert_eq!(resnet.forward(images).dims(), [2, RESNET_FEATURE_DIM]);
    }

    #[test]
    fn test_downsample_only_where_shape_changes() {
        let device = Default::default();
        let resnet = ResNet::<TestBackend>::new([3, 4, 6, 3], &device);

        assert_eq!(resnet.layer3.len(), 6);
        assert!(resnet.layer1.iter().all(|block| block.downsample.is_none()));
        for layer in [&resnet.layer2, &resnet.layer3, &resnet.layer4] {
            assert!(layer[0].downsample.is_some());
            assert!(layer[1..].iter().all(|block| block.downsample.is_none()));
        }
    }
}
