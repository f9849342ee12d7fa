//! Wide Residual Network (Zagoruyko & Komodakis) with optional batch norm and Fixup.

use burn::{
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Initializer, Linear, LinearConfig,
        PaddingConfig2d,
    },
    tensor::{activation::relu, backend::Backend, Tensor},
};
use serde::Serialize;

const STEM_CHANNELS: usize = 16;
const GROUP_STRIDES: [usize; 3] = [1, 2, 2];

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WideResNetConfig {
    pub depth: usize,
    pub num_classes: usize,
    pub widen_factor: usize,
    pub droprate: f64,
    pub use_bn: bool,
    pub use_fixup: bool,
}

impl WideResNetConfig {
    /// Residual blocks in each of the three groups.
    pub fn blocks_per_group(&self) -> usize {
        self.depth.saturating_sub(4) / 6
    }

    pub fn is_valid_depth(depth: usize) -> bool {
        depth >= 10 && (depth - 4) % 6 == 0
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> WideResNet<B> {
        let n = self.blocks_per_group();
        let total_blocks = (3 * n).max(1);
        let widths = [
            STEM_CHANNELS * self.widen_factor,
            32 * self.widen_factor,
            64 * self.widen_factor,
        ];

        let stem = conv3x3(3, STEM_CHANNELS, 1, kaiming(), device);

        let mut blocks = Vec::with_capacity(3 * n);
        let mut channels = STEM_CHANNELS;
        for (width, stride) in widths.into_iter().zip(GROUP_STRIDES) {
            for i in 0..n {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(self.block(channels, width, stride, total_blocks, device));
                channels = width;
            }
        }

        let norm = self
            .use_bn
            .then(|| BatchNormConfig::new(channels).init(device));
        let head = if self.use_fixup {
            LinearConfig::new(channels, self.num_classes).with_initializer(Initializer::Zeros)
        } else {
            LinearConfig::new(channels, self.num_classes)
        };
        let mut head = head.init(device);
        // The classifier bias starts at zero whatever the weight init.
        head.bias = Some(Param::from_tensor(Tensor::zeros([self.num_classes], device)));

        WideResNet {
            stem,
            blocks,
            norm,
            head,
        }
    }

    fn block<B: Backend>(
        &self,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        total_blocks: usize,
        device: &B::Device,
    ) -> BasicBlock<B> {
        let (first_init, second_init) = if self.use_fixup {
            let fan_out = (out_channels * 9) as f64;
            let std = (2.0 / fan_out).sqrt() * (total_blocks as f64).powf(-0.5);
            (
                Initializer::Normal { mean: 0.0, std },
                Initializer::Zeros,
            )
        } else {
            (kaiming(), kaiming())
        };

        let shortcut = (in_channels != out_channels).then(|| {
            Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .with_initializer(kaiming())
                .init(device)
        });

        BasicBlock {
            norm1: self
                .use_bn
                .then(|| BatchNormConfig::new(in_channels).init(device)),
            conv1: conv3x3(in_channels, out_channels, stride, first_init, device),
            norm2: self
                .use_bn
                .then(|| BatchNormConfig::new(out_channels).init(device)),
            dropout: DropoutConfig::new(self.droprate).init(),
            conv2: conv3x3(out_channels, out_channels, 1, second_init, device),
            shortcut,
            fixup: self.use_fixup.then(|| FixupScalars::new(device)),
        }
    }
}

fn kaiming() -> Initializer {
    Initializer::KaimingNormal {
        gain: 2f64.sqrt(),
        fan_out_only: true,
    }
}

fn conv3x3<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    initializer: Initializer,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .with_initializer(initializer)
        .init(device)
}

/// Learnable scalar offsets and output scale used in place of normalization.
#[derive(Module, Debug)]
pub struct FixupScalars<B: Backend> {
    bias1a: Param<Tensor<B, 1>>,
    bias1b: Param<Tensor<B, 1>>,
    bias2a: Param<Tensor<B, 1>>,
    bias2b: Param<Tensor<B, 1>>,
    scale: Param<Tensor<B, 1>>,
}

impl<B: Backend> FixupScalars<B> {
    fn new(device: &B::Device) -> Self {
        let zero = || Param::from_tensor(Tensor::zeros([1], device));
        Self {
            bias1a: zero(),
            bias1b: zero(),
            bias2a: zero(),
            bias2b: zero(),
            scale: Param::from_tensor(Tensor::ones([1], device)),
        }
    }
}

fn broadcast<B: Backend>(scalar: &Param<Tensor<B, 1>>) -> Tensor<B, 4> {
    scalar.val().reshape([1, 1, 1, 1])
}

/// Pre-activation residual block: `[BN] ReLU conv [BN] ReLU dropout conv`.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    norm1: Option<BatchNorm<B, 2>>,
    conv1: Conv2d<B>,
    norm2: Option<BatchNorm<B, 2>>,
    dropout: Dropout,
    conv2: Conv2d<B>,
    shortcut: Option<Conv2d<B>>,
    fixup: Option<FixupScalars<B>>,
}

impl<B: Backend> BasicBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let fixup = self.fixup.as_ref();

        let mut out = match fixup {
            Some(f) => input.clone() + broadcast(&f.bias1a),
            None => input.clone(),
        };
        if let Some(norm) = &self.norm1 {
            out = norm.forward(out);
        }
        let activated = relu(out);

        // Width changes project the activated input, as in the reference WRN.
        let residual = match &self.shortcut {
            Some(conv) => conv.forward(activated.clone()),
            None => input,
        };

        let mut out = match fixup {
            Some(f) => activated + broadcast(&f.bias1b),
            None => activated,
        };
        out = self.conv1.forward(out);
        if let Some(f) = fixup {
            out = out + broadcast(&f.bias2a);
        }
        if let Some(norm) = &self.norm2 {
            out = norm.forward(out);
        }
        out = self.dropout.forward(relu(out));
        if let Some(f) = fixup {
            out = out + broadcast(&f.bias2b);
        }
        out = self.conv2.forward(out);
        if let Some(f) = fixup {
            out = out * broadcast(&f.scale);
        }

        out + residual
    }
}

#[derive(Module, Debug)]
pub struct WideResNet<B: Backend> {
    stem: Conv2d<B>,
    blocks: Vec<BasicBlock<B>>,
    norm: Option<BatchNorm<B, 2>>,
    head: Linear<B>,
}

impl<B: Backend> WideResNet<B> {
    /// Class scores `[batch, num_classes]` for NCHW images.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.stem.forward(images);
        for block in &self.blocks {
            x = block.forward(x);
        }
        if let Some(norm) = &self.norm {
            x = norm.forward(x);
        }
        let x = relu(x);

        let [batch, channels, _, _] = x.dims();
        let pooled = x.mean_dim(3).mean_dim(2).reshape([batch, channels]);
        self.head.forward(pooled)
    }

    pub fn depth_blocks(&self) -> usize {
        self.blocks.len()
    }
}
