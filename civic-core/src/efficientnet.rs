//! EfficientNet-B0 feature extractor.
//!
//! Stem, sixteen MBConv blocks in seven stages, and the 1280-channel top convolution.
//! Inputs are RGB in `[0, 1]`; ImageNet normalisation is part of the network so callers
//! never normalise themselves.

use burn::{
    module::AutodiffModule,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::{
        activation::{sigmoid, silu},
        backend::AutodiffBackend,
    },
};
use std::ops::Range;

pub const FEATURES: usize = 1280;

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// `(expand ratio, kernel, stride, output channels, repeats)` per stage
const STAGES: [(usize, usize, usize, usize, usize); 7] = [
    (1, 3, 1, 16, 1),
    (6, 3, 2, 24, 2),
    (6, 5, 2, 40, 2),
    (6, 3, 2, 80, 3),
    (6, 5, 1, 112, 3),
    (6, 5, 2, 192, 4),
    (6, 3, 1, 320, 1),
];

const STEM: usize = 32;

#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    conv: Conv2d<B>,
    pub(crate) norm: BatchNorm<B, 2>,
}

impl<B: Backend> ConvNorm<B> {
    fn new(
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = kernel / 2;
        Self {
            conv: Conv2dConfig::new(channels, [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_groups(groups)
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(channels[1])
                .with_epsilon(1e-3)
                .with_momentum(0.01)
                .init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct SqueezeExcitation<B: Backend> {
    pool: AdaptiveAvgPool2d,
    reduce: Conv2d<B>,
    expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcitation<B> {
    fn new(channels: usize, squeezed: usize, device: &B::Device) -> Self {
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            reduce: Conv2dConfig::new([channels, squeezed], [1, 1]).init(device),
            expand: Conv2dConfig::new([squeezed, channels], [1, 1]).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = self.pool.forward(x.clone()); // [batch, channels, 1, 1]
        let scale = silu(self.reduce.forward(scale));
        let scale = sigmoid(self.expand.forward(scale));
        x * scale
    }
}

/// Inverted residual block with squeeze-excitation.
#[derive(Module, Debug)]
pub struct MbConv<B: Backend> {
    expand: Option<ConvNorm<B>>,
    depthwise: ConvNorm<B>,
    se: SqueezeExcitation<B>,
    project: ConvNorm<B>,
    residual: bool,
}

impl<B: Backend> MbConv<B> {
    fn new(
        input: usize,
        output: usize,
        expand_ratio: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = input * expand_ratio;
        Self {
            expand: (expand_ratio != 1).then(|| ConvNorm::new([input, hidden], 1, 1, 1, device)),
            depthwise: ConvNorm::new([hidden, hidden], kernel, stride, hidden, device),
            se: SqueezeExcitation::new(hidden, (input / 4).max(1), device),
            project: ConvNorm::new([hidden, output], 1, 1, 1, device),
            residual: stride == 1 && input == output,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => silu(expand.forward(input.clone())),
            None => input.clone(),
        };
        let x = silu(self.depthwise.forward(x));
        let x = self.se.forward(x);
        let x = self.project.forward(x);
        match self.residual {
            true => x + input,
            false => x,
        }
    }
}

#[derive(Module, Debug)]
pub struct EfficientNetB0<B: Backend> {
    pub(crate) stem: ConvNorm<B>,
    blocks: Vec<MbConv<B>>,
    top: ConvNorm<B>,
    /// Number of units, counted from the output, that receive gradients.
    /// Units are the stem, every MBConv block and the top convolution.
    trainable_tail: usize,
}

impl<B: Backend> EfficientNetB0<B> {
    pub fn new(device: &B::Device) -> Self {
        let mut blocks = vec![];
        let mut input = STEM;
        for (expand_ratio, kernel, stride, output, repeats) in STAGES {
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(MbConv::new(input, output, expand_ratio, kernel, stride, device));
                input = output;
            }
        }
        let units = blocks.len() + 2;
        Self {
            stem: ConvNorm::new([3, STEM], 3, 2, 1, device),
            blocks,
            top: ConvNorm::new([input, FEATURES], 1, 1, 1, device),
            trainable_tail: units,
        }
    }

    pub fn num_units(&self) -> usize {
        self.blocks.len() + 2
    }

    pub fn trainable_tail(&self) -> usize {
        self.trainable_tail
    }

    pub fn with_trainable_tail(mut self, units: usize) -> Self {
        self.trainable_tail = units.min(self.num_units());
        self
    }

    /// Units cut off from training, counted from the input.
    pub fn frozen_units(&self) -> usize {
        self.num_units() - self.trainable_tail
    }

    fn forward_unit(&self, unit: usize, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match unit {
            0 => silu(self.stem.forward(normalize(x))),
            unit if unit <= self.blocks.len() => self.blocks[unit - 1].forward(x),
            _ => silu(self.top.forward(x)),
        }
    }

    fn forward_units(&self, x: Tensor<B, 4>, units: Range<usize>) -> Tensor<B, 4> {
        units.fold(x, |x, unit| self.forward_unit(unit, x))
    }

    /// # Shapes
    ///   - Images [batch_size, 3, height, width], values in `[0, 1]`
    ///   - Output [batch_size, 1280, height / 32, width / 32]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let frozen = self.frozen_units();
        let x = match frozen {
            0 => images,
            frozen => self.forward_units(images, 0..frozen).detach(),
        };
        self.forward_units(x, frozen..self.num_units())
    }
}

impl<B: AutodiffBackend> EfficientNetB0<B> {
    /// Forward pass for a training step.
    ///
    /// Frozen units run on the inner backend, so their batch norms normalise with the
    /// running statistics and leave them untouched, as at inference.
    pub fn forward_train(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let frozen = self.frozen_units();
        let x = match frozen {
            0 => images,
            frozen => Tensor::from_inner(self.valid().forward_units(images.inner(), 0..frozen)),
        };
        self.forward_units(x, frozen..self.num_units())
    }
}

fn normalize<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = images.device();
    let mean = Tensor::<B, 1>::from_floats(MEAN, &device).reshape([1, 3, 1, 1]);
    let std = Tensor::<B, 1>::from_floats(STD, &device).reshape([1, 3, 1, 1]);
    (images - mean) / std
}
