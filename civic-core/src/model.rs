use crate::data::ImageBatch;
use crate::efficientnet::{EfficientNetB0, FEATURES};
use anyhow::{anyhow, Result};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::activation::{log_softmax, softmax};
use burn::tensor::backend::AutodiffBackend;
use burn::train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep};
use nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, Relu};
use std::path::Path;

/// Pooling, normalisation and two dense layers on top of the backbone features.
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pool: AdaptiveAvgPool2d,
    norm: BatchNorm<B, 1>,
    hidden: Linear<B>,
    activation: Relu,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    /// # Shapes
    ///   - Features [batch_size, 1280, h, w]
    ///   - Output [batch_size, num_classes]
    fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, _, _] = features.dims();
        let x = self.pool.forward(features).reshape([batch_size, channels, 1]);
        let x = self.norm.forward(x).reshape([batch_size, channels]);
        let x = self.activation.forward(self.hidden.forward(x));
        let x = self.dropout.forward(x);
        self.output.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    backbone: EfficientNetB0<B>,
    head: ClassifierHead<B>,
}

impl<B: Backend> Model<B> {
    /// # Shapes
    ///   - Images [batch_size, 3, size, size], values in `[0, 1]`
    ///   - Output [batch_size, num_classes], logits
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// Class probabilities, `[batch_size, num_classes]`.
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// Train the head only.
    pub fn freeze_backbone(mut self) -> Self {
        self.backbone = self.backbone.with_trainable_tail(0);
        self
    }

    /// Let gradients reach the last `units` backbone units as well as the head.
    pub fn unfreeze_tail(mut self, units: usize) -> Self {
        self.backbone = self.backbone.with_trainable_tail(units);
        self
    }

    pub fn trainable_backbone_units(&self) -> usize {
        self.backbone.trainable_tail()
    }

    /// Load backbone weights saved with burn's named MessagePack recorder at full precision,
    /// e.g. ImageNet weights converted from another framework.
    pub fn load_backbone(mut self, path: impl AsRef<Path>, device: &B::Device) -> Result<Self> {
        let path = path.as_ref();
        let record = NamedMpkFileRecorder::<FullPrecisionSettings>::default()
            .load(path.to_path_buf(), device)
            .map_err(|err| {
                anyhow!("failed to load backbone weights {}: {err:?}", path.display())
            })?;
        self.backbone = self.backbone.load_record(record);
        Ok(self)
    }

    /// Categorical cross-entropy, each sample scaled by `weights` and averaged over the batch.
    pub fn weighted_loss(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
        weights: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        let [batch_size, _] = logits.dims();
        let nll = log_softmax(logits, 1)
            .gather(1, targets.reshape([batch_size, 1]))
            .reshape([batch_size])
            .neg();
        (nll * weights).mean()
    }

    fn classification(
        &self,
        output: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
        weights: Tensor<B, 1>,
    ) -> ClassificationOutput<B> {
        let loss = self.weighted_loss(output.clone(), targets.clone(), weights);
        ClassificationOutput::new(loss, output, targets)
    }
}

impl<B: AutodiffBackend> Model<B> {
    /// Logits for a training step; frozen backbone units run in inference mode.
    pub fn forward_train(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward_train(images))
    }
}

impl<B: AutodiffBackend> TrainStep<ImageBatch<B>, ClassificationOutput<B>> for Model<B> {
    fn step(&self, batch: ImageBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let output = self.forward_train(batch.images);
        let classify = self.classification(output, batch.targets, batch.weights);
        TrainOutput::new(self, classify.loss.backward(), classify)
    }
}

impl<B: Backend> ValidStep<ImageBatch<B>, ClassificationOutput<B>> for Model<B> {
    fn step(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        let output = self.forward(batch.images);
        self.classification(output, batch.targets, batch.weights)
    }
}

/// Everything needed to rebuild the network before loading a record.
#[derive(Config, Debug)]
pub struct ModelConfig {
    pub num_classes: usize,
    #[config(default = 256)]
    pub hidden_size: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
    /// Side of the square input images
    #[config(default = 224)]
    pub image_size: usize,
}

impl ModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        Model {
            backbone: EfficientNetB0::new(device),
            head: ClassifierHead {
                pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
                norm: BatchNormConfig::new(FEATURES)
                    .with_epsilon(1e-3)
                    .with_momentum(0.01)
                    .init(device),
                hidden: LinearConfig::new(FEATURES, self.hidden_size).init(device),
                activation: Relu::new(),
                dropout: DropoutConfig::new(self.dropout).init(),
                output: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn outputs_one_probability_row_per_image() {
        let device = Default::default();
        let model = ModelConfig::new(8).with_hidden_size(16).init::<NdArray>(&device);
        let probs = model.probabilities(Tensor::ones([3, 3, 32, 32], &device));
        assert_eq!(probs.dims(), [3, 8]);

        let sums = probs.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        for sum in sums {
            assert!((sum - 1.).abs() < 1e-4);
        }
    }

    #[test]
    fn loss_scales_with_class_weight() {
        let device = Default::default();
        let model = ModelConfig::new(2).init::<NdArray>(&device);
        let logits = Tensor::<NdArray, 2>::from_floats([[2.0, 0.0], [0.0, 2.0]], &device);
        let targets = Tensor::<NdArray, 1, Int>::from_ints([0, 0], &device);

        let plain = model
            .weighted_loss(logits.clone(), targets.clone(), Tensor::ones([2], &device))
            .into_scalar();
        let doubled = model
            .weighted_loss(logits, targets, Tensor::from_floats([2.0, 2.0], &device))
            .into_scalar();
        // mean of -ln softmax: ln(1 + e^-2) and ln(1 + e^2)
        let expected = ((1. + (-2f32).exp()).ln() + (1. + 2f32.exp()).ln()) / 2.;
        assert!((plain - expected).abs() < 1e-4);
        assert!((doubled - 2. * expected).abs() < 1e-4);
    }

    #[test]
    fn frozen_backbone_trains_head_only() {
        let device = Default::default();
        let model = ModelConfig::new(3)
            .with_hidden_size(8)
            .init::<TestBackend>(&device)
            .freeze_backbone();
        assert_eq!(model.trainable_backbone_units(), 0);

        let images = Tensor::<TestBackend, 4>::ones([2, 3, 32, 32], &device);
        let grads = model.forward(images).sum().backward();
        assert!(model.head.output.weight.grad(&grads).is_some());
        assert!(model.head.hidden.weight.grad(&grads).is_some());

        let model = model.unfreeze_tail(3);
        assert_eq!(model.trainable_backbone_units(), 3);
    }

    #[test]
    fn train_step_leaves_frozen_backbone_statistics_alone() {
        let device = Default::default();
        let model = ModelConfig::new(2)
            .with_hidden_size(8)
            .init::<TestBackend>(&device)
            .freeze_backbone();
        let running_mean = |model: &Model<TestBackend>| {
            model
                .backbone
                .stem
                .norm
                .running_mean
                .value()
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .unwrap()
        };
        let before = running_mean(&model);

        let batch = ImageBatch {
            images: Tensor::random([2, 3, 32, 32], Distribution::Uniform(0., 1.), &device),
            targets: Tensor::from_ints([0, 1], &device),
            weights: Tensor::ones([2], &device),
            paths: vec!["a.png".into(), "b.png".into()],
        };
        let output = TrainStep::step(&model, batch);

        assert_eq!(running_mean(&model), before);
        assert!(output
            .grads
            .get::<NdArray, 2>(model.head.output.weight.id)
            .is_some());
    }
}
