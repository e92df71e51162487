use crate::{
    artifact::{best_checkpoint, Artifact},
    data::{class_weights, AugmentConfig, DatasetIndex, ImageBatcher, ImageDataSet},
    labels::Labels,
    model::{Model, ModelConfig},
    renderer::TracingRenderer,
};
use anyhow::{anyhow, Context, Result};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    optim::AdamConfig,
    prelude::*,
    record::{CompactRecorder, Recorder},
    tensor::backend::AutodiffBackend,
    train::{
        checkpoint::MetricCheckpointingStrategy,
        metric::{
            store::{Aggregate, Direction, Split},
            AccuracyMetric, CpuMemory, CpuUse, LearningRateMetric, LossMetric,
        },
        LearnerBuilder,
    },
};
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};

use crate::data::ImageBatch;

#[derive(Config)]
pub struct TrainingConfig {
    /// One subdirectory per class
    pub dataset_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub optimizer: AdamConfig,
    pub augment: AugmentConfig,
    /// Defaults to `<artifact_dir>/labels.json`
    pub labels: Option<PathBuf>,
    /// Backbone record in burn's named MessagePack format, full precision
    pub backbone_weights: Option<PathBuf>,
    #[config(default = 224)]
    pub image_size: usize,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 10)]
    pub frozen_epochs: usize,
    #[config(default = 25)]
    pub fine_tune_epochs: usize,
    #[config(default = 1.0e-3)]
    pub frozen_learning_rate: f64,
    #[config(default = 1.0e-4)]
    pub fine_tune_learning_rate: f64,
    /// Backbone units trained during fine-tuning: the top convolution and the MBConv blocks before it
    #[config(default = 3)]
    pub fine_tune_tail: usize,
    #[config(default = 0.2)]
    pub validation_split: f64,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 256)]
    pub hidden_size: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl TrainingConfig {
    pub fn labels_path(&self) -> PathBuf {
        self.labels
            .clone()
            .unwrap_or_else(|| Artifact::new(&self.artifact_dir).labels_path())
    }
}

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub labels: Labels,
    /// Fine-tuning epoch whose weights were kept, if that phase ran
    pub best_epoch: Option<usize>,
    pub artifact: Artifact,
}

type TrainLoader<B> = Arc<dyn DataLoader<ImageBatch<B>>>;

fn reset_phase_dir(dir: &PathBuf) -> Result<()> {
    // Remove old logs and checkpoints to get an accurate learner summary
    if dir.exists() {
        std::fs::remove_dir_all(dir).with_context(|| format!("failed to clear {}", dir.display()))?;
    }
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
}

pub fn train<B: AutodiffBackend>(config: TrainingConfig, device: B::Device) -> Result<TrainOutcome> {
    let artifact = Artifact::new(&config.artifact_dir);
    artifact.create()?;

    B::seed(config.seed);

    let index = DatasetIndex::scan(&config.dataset_dir)?;
    let labels = index.labels().clone();
    let split = index.split(config.validation_split)?;
    split.ensure_non_empty()?;
    info!(
        train = split.train.len(),
        valid = split.valid.len(),
        "split {} classes",
        labels.len()
    );

    let weights = class_weights(&split.train, labels.len());
    for (name, weight) in labels.names().iter().zip(&weights) {
        info!(class = %name, weight, "class weight");
    }

    let model_config = ModelConfig::new(labels.len())
        .with_hidden_size(config.hidden_size)
        .with_dropout(config.dropout)
        .with_image_size(config.image_size);

    let batcher_train =
        ImageBatcher::<B>::new(device.clone(), config.image_size).with_class_weights(weights);
    let batcher_valid = ImageBatcher::<B::InnerBackend>::new(device.clone(), config.image_size);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(ImageDataSet::train(
            split.train,
            config.image_size,
            config.augment.clone(),
        ));
    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(ImageDataSet::valid(split.valid, config.image_size));

    let mut model = model_config.init::<B>(&device);
    if let Some(weights) = &config.backbone_weights {
        model = model.load_backbone(weights, &device)?;
        info!("loaded backbone weights from {}", weights.display());
    } else {
        warn!("no backbone weights given, the backbone starts from random initialisation");
    }

    if config.frozen_epochs > 0 {
        model = fit_frozen(
            &config,
            &artifact,
            model,
            &device,
            dataloader_train.clone(),
            dataloader_valid.clone(),
        )?;
    }

    let mut best_epoch = None;
    if config.fine_tune_epochs > 0 {
        let (tuned, epoch) =
            fit_fine_tune(&config, &artifact, model, &device, dataloader_train, dataloader_valid)?;
        model = tuned;
        best_epoch = epoch;
    }

    // configs only after the record, so an aborted run keeps the previous pair consistent
    artifact.save_model(model)?;
    model_config
        .save(artifact.model_config_path())
        .context("failed to save the model config")?;
    config
        .save(artifact.train_config_path())
        .context("failed to save the training config")?;
    let labels_path = config.labels_path();
    labels.save(&labels_path)?;
    info!(
        "model saved to {}, labels to {}",
        artifact.model_path().display(),
        labels_path.display()
    );

    Ok(TrainOutcome {
        labels,
        best_epoch,
        artifact,
    })
}

/// Phase 1: the backbone is frozen, only the head learns.
fn fit_frozen<B: AutodiffBackend>(
    config: &TrainingConfig,
    artifact: &Artifact,
    model: Model<B>,
    device: &B::Device,
    dataloader_train: TrainLoader<B>,
    dataloader_valid: TrainLoader<B::InnerBackend>,
) -> Result<Model<B>> {
    let dir = artifact.phase_dir("frozen");
    reset_phase_dir(&dir)?;
    info!(
        epochs = config.frozen_epochs,
        learning_rate = config.frozen_learning_rate,
        "training the head on a frozen backbone"
    );

    let learner = LearnerBuilder::new(&dir)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .metric_train(LearningRateMetric::new())
        .metric_train(CpuUse::new())
        .metric_train(CpuMemory::new())
        .with_application_logger(None)
        .renderer(TracingRenderer::new("frozen"))
        .devices(vec![device.clone()])
        .num_epochs(config.frozen_epochs)
        .summary()
        .build(
            model.freeze_backbone(),
            config.optimizer.init(),
            config.frozen_learning_rate,
        );

    Ok(learner.fit(dataloader_train, dataloader_valid))
}

/// Phase 2: the tail of the backbone is unfrozen, the best validation accuracy is kept.
fn fit_fine_tune<B: AutodiffBackend>(
    config: &TrainingConfig,
    artifact: &Artifact,
    model: Model<B>,
    device: &B::Device,
    dataloader_train: TrainLoader<B>,
    dataloader_valid: TrainLoader<B::InnerBackend>,
) -> Result<(Model<B>, Option<usize>)> {
    let dir = artifact.phase_dir("fine_tune");
    reset_phase_dir(&dir)?;
    info!(
        epochs = config.fine_tune_epochs,
        learning_rate = config.fine_tune_learning_rate,
        units = config.fine_tune_tail,
        "fine-tuning the backbone tail"
    );

    let learner = LearnerBuilder::new(&dir)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .metric_train(LearningRateMetric::new())
        .metric_train(CpuUse::new())
        .metric_train(CpuMemory::new())
        .with_file_checkpointer(CompactRecorder::new())
        .with_checkpointing_strategy(MetricCheckpointingStrategy::new::<AccuracyMetric<B>>(
            Aggregate::Mean,
            Direction::Highest,
            Split::Valid,
        ))
        .with_application_logger(None)
        .renderer(TracingRenderer::new("fine_tune"))
        .devices(vec![device.clone()])
        .num_epochs(config.fine_tune_epochs)
        .summary()
        .build(
            model.unfreeze_tail(config.fine_tune_tail),
            config.optimizer.init(),
            config.fine_tune_learning_rate,
        );

    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    match best_checkpoint(&dir)? {
        Some((epoch, path)) => {
            info!(epoch, "keeping the checkpoint with the best validation accuracy");
            let record = CompactRecorder::new()
                .load(path.clone(), device)
                .map_err(|err| anyhow!("failed to load checkpoint {}: {err:?}", path.display()))?;
            Ok((model_trained.load_record(record), Some(epoch)))
        }
        None => {
            warn!("no checkpoint was written, keeping the last epoch");
            Ok((model_trained, None))
        }
    }
}
