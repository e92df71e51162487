use crate::{
    artifact::Artifact,
    data::{DatasetIndex, ImageBatcher, ImageDataSet},
    error::DataError,
    labels::Labels,
    report::{ClassificationReport, ConfusionMatrix},
};
use anyhow::{anyhow, Result};
use burn::{data::dataloader::DataLoaderBuilder, prelude::*};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Output {
    #[default]
    Tty,
    Json,
}

#[derive(Config, Debug)]
pub struct EvaluateConfig {
    pub dataset_dir: PathBuf,
    pub artifact_dir: PathBuf,
    /// Defaults to `<artifact_dir>/labels.json`
    pub labels: Option<PathBuf>,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    /// Has to match the fraction used for training to see the same images
    #[config(default = 0.2)]
    pub validation_split: f64,
}

impl EvaluateConfig {
    pub fn labels_path(&self) -> PathBuf {
        self.labels
            .clone()
            .unwrap_or_else(|| Artifact::new(&self.artifact_dir).labels_path())
    }
}

/// Scores of a model on the validation subset.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub labels: Labels,
    pub report: ClassificationReport,
    pub confusion_matrix: ConfusionMatrix,
}

impl Evaluation {
    pub fn print(&self, output: Output) -> Result<()> {
        match output {
            Output::Tty => println!("{self}"),
            Output::Json => println!("{}", serde_json::to_string_pretty(self)?),
        }
        Ok(())
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Classification report:")?;
        writeln!(f, "{}", self.report)?;
        writeln!(f, "Confusion matrix:")?;
        write!(f, "{}", self.confusion_matrix)
    }
}

pub fn evaluate<B: Backend>(config: EvaluateConfig, device: B::Device) -> Result<Evaluation> {
    let artifact = Artifact::new(&config.artifact_dir);
    let (model_config, model) = artifact.load_model::<B>(&device)?;

    let index = DatasetIndex::scan(&config.dataset_dir)?;
    let labels = index.labels().clone();
    if labels.len() != model_config.num_classes {
        return Err(DataError::ClassCountMismatch {
            model: model_config.num_classes,
            labels: labels.len(),
        }
        .into());
    }
    let split = index.split(config.validation_split)?;
    if split.valid.is_empty() {
        return Err(DataError::EmptySubset {
            subset: "validation",
        }
        .into());
    }
    info!(images = split.valid.len(), "evaluating the validation subset");

    let dataloader = DataLoaderBuilder::new(ImageBatcher::<B>::new(
        device.clone(),
        model_config.image_size,
    ))
    .batch_size(config.batch_size)
    .num_workers(config.num_workers)
    .build(ImageDataSet::valid(split.valid, model_config.image_size));

    let mut confusion_matrix = ConfusionMatrix::new(labels.len());
    for batch in dataloader.iter() {
        let truth = to_indices(batch.targets)?;
        let predicted = to_indices(model.forward(batch.images).argmax(1).flatten::<1>(0, 1))?;
        for (t, p) in truth.into_iter().zip(predicted) {
            confusion_matrix.record(t, p);
        }
    }

    let report = ClassificationReport::new(&confusion_matrix, &labels);
    info!(accuracy = report.accuracy, "evaluation done");

    let labels_path = config.labels_path();
    labels.save(&labels_path)?;
    info!("labels written to {}", labels_path.display());

    Ok(Evaluation {
        labels,
        report,
        confusion_matrix,
    })
}

fn to_indices<B: Backend>(tensor: Tensor<B, 1, Int>) -> Result<Vec<usize>> {
    let values = tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| anyhow!("failed to read class indices: {err:?}"))?;
    Ok(values.into_iter().map(|v| v as usize).collect())
}
