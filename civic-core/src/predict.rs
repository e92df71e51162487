use crate::{
    artifact::{load_labels, Artifact},
    data::{ImageBatcher, ImageDataSet},
};
use anyhow::{anyhow, Result};
use burn::{data::dataloader::DataLoaderBuilder, prelude::*};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

#[derive(Config, Debug)]
pub struct PredictConfig {
    pub artifact_dir: PathBuf,
    /// An image file or a directory searched recursively for images
    pub input: PathBuf,
    /// Defaults to `<artifact_dir>/labels.json`
    pub labels: Option<PathBuf>,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 1)]
    pub num_workers: usize,
}

impl PredictConfig {
    pub fn labels_path(&self) -> PathBuf {
        self.labels
            .clone()
            .unwrap_or_else(|| Artifact::new(&self.artifact_dir).labels_path())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    /// Softmax probability of `label`, rounded to 4 decimals
    pub confidence: f64,
    /// Only set when the input was a directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn round4(p: f32) -> f64 {
    ((p as f64) * 1e4).round() / 1e4
}

/// Top-1 class of every image under `config.input`, in path order.
pub fn predict<B: Backend>(config: PredictConfig, device: B::Device) -> Result<Vec<Prediction>> {
    let artifact = Artifact::new(&config.artifact_dir);
    let model_config = artifact.model_config()?;
    let labels = load_labels(config.labels_path(), &model_config)?;
    let (model_config, model) = artifact.load_model::<B>(&device)?;

    let with_path = config.input.is_dir();
    let dataset = ImageDataSet::predict(&config.input, model_config.image_size)?;
    let dataloader = DataLoaderBuilder::new(ImageBatcher::<B>::new(
        device.clone(),
        model_config.image_size,
    ))
    .batch_size(config.batch_size)
    .num_workers(config.num_workers)
    .build(dataset);

    let mut predictions = Vec::new();
    for batch in dataloader.iter() {
        let probabilities = model
            .probabilities(batch.images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| anyhow!("failed to read probabilities: {err:?}"))?;

        for (path, row) in batch
            .paths
            .into_iter()
            .zip(probabilities.chunks(labels.len()))
        {
            let (index, confidence) = row
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });
            let label = labels
                .name(index)
                .ok_or_else(|| anyhow!("class index {index} has no label"))?
                .to_string();
            debug!(path = %path.display(), %label, confidence, "predicted");
            predictions.push(Prediction {
                label,
                confidence: round4(confidence).clamp(0., 1.),
                path: with_path.then_some(path),
            });
        }
    }
    Ok(predictions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_rounded_to_four_places() {
        assert_eq!(round4(0.912_345), 0.9123);
        assert_eq!(round4(0.999_99), 1.0);
        assert_eq!(round4(0.0), 0.0);
    }

    #[test]
    fn single_image_prints_without_path() {
        let single = Prediction {
            label: "pothole".into(),
            confidence: 0.9123,
            path: None,
        };
        assert_eq!(
            serde_json::to_string(&single).unwrap(),
            r#"{"label":"pothole","confidence":0.9123}"#
        );

        let listed = Prediction {
            path: Some(PathBuf::from("photos/a.jpg")),
            ..single
        };
        assert_eq!(
            serde_json::to_string(&listed).unwrap(),
            r#"{"label":"pothole","confidence":0.9123,"path":"photos/a.jpg"}"#
        );
    }
}
