use crate::{error::DataError, labels::Labels, model::Model, ModelConfig};
use anyhow::{anyhow, Context, Result};
use burn::{
    prelude::*,
    record::{CompactRecorder, Recorder},
};
use std::path::{Path, PathBuf};
use tracing::info;

/// Layout of the directory shared by `train`, `evaluate` and `predict`.
///
/// ```text
/// model/
/// ├── civic_efficientnet.mpk
/// ├── model_config.json
/// ├── train_config.json
/// ├── labels.json
/// ├── frozen/      learner logs of the frozen-backbone phase
/// └── fine_tune/   learner logs and best checkpoint of the fine-tuning phase
/// ```
#[derive(Debug, Clone)]
pub struct Artifact {
    dir: PathBuf,
}

impl Artifact {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record path without extension; the recorder appends `.mpk`.
    pub fn model_path(&self) -> PathBuf {
        self.dir.join("civic_efficientnet")
    }

    pub fn model_config_path(&self) -> PathBuf {
        self.dir.join("model_config.json")
    }

    pub fn train_config_path(&self) -> PathBuf {
        self.dir.join("train_config.json")
    }

    pub fn labels_path(&self) -> PathBuf {
        self.dir.join("labels.json")
    }

    pub fn phase_dir(&self, phase: &str) -> PathBuf {
        self.dir.join(phase)
    }

    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))
    }

    pub fn model_config(&self) -> Result<ModelConfig> {
        let path = self.model_config_path();
        ModelConfig::load(&path).map_err(|err| {
            anyhow!("failed to load model config {}: {err:?}", path.display())
        })
    }

    /// Rebuild the network from `model_config.json` and load the trained record.
    pub fn load_model<B: Backend>(&self, device: &B::Device) -> Result<(ModelConfig, Model<B>)> {
        let config = self.model_config()?;
        let record = CompactRecorder::new()
            .load(self.model_path(), device)
            .map_err(|err| {
                anyhow!(
                    "failed to load model {}: {err:?}",
                    self.model_path().display()
                )
            })?;
        let model = config.init::<B>(device).load_record(record);
        info!(
            classes = config.num_classes,
            "loaded model from {}",
            self.dir.display()
        );
        Ok((config, model))
    }

    pub fn save_model<B: Backend>(&self, model: Model<B>) -> Result<()> {
        model
            .save_file(self.model_path(), &CompactRecorder::new())
            .map_err(|err| anyhow!("failed to save model: {err:?}"))
    }
}

/// Labels from `path`, checked against the class count of the model.
pub fn load_labels(path: impl AsRef<Path>, config: &ModelConfig) -> Result<Labels> {
    let labels = Labels::load(path)?;
    if labels.len() != config.num_classes {
        return Err(DataError::ClassCountMismatch {
            model: config.num_classes,
            labels: labels.len(),
        }
        .into());
    }
    Ok(labels)
}

/// The `model-{epoch}` record kept in `<phase>/checkpoint` by the best-accuracy strategy;
/// the highest epoch wins if several remain.
pub(crate) fn best_checkpoint(phase_dir: &Path) -> Result<Option<(usize, PathBuf)>> {
    let dir = phase_dir.join("checkpoint");
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut best = None;
    for entry in std::fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        let epoch = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.strip_prefix("model-"))
            .and_then(|epoch| epoch.parse::<usize>().ok());
        if let Some(epoch) = epoch {
            if best.as_ref().map_or(true, |(e, _)| epoch > *e) {
                best = Some((epoch, path.with_extension("")));
            }
        }
    }
    Ok(best)
}
