mod artifact;
#[cfg(any(feature = "ndarray", feature = "tch", feature = "candle"))]
mod cli;
pub mod data;
pub mod efficientnet;
mod error;
mod evaluate;
mod labels;
pub mod logging;
mod model;
mod predict;
mod renderer;
pub mod report;
mod train;

pub use artifact::{load_labels, Artifact};
#[cfg(any(feature = "ndarray", feature = "tch", feature = "candle"))]
pub use cli::run;
pub use data::AugmentConfig;
pub use error::DataError;
pub use evaluate::{evaluate, EvaluateConfig, Evaluation, Output};
pub use labels::Labels;
pub use model::{Model, ModelConfig};
pub use predict::{predict, PredictConfig, Prediction};
pub use train::{train, TrainOutcome, TrainingConfig};
