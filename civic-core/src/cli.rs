use crate::{
    evaluate, logging, predict, train, AugmentConfig, EvaluateConfig, Output, PredictConfig,
    TrainingConfig,
};
use anyhow::{anyhow, Result};
use burn::{backend::Autodiff, config::Config, optim::AdamConfig};
use clap::{CommandFactory as _, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    subcmd: SubCmd,
}

#[derive(Debug, Subcommand)]
enum SubCmd {
    /// Train the classifier: a frozen-backbone phase, then fine-tuning of the backbone tail
    Train {
        /// Training config json; when given, every other flag is ignored
        #[arg(long)]
        config: Option<PathBuf>,
        /// Dataset root with one subdirectory per class
        #[arg(short, long, default_value = "dataset")]
        dataset_dir: PathBuf,
        /// Directory to save the model, configs and labels
        #[arg(short, long, default_value = "model")]
        artifact_dir: PathBuf,
        /// Where to write the label mapping, defaults to <ARTIFACT_DIR>/labels.json
        #[arg(short, long)]
        labels: Option<PathBuf>,
        /// Pretrained backbone record (burn named MessagePack, full precision)
        #[arg(long)]
        backbone_weights: Option<PathBuf>,
        #[arg(long, default_value = "224")]
        image_size: usize,
        #[arg(short, long, default_value = "16")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "4")]
        num_workers: usize,
        /// Epochs with the backbone frozen
        #[arg(long, default_value = "10")]
        frozen_epochs: usize,
        /// Epochs with the backbone tail trainable
        #[arg(long, default_value = "25")]
        fine_tune_epochs: usize,
        #[arg(long, default_value = "1.0e-3")]
        frozen_learning_rate: f64,
        #[arg(long, default_value = "1.0e-4")]
        fine_tune_learning_rate: f64,
        /// Backbone units unfrozen for fine-tuning, counted from the top
        #[arg(long, default_value = "3")]
        fine_tune_tail: usize,
        /// Fraction of every class held out for validation
        #[arg(short, long, default_value = "0.2")]
        validation_split: f64,
        /// Random seed for reproducibility
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
    /// Report precision, recall and the confusion matrix on the validation subset
    Evaluate {
        #[arg(short, long, default_value = "dataset")]
        dataset_dir: PathBuf,
        #[arg(short, long, default_value = "model")]
        artifact_dir: PathBuf,
        /// Where to write the label mapping, defaults to <ARTIFACT_DIR>/labels.json
        #[arg(short, long)]
        labels: Option<PathBuf>,
        /// Method to output the report
        #[arg(short, long, default_value = "tty")]
        output: Output,
        #[arg(short, long, default_value = "16")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "4")]
        num_workers: usize,
        /// Must match the split used for training
        #[arg(short, long, default_value = "0.2")]
        validation_split: f64,
    },
    /// Classify an image, or every image below a directory, printing one json line each
    Predict {
        #[arg(short, long, default_value = "model")]
        artifact_dir: PathBuf,
        /// Label mapping to read, defaults to <ARTIFACT_DIR>/labels.json
        #[arg(short, long)]
        labels: Option<PathBuf>,
        #[arg(short, long, default_value = "16")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "1")]
        num_workers: usize,
        /// Image file or directory of images
        input: PathBuf,
    },
    /// generate auto completion script
    GenCompletion {
        /// shell name
        shell: Shell,
    },
}

#[cfg(feature = "tch")]
type MyBackend = burn::backend::LibTorch<f32, i8>;
#[cfg(all(feature = "candle", not(feature = "tch")))]
type MyBackend = burn::backend::Candle<f32, i64>;
#[cfg(all(feature = "ndarray", not(any(feature = "tch", feature = "candle"))))]
type MyBackend = burn::backend::NdArray<f32>;

type MyAutodiffBackend = Autodiff<MyBackend>;

fn device() -> <MyBackend as burn::prelude::Backend>::Device {
    #[cfg(all(feature = "tch", target_os = "macos"))]
    let device = burn::backend::libtorch::LibTorchDevice::Mps;
    #[cfg(all(feature = "tch", not(target_os = "macos")))]
    let device = burn::backend::libtorch::LibTorchDevice::Cuda(0);

    #[cfg(all(feature = "candle-metal", not(feature = "tch")))]
    let device = burn::backend::candle::CandleDevice::metal(0);
    #[cfg(all(
        feature = "candle-cuda",
        not(any(feature = "tch", feature = "candle-metal"))
    ))]
    let device = burn::backend::candle::CandleDevice::cuda(0);
    #[cfg(all(
        feature = "candle",
        not(any(feature = "tch", feature = "candle-metal", feature = "candle-cuda"))
    ))]
    let device = burn::backend::candle::CandleDevice::Cpu;

    #[cfg(all(feature = "ndarray", not(any(feature = "tch", feature = "candle"))))]
    let device = burn::backend::ndarray::NdArrayDevice::Cpu;

    device
}

pub fn run() -> Result<()> {
    let args = Cli::parse();
    let default_log = match args.subcmd {
        SubCmd::Predict { .. } => "warn",
        _ => "info",
    };
    logging::init(default_log)?;

    match args.subcmd {
        SubCmd::Train {
            config,
            dataset_dir,
            artifact_dir,
            labels,
            backbone_weights,
            image_size,
            batch_size,
            num_workers,
            frozen_epochs,
            fine_tune_epochs,
            frozen_learning_rate,
            fine_tune_learning_rate,
            fine_tune_tail,
            validation_split,
            seed,
        } => {
            let config = match config {
                Some(path) => TrainingConfig::load(&path).map_err(|err| {
                    anyhow!("failed to load training config {}: {err:?}", path.display())
                })?,
                None => TrainingConfig::new(
                    dataset_dir,
                    artifact_dir,
                    AdamConfig::new(),
                    AugmentConfig::new(),
                )
                .with_labels(labels)
                .with_backbone_weights(backbone_weights)
                .with_image_size(image_size)
                .with_batch_size(batch_size)
                .with_num_workers(num_workers)
                .with_frozen_epochs(frozen_epochs)
                .with_fine_tune_epochs(fine_tune_epochs)
                .with_frozen_learning_rate(frozen_learning_rate)
                .with_fine_tune_learning_rate(fine_tune_learning_rate)
                .with_fine_tune_tail(fine_tune_tail)
                .with_validation_split(validation_split)
                .with_seed(seed),
            };
            let outcome = train::<MyAutodiffBackend>(config, device())?;
            match outcome.best_epoch {
                Some(epoch) => info!(epoch, "training finished, best fine-tuning epoch kept"),
                None => info!("training finished"),
            }
        }
        SubCmd::Evaluate {
            dataset_dir,
            artifact_dir,
            labels,
            output,
            batch_size,
            num_workers,
            validation_split,
        } => {
            let evaluation = evaluate::<MyBackend>(
                EvaluateConfig::new(dataset_dir, artifact_dir)
                    .with_labels(labels)
                    .with_batch_size(batch_size)
                    .with_num_workers(num_workers)
                    .with_validation_split(validation_split),
                device(),
            )?;
            evaluation.print(output)?;
        }
        SubCmd::Predict {
            artifact_dir,
            labels,
            batch_size,
            num_workers,
            input,
        } => {
            let predictions = predict::<MyBackend>(
                PredictConfig::new(artifact_dir, input)
                    .with_labels(labels)
                    .with_batch_size(batch_size)
                    .with_num_workers(num_workers),
                device(),
            )?;
            for prediction in predictions {
                println!("{}", serde_json::to_string(&prediction)?);
            }
        }
        SubCmd::GenCompletion { shell } => {
            generate(shell, &mut Cli::command(), "civic", &mut std::io::stdout());
        }
    }
    Ok(())
}
