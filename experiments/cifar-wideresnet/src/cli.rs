use std::path::PathBuf;

use clap::{ArgAction, Parser};
use serde::Serialize;

use crate::{dataset::CifarVariant, model::WideResNetConfig};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("batch size must be positive")]
    BatchSize,
    #[error("print frequency must be positive")]
    PrintFrequency,
    #[error("depth {0} is invalid; layers must satisfy (depth - 4) % 6 == 0 and depth >= 10")]
    Depth(usize),
    #[error("widen factor must be positive")]
    WidenFactor,
    #[error("dropout rate {0} must be in [0, 1)")]
    Droprate(f64),
    #[error("start epoch {start} is past the final epoch {end}")]
    EpochRange { start: usize, end: usize },
    #[error("cutout hole length must be positive when cutout is enabled")]
    CutoutLength,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "wrn-train", about = "Wide ResNet training on CIFAR-10/100")]
pub struct TrainArgs {
    /// Dataset to train on.
    #[arg(long, value_enum, default_value_t = CifarVariant::Cifar10)]
    pub dataset: CifarVariant,
    /// Number of total epochs to run.
    #[arg(long, default_value_t = 200)]
    pub epochs: usize,
    /// Manual epoch number (useful on restarts).
    #[arg(long, default_value_t = 0)]
    pub start_epoch: usize,
    /// Mini-batch size.
    #[arg(short = 'b', long, default_value_t = 128)]
    pub batch_size: usize,
    /// Initial learning rate.
    #[arg(long = "lr", visible_alias = "learning-rate", default_value_t = 0.1)]
    pub lr: f64,
    #[arg(long, default_value_t = 0.9)]
    pub momentum: f64,
    /// Nesterov momentum.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub nesterov: bool,
    #[arg(long, visible_alias = "wd", default_value_t = 5e-4)]
    pub weight_decay: f64,
    /// Print a progress line every N batches.
    #[arg(short = 'p', long, default_value_t = 10)]
    pub print_freq: usize,
    /// Total number of layers.
    #[arg(long, default_value_t = 28)]
    pub layers: usize,
    #[arg(long, default_value_t = 10)]
    pub widen_factor: usize,
    /// Apply batch normalization.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub batchnorm: bool,
    /// Apply Fixup initialization and scalar biases.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub fixup: bool,
    /// Dropout probability.
    #[arg(long, default_value_t = 0.0)]
    pub droprate: f64,
    /// Apply cutout.
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub cutout: bool,
    /// Number of holes to cut out from each image.
    #[arg(long = "n-holes", alias = "n_holes", default_value_t = 1)]
    pub n_holes: usize,
    /// Side length of each hole.
    #[arg(long, default_value_t = 16)]
    pub length: usize,
    /// Disable standard pad/crop/flip augmentation.
    #[arg(long = "no-augment", action = ArgAction::SetFalse)]
    pub augment: bool,
    /// Path to a checkpoint to resume from.
    #[arg(long, default_value = "")]
    pub resume: PathBuf,
    /// Experiment name; checkpoints go to `<runs-dir>/<name>/`.
    #[arg(long, default_value = "WideResNet-28-10")]
    pub name: String,
    /// Log scalar series to `<runs-dir>/<name>/scalars.jsonl`.
    #[arg(long)]
    pub tensorboard: bool,
    /// Dataset download and cache directory.
    #[arg(long, default_value = "../data")]
    pub data_dir: PathBuf,
    #[arg(long, default_value = "runs")]
    pub runs_dir: PathBuf,
    /// Background batch loading: 0 loads inline, any positive value uses one prefetch thread.
    #[arg(long, default_value_t = 1)]
    pub workers: usize,
    /// Seed for shuffling and augmentation; omitted means OS entropy.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Shuffle the validation split each epoch.
    #[arg(long)]
    pub shuffle_val: bool,
}

/// Augmentation settings of the training pipeline.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AugmentConfig {
    pub standard: bool,
    /// `(n_holes, length)` when cutout is enabled.
    pub cutout: Option<(usize, usize)>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OptimizerConfig {
    pub lr: f64,
    pub momentum: f64,
    pub nesterov: bool,
    pub weight_decay: f64,
}

/// Validated, immutable settings for one run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunConfig {
    pub name: String,
    pub dataset: CifarVariant,
    pub epochs: usize,
    pub start_epoch: usize,
    pub batch_size: usize,
    pub print_freq: usize,
    pub optimizer: OptimizerConfig,
    pub model: WideResNetConfig,
    pub augment: AugmentConfig,
    pub resume: Option<PathBuf>,
    pub log_scalars: bool,
    pub data_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub workers: usize,
    pub seed: Option<u64>,
    pub shuffle_val: bool,
}

impl RunConfig {
    pub fn run_dir(&self) -> PathBuf {
        self.runs_dir.join(&self.name)
    }
}

impl TrainArgs {
    pub fn into_config(self) -> Result<RunConfig, ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::BatchSize);
        }
        if self.print_freq == 0 {
            return Err(ConfigError::PrintFrequency);
        }
        if !WideResNetConfig::is_valid_depth(self.layers) {
            return Err(ConfigError::Depth(self.layers));
        }
        if self.widen_factor == 0 {
            return Err(ConfigError::WidenFactor);
        }
        if !(0.0..1.0).contains(&self.droprate) {
            return Err(ConfigError::Droprate(self.droprate));
        }
        if self.start_epoch > self.epochs {
            return Err(ConfigError::EpochRange {
                start: self.start_epoch,
                end: self.epochs,
            });
        }
        if self.cutout && self.n_holes > 0 && self.length == 0 {
            return Err(ConfigError::CutoutLength);
        }

        let resume = (!self.resume.as_os_str().is_empty()).then_some(self.resume);

        Ok(RunConfig {
            name: self.name,
            dataset: self.dataset,
            epochs: self.epochs,
            start_epoch: self.start_epoch,
            batch_size: self.batch_size,
            print_freq: self.print_freq,
            optimizer: OptimizerConfig {
                lr: self.lr,
                momentum: self.momentum,
                nesterov: self.nesterov,
                weight_decay: self.weight_decay,
            },
            model: WideResNetConfig {
                depth: self.layers,
                num_classes: self.dataset.num_classes(),
                widen_factor: self.widen_factor,
                droprate: self.droprate,
                use_bn: self.batchnorm,
                use_fixup: self.fixup,
            },
            augment: AugmentConfig {
                standard: self.augment,
                cutout: self.cutout.then_some((self.n_holes, self.length)),
            },
            resume,
            log_scalars: self.tensorboard,
            data_dir: self.data_dir,
            runs_dir: self.runs_dir,
            workers: self.workers,
            seed: self.seed,
            shuffle_val: self.shuffle_val,
        })
    }
}
