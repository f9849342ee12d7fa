//! Training-state snapshots: completed epochs, best accuracy and model weights.

use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    module::Module,
    record::{BinBytesRecorder, BinFileRecorder, FullPrecisionSettings, Record, Recorder},
    tensor::backend::Backend,
};
use tracing::{debug, info};

use crate::model::{WideResNet, WideResNetRecord};

pub const CHECKPOINT_FILE: &str = "checkpoint.bin";
pub const BEST_FILE: &str = "model_best.bin";
const RECORD_EXTENSION: &str = "bin";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to {action} checkpoint {}: {message}", path.display())]
    Recorder {
        action: &'static str,
        path: PathBuf,
        message: String,
    },
}

#[derive(Record)]
pub struct CheckpointRecord<B: Backend> {
    /// Number of completed epochs; a resumed run starts at this index.
    pub epoch: usize,
    pub best_prec1: f64,
    pub model: WideResNetRecord<B>,
}

impl<B: Backend> CheckpointRecord<B> {
    pub fn new(epoch: usize, best_prec1: f64, model: &WideResNet<B>) -> Self {
        Self {
            epoch,
            best_prec1,
            model: model.clone().into_record(),
        }
    }
}

/// Highest validation accuracy seen so far; only strict improvements count.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BestAccuracy(f64);

impl BestAccuracy {
    pub fn new(value: f64) -> Self {
        Self(value)
    }

    /// Fold in a new accuracy, returning whether it beat every earlier one.
    pub fn observe(&mut self, accuracy: f64) -> bool {
        let improved = accuracy > self.0;
        self.0 = self.0.max(accuracy);
        improved
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

fn recorder() -> BinFileRecorder<FullPrecisionSettings> {
    BinFileRecorder::<FullPrecisionSettings>::new()
}

/// Write `checkpoint.bin` under `dir`, copying it to `model_best.bin` when `is_best`.
pub fn save_checkpoint<B: Backend>(
    dir: &Path,
    record: CheckpointRecord<B>,
    is_best: bool,
) -> Result<PathBuf, CheckpointError> {
    fs::create_dir_all(dir).map_err(|source| CheckpointError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(CHECKPOINT_FILE);
    let epoch = record.epoch;
    Recorder::<B>::record(&recorder(), record, path.clone())
        .map_err(|err| CheckpointError::Recorder {
            action: "save",
            path: path.clone(),
            message: err.to_string(),
        })?;
    debug!(path = %path.display(), epoch, "saved checkpoint");

    if is_best {
        let best = dir.join(BEST_FILE);
        fs::copy(&path, &best).map_err(|source| CheckpointError::Io {
            path: best.clone(),
            source,
        })?;
        info!(path = %best.display(), epoch, "new best model");
    }

    Ok(path)
}

/// Load the checkpoint stored at exactly `path`, whatever its extension.
pub fn load_checkpoint<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<CheckpointRecord<B>, CheckpointError> {
    let bytes = fs::read(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    Recorder::<B>::load(&recorder, bytes, device)
        .map_err(|err| CheckpointError::Recorder {
            action: "load",
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

/// The file a resume path refers to, if any. Accepts the path with or without `.bin`.
pub fn resolve_resume(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    let with_extension = path.with_extension(RECORD_EXTENSION);
    with_extension.is_file().then_some(with_extension)
}
