//! CIFAR-10/100 in the binary distribution format.
//!
//! Each record is `label_bytes` header bytes followed by a 32x32 RGB image stored
//! channel-planar (1024 red, 1024 green, 1024 blue). CIFAR-100 records carry a coarse
//! label before the fine label; only the fine label is used.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use burn_dataset::Dataset;
use clap::ValueEnum;
use flate2::read::GzDecoder;
use serde::Serialize;
use tracing::{debug, info};

pub const IMAGE_SIDE: usize = 32;
pub const IMAGE_CHANNELS: usize = 3;
pub const IMAGE_BYTES: usize = IMAGE_CHANNELS * IMAGE_SIDE * IMAGE_SIDE;

const CIFAR_MEAN: [f32; 3] = [125.3 / 255.0, 123.0 / 255.0, 113.9 / 255.0];
const CIFAR_STD: [f32; 3] = [63.0 / 255.0, 62.1 / 255.0, 66.7 / 255.0];

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed CIFAR file {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error("dataset files missing under {} and download is disabled", .0.display())]
    Missing(PathBuf),
    #[error("{pixels} pixel bytes do not match {labels} images")]
    Inconsistent { pixels: usize, labels: usize },
    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

pub type DatasetResult<T> = Result<T, DatasetError>;

/// Per-channel normalization constants.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }
}

/// Static description of one CIFAR variant.
#[derive(Debug)]
pub struct VariantSpec {
    pub num_classes: usize,
    pub url: &'static str,
    pub archive_dir: &'static str,
    pub train_files: &'static [&'static str],
    pub test_files: &'static [&'static str],
    /// Header bytes per record; the last one is the class label.
    pub label_bytes: usize,
    pub normalization: Normalization,
}

const CIFAR10_SPEC: VariantSpec = VariantSpec {
    num_classes: 10,
    url: "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz",
    archive_dir: "cifar-10-batches-bin",
    train_files: &[
        "data_batch_1.bin",
        "data_batch_2.bin",
        "data_batch_3.bin",
        "data_batch_4.bin",
        "data_batch_5.bin",
    ],
    test_files: &["test_batch.bin"],
    label_bytes: 1,
    normalization: Normalization {
        mean: CIFAR_MEAN,
        std: CIFAR_STD,
    },
};

const CIFAR100_SPEC: VariantSpec = VariantSpec {
    num_classes: 100,
    url: "https://www.cs.toronto.edu/~kriz/cifar-100-binary.tar.gz",
    archive_dir: "cifar-100-binary",
    train_files: &["train.bin"],
    test_files: &["test.bin"],
    label_bytes: 2,
    normalization: Normalization {
        mean: CIFAR_MEAN,
        std: CIFAR_STD,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CifarVariant {
    #[value(name = "cifar10")]
    Cifar10,
    #[value(name = "cifar100")]
    Cifar100,
}

impl CifarVariant {
    pub fn spec(&self) -> &'static VariantSpec {
        match self {
            Self::Cifar10 => &CIFAR10_SPEC,
            Self::Cifar100 => &CIFAR100_SPEC,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.spec().num_classes
    }

    pub fn normalization(&self) -> Normalization {
        self.spec().normalization
    }

    pub fn record_len(&self) -> usize {
        self.spec().label_bytes + IMAGE_BYTES
    }

    fn files(&self, split: Split) -> &'static [&'static str] {
        match split {
            Split::Train => self.spec().train_files,
            Split::Test => self.spec().test_files,
        }
    }
}

impl fmt::Display for CifarVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cifar10 => f.write_str("cifar10"),
            Self::Cifar100 => f.write_str("cifar100"),
        }
    }
}

impl FromStr for CifarVariant {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(value, true)
    }
}

/// One decoded sample: CHW bytes plus the class index.
#[derive(Clone, Debug, PartialEq)]
pub struct CifarImage {
    pub pixels: Vec<u8>,
    pub label: usize,
}

/// An in-memory CIFAR split.
#[derive(Clone, Debug)]
pub struct CifarDataset {
    variant: CifarVariant,
    pixels: Arc<[u8]>,
    labels: Arc<[u8]>,
}

impl CifarDataset {
    /// Load a split from `data_dir`, fetching the archive first when allowed.
    pub fn open(
        variant: CifarVariant,
        split: Split,
        data_dir: &Path,
        download: bool,
    ) -> DatasetResult<Self> {
        let root = data_dir.join(variant.spec().archive_dir);
        let files: Vec<PathBuf> = variant
            .files(split)
            .iter()
            .map(|name| root.join(name))
            .collect();

        if !files.iter().all(|path| path.is_file()) {
            if !download {
                return Err(DatasetError::Missing(root));
            }
            download_archive(variant, data_dir)?;
        }

        let mut pixels = Vec::new();
        let mut labels = Vec::new();
        for path in &files {
            let bytes = fs::read(path).map_err(|source| DatasetError::Io {
                path: path.clone(),
                source,
            })?;
            parse_records(variant, &bytes, &mut pixels, &mut labels).map_err(|reason| {
                DatasetError::Malformed {
                    path: path.clone(),
                    reason,
                }
            })?;
            debug!(path = %path.display(), "decoded CIFAR batch file");
        }

        info!(
            dataset = %variant,
            split = split.label(),
            samples = labels.len(),
            "loaded dataset"
        );
        Self::from_parts(variant, pixels, labels)
    }

    /// Build a dataset from already-decoded CHW pixel bytes and labels.
    pub fn from_parts(
        variant: CifarVariant,
        pixels: Vec<u8>,
        labels: Vec<u8>,
    ) -> DatasetResult<Self> {
        if pixels.len() != labels.len() * IMAGE_BYTES {
            return Err(DatasetError::Inconsistent {
                pixels: pixels.len(),
                labels: labels.len(),
            });
        }
        Ok(Self {
            variant,
            pixels: pixels.into(),
            labels: labels.into(),
        })
    }

    pub fn variant(&self) -> CifarVariant {
        self.variant
    }
}

impl Dataset<CifarImage> for CifarDataset {
    fn get(&self, index: usize) -> Option<CifarImage> {
        let label = *self.labels.get(index)?;
        let start = index * IMAGE_BYTES;
        Some(CifarImage {
            pixels: self.pixels.get(start..start + IMAGE_BYTES)?.to_vec(),
            label: label as usize,
        })
    }

    fn len(&self) -> usize {
        self.labels.len()
    }
}

/// Decode a buffer of fixed-size records, appending to `pixels` and `labels`.
pub fn parse_records(
    variant: CifarVariant,
    bytes: &[u8],
    pixels: &mut Vec<u8>,
    labels: &mut Vec<u8>,
) -> Result<(), String> {
    let record_len = variant.record_len();
    let header = variant.spec().label_bytes;
    if bytes.len() % record_len != 0 {
        return Err(format!(
            "length {} is not a multiple of the {record_len}-byte record size",
            bytes.len()
        ));
    }

    let count = bytes.len() / record_len;
    pixels.reserve(count * IMAGE_BYTES);
    labels.reserve(count);

    for (index, record) in bytes.chunks_exact(record_len).enumerate() {
        let label = record[header - 1];
        if label as usize >= variant.num_classes() {
            return Err(format!(
                "record {index} has label {label}, expected < {}",
                variant.num_classes()
            ));
        }
        labels.push(label);
        pixels.extend_from_slice(&record[header..]);
    }
    Ok(())
}

fn download_archive(variant: CifarVariant, data_dir: &Path) -> DatasetResult<()> {
    let url = variant.spec().url;
    info!(url, dest = %data_dir.display(), "downloading dataset archive");

    let fetch = || -> Result<Vec<u8>, reqwest::Error> {
        let response = reqwest::blocking::get(url)?.error_for_status()?;
        Ok(response.bytes()?.to_vec())
    };
    let archive = fetch().map_err(|source| DatasetError::Download {
        url: url.to_string(),
        source,
    })?;

    let io_err = |source| DatasetError::Io {
        path: data_dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(data_dir).map_err(io_err)?;
    tar::Archive::new(GzDecoder::new(archive.as_slice()))
        .unpack(data_dir)
        .map_err(io_err)?;

    info!(bytes = archive.len(), "extracted dataset archive");
    Ok(())
}
