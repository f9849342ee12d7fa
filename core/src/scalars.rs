use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One point of a named scalar series.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScalarPoint {
    pub name: String,
    pub step: usize,
    pub value: f64,
}

/// Append-only JSON-lines sink for scalar time series keyed by epoch.
pub struct ScalarLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ScalarLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open scalar log {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn log_value(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        let point = ScalarPoint {
            name: name.to_string(),
            step,
            value,
        };
        serde_json::to_writer(&mut self.writer, &point)?;
        self.writer.write_all(b"\n")?;
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse every point from a scalar log.
pub fn read_scalars(path: &Path) -> Result<Vec<ScalarPoint>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read scalar log {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).context("malformed scalar line"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_points_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scalars.jsonl");

        let mut log = ScalarLog::open(&path).unwrap();
        log.log_value("train_loss", 1.5, 0).unwrap();
        drop(log);

        let mut log = ScalarLog::open(&path).unwrap();
        log.log_value("val_acc", 42.0, 0).unwrap();

        let points = read_scalars(&path).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].name, "train_loss");
        assert_eq!(points[1].value, 42.0);
    }
}
