use serde::{Deserialize, Serialize};

/// Running statistic tracking the latest value and a weighted average.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AverageMeter {
    val: f64,
    sum: f64,
    count: f64,
    avg: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record `value` observed `weight` times.
    pub fn update(&mut self, value: f64, weight: usize) {
        self.val = value;
        self.sum += value * weight as f64;
        self.count += weight as f64;
        self.avg = if self.count > 0.0 {
            self.sum / self.count
        } else {
            0.0
        };
    }

    pub fn val(&self) -> f64 {
        self.val
    }

    pub fn avg(&self) -> f64 {
        self.avg
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> f64 {
        self.count
    }
}

/// Averages collected over one pass of a split.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

/// One row of the per-epoch history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train: EvaluationMetrics,
    pub validation: EvaluationMetrics,
    pub best_accuracy: f64,
}
