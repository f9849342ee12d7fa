use serde::{Deserialize, Serialize};

pub const DEFAULT_MILESTONES: [usize; 3] = [60, 120, 160];
pub const DEFAULT_GAMMA: f64 = 0.2;

/// Piecewise-constant learning rate decayed by `gamma` at each milestone.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepSchedule {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
}

impl StepSchedule {
    pub fn new(base_lr: f64, milestones: impl Into<Vec<usize>>, gamma: f64) -> Self {
        Self {
            base_lr,
            milestones: milestones.into(),
            gamma,
        }
    }

    /// Decays by 0.2 at epochs 60, 120 and 160.
    pub fn wide_resnet(base_lr: f64) -> Self {
        Self::new(base_lr, DEFAULT_MILESTONES, DEFAULT_GAMMA)
    }

    /// Factor applied to the base rate for a 1-indexed epoch.
    pub fn multiplier(&self, epoch: usize) -> f64 {
        let crossed = self
            .milestones
            .iter()
            .filter(|&&milestone| epoch >= milestone)
            .count();
        self.gamma.powi(crossed as i32)
    }

    pub fn lr(&self, epoch: usize) -> f64 {
        self.base_lr * self.multiplier(epoch)
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    pub fn milestones(&self) -> &[usize] {
        &self.milestones
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn multiplier_steps_at_each_milestone() {
        let schedule = StepSchedule::wide_resnet(0.1);
        for epoch in [1, 30, 59] {
            assert_relative_eq!(schedule.multiplier(epoch), 1.0);
        }
        for epoch in [60, 90, 119] {
            assert_relative_eq!(schedule.multiplier(epoch), 0.2);
        }
        for epoch in [120, 140, 159] {
            assert_relative_eq!(schedule.multiplier(epoch), 0.04, epsilon = 1e-12);
        }
        for epoch in [160, 200, 1000] {
            assert_relative_eq!(schedule.multiplier(epoch), 0.008, epsilon = 1e-12);
        }
    }

    #[test]
    fn lr_scales_base_rate() {
        let schedule = StepSchedule::wide_resnet(0.1);
        assert_relative_eq!(schedule.lr(1), 0.1);
        assert_relative_eq!(schedule.lr(125), 0.004, epsilon = 1e-12);
    }

    #[test]
    fn unsorted_milestones_still_count() {
        let schedule = StepSchedule::new(1.0, vec![10, 5], 0.5);
        assert_relative_eq!(schedule.multiplier(7), 0.5);
        assert_relative_eq!(schedule.multiplier(10), 0.25);
    }
}
