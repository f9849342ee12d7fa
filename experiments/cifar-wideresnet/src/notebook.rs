use std::{
    fmt::Write,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Result};
use burn_dataset::Dataset;
use wrn_core::{
    encode_chw_png_data_url, ensure_report_file, seeded_rng, update_sections, EpochMetrics,
    ReportSection, StepSchedule, RUN_NOTEBOOK_TEMPLATE,
};

use crate::{
    cli::RunConfig,
    dataset::{CifarDataset, IMAGE_SIDE},
    transform::{Image, Pipeline},
};

const SAMPLE_COUNT: usize = 3;
const SAMPLE_SEED: u64 = 1337;

/// Markdown record of a run, kept next to its checkpoints.
pub struct RunNotebook {
    path: PathBuf,
}

impl RunNotebook {
    pub fn open(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join("report.md");
        ensure_report_file(&path, RUN_NOTEBOOK_TEMPLATE)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_setup(
        &self,
        config: &RunConfig,
        schedule: &StepSchedule,
        dataset: &CifarDataset,
        pipeline: &Pipeline,
    ) -> Result<()> {
        let samples = render_samples(config, dataset, pipeline)?;
        update_sections(
            &self.path,
            &[
                ReportSection::new("configuration", render_configuration(config)),
                ReportSection::new("schedule", render_schedule(schedule, config.epochs)),
                ReportSection::new("samples", samples),
            ],
        )
    }

    pub fn write_history(&self, history: &[EpochMetrics]) -> Result<()> {
        update_sections(
            &self.path,
            &[ReportSection::new("metrics", render_history(history))],
        )
    }
}

fn render_configuration(config: &RunConfig) -> String {
    let cutout = match config.augment.cutout {
        Some((holes, length)) => format!("{holes} hole(s) of {length}px"),
        None => "off".to_string(),
    };
    format!(
        "- Dataset: {}\n- Model: WRN-{}-{} (dropout {}, batch norm {}, fixup {})\n- Epochs: {}..{}\n- Batch size: {}\n- SGD: lr {}, momentum {}, nesterov {}, weight decay {}\n- Standard augmentation: {}\n- Cutout: {}\n- Seed: {}\n",
        config.dataset,
        config.model.depth,
        config.model.widen_factor,
        config.model.droprate,
        config.model.use_bn,
        config.model.use_fixup,
        config.start_epoch,
        config.epochs,
        config.batch_size,
        config.optimizer.lr,
        config.optimizer.momentum,
        config.optimizer.nesterov,
        config.optimizer.weight_decay,
        config.augment.standard,
        cutout,
        config
            .seed
            .map_or_else(|| "entropy".to_string(), |seed| seed.to_string()),
    )
}

fn render_schedule(schedule: &StepSchedule, epochs: usize) -> String {
    let mut output = String::new();
    let _ = writeln!(&mut output, "| From epoch | Learning rate |");
    let _ = writeln!(&mut output, "| --- | --- |");
    let starts = std::iter::once(1).chain(schedule.milestones().iter().copied());
    for start in starts.filter(|&start| start <= epochs.max(1)) {
        let _ = writeln!(&mut output, "| {} | {:.6} |", start, schedule.lr(start));
    }
    output
}

fn render_history(history: &[EpochMetrics]) -> String {
    let mut output = String::new();
    if let Some(last) = history.last() {
        let _ = writeln!(
            &mut output,
            "- Epochs completed: {}\n- Best validation Prec@1: {:.3}\n",
            last.epoch, last.best_accuracy
        );
    }
    let _ = writeln!(
        &mut output,
        "| Epoch | LR | Train Loss | Train Prec@1 | Val Loss | Val Prec@1 | Best |"
    );
    let _ = writeln!(&mut output, "| --- | --- | --- | --- | --- | --- | --- |");
    for row in history {
        let _ = writeln!(
            &mut output,
            "| {} | {:.5} | {:.4} | {:.3} | {:.4} | {:.3} | {:.3} |",
            row.epoch,
            row.learning_rate,
            row.train.loss,
            row.train.accuracy,
            row.validation.loss,
            row.validation.accuracy,
            row.best_accuracy
        );
    }
    output
}

fn render_samples(
    config: &RunConfig,
    dataset: &CifarDataset,
    pipeline: &Pipeline,
) -> Result<String> {
    let available = SAMPLE_COUNT.min(dataset.len());
    if available == 0 {
        return Ok("No training samples available.".to_string());
    }

    let norm = config.dataset.normalization();
    let mut rng = seeded_rng(config.seed.unwrap_or(SAMPLE_SEED));
    let mut output = String::new();
    for index in 0..available {
        let item = dataset
            .get(index)
            .ok_or_else(|| anyhow!("dataset index {index} out of bounds"))?;
        let augmented = pipeline.apply(Image::cifar(&item.pixels), &mut rng);
        let display = augmented.denormalize(&norm);
        let url = encode_chw_png_data_url(IMAGE_SIDE as u32, IMAGE_SIDE as u32, &display.data)?;
        let _ = writeln!(
            &mut output,
            "#### Sample {} (label {})\n\n![Augmented sample]({})\n",
            index + 1,
            item.label,
            url
        );
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wrn_core::EvaluationMetrics;

    #[test]
    fn schedule_table_lists_each_step() {
        let table = render_schedule(&StepSchedule::wide_resnet(0.1), 200);
        assert!(table.contains("| 1 | 0.100000 |"));
        assert!(table.contains("| 60 | 0.020000 |"));
        assert!(table.contains("| 160 | 0.000800 |"));

        let short = render_schedule(&StepSchedule::wide_resnet(0.1), 10);
        assert!(!short.contains("| 60 |"));
    }

    #[test]
    fn history_table_has_one_row_per_epoch() {
        let row = |epoch| EpochMetrics {
            epoch,
            learning_rate: 0.1,
            train: EvaluationMetrics {
                loss: 2.0,
                accuracy: 10.0,
            },
            validation: EvaluationMetrics {
                loss: 1.5,
                accuracy: 20.0,
            },
            best_accuracy: 20.0,
        };
        let text = render_history(&[row(1), row(2)]);
        assert!(text.contains("- Epochs completed: 2"));
        assert_eq!(text.lines().filter(|line| line.starts_with("| 1 ") || line.starts_with("| 2 ")).count(), 2);
    }
}
