use std::{path::PathBuf, time::Instant};

use anyhow::{anyhow, Context, Result};
use burn::{
    module::{AutodiffModule, Module},
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{
        decay::WeightDecayConfig, momentum::MomentumConfig, GradientsAccumulator,
        GradientsParams, Optimizer, SgdConfig,
    },
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use tracing::{info, warn};
use wrn_core::{
    accuracy, load_json, save_json, AverageMeter, EpochMetrics, EvaluationMetrics, ScalarLog,
    StepSchedule,
};

use crate::{
    checkpoint::{
        load_checkpoint, resolve_resume, save_checkpoint, BestAccuracy, CheckpointRecord,
    },
    cli::RunConfig,
    dataset::{CifarDataset, Split},
    loader::{BatchLoader, HostBatch},
    model::WideResNet,
    notebook::RunNotebook,
    transform::Pipeline,
};

/// State threaded through one training run.
pub struct RunContext {
    pub config: RunConfig,
    pub schedule: StepSchedule,
    pub best: BestAccuracy,
    pub start_epoch: usize,
    pub history: Vec<EpochMetrics>,
    sink: Option<ScalarLog>,
}

impl RunContext {
    pub fn new(config: RunConfig) -> Result<Self> {
        let run_dir = config.run_dir();
        let sink = if config.log_scalars {
            Some(ScalarLog::open(&run_dir.join("scalars.jsonl"))?)
        } else {
            None
        };

        Ok(Self {
            schedule: StepSchedule::wide_resnet(config.optimizer.lr),
            best: BestAccuracy::default(),
            start_epoch: config.start_epoch,
            history: Vec::new(),
            sink,
            config,
        })
    }

    pub fn run_dir(&self) -> PathBuf {
        self.config.run_dir()
    }

    pub fn log_value(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.log_value(name, value, step),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunSummary {
    pub best_accuracy: f64,
    pub history: Vec<EpochMetrics>,
    pub run_dir: PathBuf,
}

/// Train from the loaded configuration to the last epoch.
///
/// The model lives on the first of `devices`; with more than one, every training batch is
/// sharded across all of them.
pub fn run<B: AutodiffBackend>(config: RunConfig, devices: &[B::Device]) -> Result<RunSummary> {
    let device = devices
        .first()
        .ok_or_else(|| anyhow!("at least one device is required"))?;
    let mut ctx = RunContext::new(config)?;
    let run_dir = ctx.run_dir();
    let config_path = run_dir.join("config.json");
    let current = serde_json::to_value(&ctx.config)?;
    if let Some(previous) = load_json::<serde_json::Value>(&config_path)? {
        if previous != current {
            warn!(
                path = %config_path.display(),
                "run directory holds a different configuration; overwriting"
            );
        }
    }
    save_json(&config_path, &current)?;

    let config = ctx.config.clone();
    let norm = config.dataset.normalization();
    let train_set = CifarDataset::open(config.dataset, Split::Train, &config.data_dir, true)
        .context("failed to load training split")?;
    let val_set = CifarDataset::open(config.dataset, Split::Test, &config.data_dir, true)
        .context("failed to load validation split")?;

    let train_pipeline = Pipeline::train(config.augment.standard, config.augment.cutout, norm);
    let notebook = RunNotebook::open(&run_dir)?;
    notebook.write_setup(&config, &ctx.schedule, &train_set, &train_pipeline)?;

    let train_loader = BatchLoader::new(
        train_set,
        train_pipeline,
        config.batch_size,
        true,
        config.workers,
        config.seed,
    );
    let val_loader = BatchLoader::new(
        val_set,
        Pipeline::eval(norm),
        config.batch_size,
        config.shuffle_val,
        config.workers,
        config.seed,
    );

    let mut model = config.model.init::<B>(device);
    println!("Number of model parameters: {}", model.num_params());
    info!(devices = devices.len(), primary = ?device, "initialized model");
    if devices.len() > 1 {
        info!(devices = ?devices, "data parallel training");
    }

    if let Some(resume) = &config.resume {
        match resolve_resume(resume) {
            Some(path) => {
                println!("=> loading checkpoint {}", path.display());
                let record = load_checkpoint::<B>(&path, device)?;
                let epoch = record.epoch;
                ctx.start_epoch = epoch;
                ctx.best = BestAccuracy::new(record.best_prec1);
                model = model.load_record(record.model);
                println!("=> loaded checkpoint '{}' (epoch {epoch})", path.display());
            }
            None => {
                println!("=> no checkpoint found at {}", resume.display());
                warn!(path = %resume.display(), "resume checkpoint not found; starting fresh");
            }
        }
    }

    let mut optimizer = SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(config.optimizer.momentum)
                .with_dampening(0.0)
                .with_nesterov(config.optimizer.nesterov),
        ))
        .with_weight_decay(Some(WeightDecayConfig::new(
            config.optimizer.weight_decay as f32,
        )))
        .init::<B, WideResNet<B>>();

    for epoch in ctx.start_epoch..config.epochs {
        let lr = ctx.schedule.lr(epoch + 1);
        ctx.log_value("learning_rate", lr, epoch + 1)?;

        let (trained, train) = train_epoch(
            model,
            &mut optimizer,
            &train_loader,
            lr,
            epoch,
            config.print_freq,
            devices,
        )?;
        model = trained;
        ctx.log_value("train_loss", train.loss, epoch)?;
        ctx.log_value("train_acc", train.accuracy, epoch)?;

        let validation = validate(&model.valid(), &val_loader, config.print_freq, device)?;
        ctx.log_value("val_loss", validation.loss, epoch)?;
        ctx.log_value("val_acc", validation.accuracy, epoch)?;

        let is_best = ctx.best.observe(validation.accuracy);
        save_checkpoint(
            &run_dir,
            CheckpointRecord::new(epoch + 1, ctx.best.value(), &model),
            is_best,
        )?;

        ctx.history.push(EpochMetrics {
            epoch: epoch + 1,
            learning_rate: lr,
            train,
            validation,
            best_accuracy: ctx.best.value(),
        });
        notebook.write_history(&ctx.history)?;
    }

    println!("Best accuracy: {}", ctx.best.value());
    info!(best = ctx.best.value(), run_dir = %run_dir.display(), "training finished");

    Ok(RunSummary {
        best_accuracy: ctx.best.value(),
        history: ctx.history,
        run_dir,
    })
}

/// One optimization pass over the training split.
pub fn train_epoch<B, O>(
    mut model: WideResNet<B>,
    optimizer: &mut O,
    loader: &BatchLoader,
    lr: f64,
    epoch: usize,
    print_freq: usize,
    devices: &[B::Device],
) -> Result<(WideResNet<B>, EvaluationMetrics)>
where
    B: AutodiffBackend,
    O: Optimizer<WideResNet<B>, B>,
{
    let primary = devices
        .first()
        .ok_or_else(|| anyhow!("at least one device is required"))?;
    let loss_fn = CrossEntropyLossConfig::new().init(primary);
    let mut batch_time = AverageMeter::new();
    let mut losses = AverageMeter::new();
    let mut top1 = AverageMeter::new();
    let total = loader.len();

    let mut end = Instant::now();
    for (i, batch) in loader.epoch(epoch).enumerate() {
        if batch.is_empty() {
            continue;
        }
        let n = batch.len();
        let (trained, step) = train_step(model, optimizer, &loss_fn, batch, lr, devices)?;
        model = trained;
        losses.update(step.loss, n);
        top1.update(step.prec1, n);

        batch_time.update(end.elapsed().as_secs_f64(), 1);
        end = Instant::now();

        if i % print_freq == 0 {
            println!(
                "Epoch: [{epoch}][{i}/{total}]\tTime {:.3} ({:.3})\tLoss {:.4} ({:.4})\tPrec@1 {:.3} ({:.3})",
                batch_time.val(),
                batch_time.avg(),
                losses.val(),
                losses.avg(),
                top1.val(),
                top1.avg(),
            );
        }
    }

    Ok((
        model,
        EvaluationMetrics {
            loss: losses.avg(),
            accuracy: top1.avg(),
        },
    ))
}

/// Batch-mean loss and Prec@1 of one optimization step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepOutput {
    pub loss: f64,
    pub prec1: f64,
}

/// One SGD step on `batch`.
///
/// The batch is split into one contiguous shard per device. Each replica back-propagates its
/// shard's loss scaled by the shard's share of the batch, so the gradients summed on the first
/// device equal the gradient of the whole-batch mean loss.
pub fn train_step<B, O>(
    model: WideResNet<B>,
    optimizer: &mut O,
    loss_fn: &CrossEntropyLoss<B>,
    batch: HostBatch,
    lr: f64,
    devices: &[B::Device],
) -> Result<(WideResNet<B>, StepOutput)>
where
    B: AutodiffBackend,
    O: Optimizer<WideResNet<B>, B>,
{
    let primary = devices
        .first()
        .ok_or_else(|| anyhow!("at least one device is required"))?;
    let total = batch.len() as f64;
    let mut accumulator = GradientsAccumulator::<WideResNet<B>>::new();
    let mut output = StepOutput {
        loss: 0.0,
        prec1: 0.0,
    };

    for (index, (shard, device)) in batch.split(devices.len()).into_iter().zip(devices).enumerate()
    {
        let weight = shard.len() as f64 / total;
        let targets = shard.labels.clone();
        let replica = if index == 0 {
            model.clone()
        } else {
            model.clone().fork(device)
        };
        let (images, labels) = shard.into_tensors::<B>(device);

        let scores = replica.forward(images);
        let loss = loss_fn.forward(scores.clone(), labels);
        output.loss += loss.clone().into_scalar().elem::<f64>() * weight;
        output.prec1 += batch_accuracy(scores, &targets, &[1])?[0] * weight;

        let grads = GradientsParams::from_grads(loss.mul_scalar(weight).backward(), &replica);
        let grads = if index == 0 {
            grads
        } else {
            grads.to_device(primary, &replica)
        };
        accumulator.accumulate(&model, grads);
    }

    let model = optimizer.step(lr, model, accumulator.grads());
    Ok((model, output))
}

/// Forward-only pass; call with `model.valid()` so dropout and batch statistics are frozen.
pub fn validate<B: Backend>(
    model: &WideResNet<B>,
    loader: &BatchLoader,
    print_freq: usize,
    device: &B::Device,
) -> Result<EvaluationMetrics> {
    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let mut batch_time = AverageMeter::new();
    let mut losses = AverageMeter::new();
    let mut top1 = AverageMeter::new();
    let total = loader.len();

    let mut end = Instant::now();
    for (i, batch) in loader.epoch(0).enumerate() {
        if batch.is_empty() {
            continue;
        }
        let n = batch.len();
        let targets = batch.labels.clone();
        let (images, labels) = batch.into_tensors::<B>(device);

        let output = model.forward(images);
        let loss = loss_fn.forward(output.clone(), labels);

        let prec1 = batch_accuracy(output, &targets, &[1])?[0];
        losses.update(loss.into_scalar().elem::<f64>(), n);
        top1.update(prec1, n);

        batch_time.update(end.elapsed().as_secs_f64(), 1);
        end = Instant::now();

        if i % print_freq == 0 {
            println!(
                "Test: [{i}/{total}]\tTime {:.3} ({:.3})\tLoss {:.4} ({:.4})\tPrec@1 {:.3} ({:.3})",
                batch_time.val(),
                batch_time.avg(),
                losses.val(),
                losses.avg(),
                top1.val(),
                top1.avg(),
            );
        }
    }

    println!(" * Prec@1 {:.3}", top1.avg());

    Ok(EvaluationMetrics {
        loss: losses.avg(),
        accuracy: top1.avg(),
    })
}

/// Precision@k of class scores against host-side targets.
pub fn batch_accuracy<B: Backend>(
    output: Tensor<B, 2>,
    targets: &[i64],
    topk: &[usize],
) -> Result<Vec<f64>> {
    let [_, num_classes] = output.dims();
    let scores = output
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow!("failed to read class scores: {err:?}"))?;
    Ok(accuracy(&scores, num_classes, targets, topk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_candle::{Candle, CandleDevice};

    #[test]
    fn sharded_step_matches_single_device_step() {
        type Train = burn_autodiff::Autodiff<Candle<f32, i64>>;

        let device = CandleDevice::Cpu;
        let config = crate::model::WideResNetConfig {
            depth: 10,
            num_classes: 10,
            widen_factor: 1,
            droprate: 0.0,
            use_bn: false,
            use_fixup: false,
        };
        let model = config.init::<Train>(&device);
        let batch = HostBatch {
            images: (0..5 * crate::dataset::IMAGE_BYTES)
                .map(|i| ((i % 17) as f32 - 8.0) / 8.0)
                .collect(),
            labels: vec![0, 3, 5, 9, 3],
        };
        let loss_fn = CrossEntropyLossConfig::new().init(&device);

        let mut single_opt = SgdConfig::new().init::<Train, WideResNet<Train>>();
        let (single, single_out) = train_step(
            model.clone(),
            &mut single_opt,
            &loss_fn,
            batch.clone(),
            0.01,
            &[device.clone()],
        )
        .unwrap();

        let mut sharded_opt = SgdConfig::new().init::<Train, WideResNet<Train>>();
        let (sharded, sharded_out) = train_step(
            model,
            &mut sharded_opt,
            &loss_fn,
            batch,
            0.01,
            &[device.clone(), device.clone()],
        )
        .unwrap();

        approx::assert_abs_diff_eq!(single_out.loss, sharded_out.loss, epsilon = 1e-5);
        approx::assert_abs_diff_eq!(single_out.prec1, sharded_out.prec1, epsilon = 1e-9);

        let input = Tensor::<Candle<f32, i64>, 4>::random(
            [2, 3, 32, 32],
            burn::tensor::Distribution::Default,
            &device,
        );
        let a = single.valid().forward(input.clone()).into_data().to_vec::<f32>().unwrap();
        let b = sharded.valid().forward(input).into_data().to_vec::<f32>().unwrap();
        for (x, y) in a.iter().zip(&b) {
            approx::assert_abs_diff_eq!(x, y, epsilon = 1e-4);
        }
    }

    #[test]
    fn batch_accuracy_reads_tensor_scores() {
        let device = CandleDevice::Cpu;
        let output = Tensor::<Candle<f32, i64>, 2>::from_floats(
            TensorData::new(vec![0.1f32, 0.9, 0.8, 0.2, 0.3, 0.7], [3, 2]),
            &device,
        );
        let result = batch_accuracy(output, &[1, 0, 0], &[1, 2]).unwrap();
        assert!((result[0] - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(result[1], 100.0);
    }
}
