use std::{fs, path::Path};

use burn_candle::CandleDevice;
use clap::Parser;
use wrn_cifar::{
    checkpoint::{BEST_FILE, CHECKPOINT_FILE},
    dataset::IMAGE_BYTES,
    run, RunConfig, TrainArgs, TrainingBackend,
};
use wrn_core::read_scalars;

const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];

fn write_records(path: &Path, labels: &[u8]) {
    let mut bytes = Vec::with_capacity(labels.len() * (IMAGE_BYTES + 1));
    for (i, &label) in labels.iter().enumerate() {
        bytes.push(label);
        bytes.extend((0..IMAGE_BYTES).map(|p| ((p + 31 * i) % 256) as u8));
    }
    fs::write(path, bytes).unwrap();
}

fn synthetic_cifar10(data_dir: &Path) {
    let root = data_dir.join("cifar-10-batches-bin");
    fs::create_dir_all(&root).unwrap();
    for (i, name) in TRAIN_FILES.iter().enumerate() {
        write_records(&root.join(name), &[i as u8, (i + 5) as u8]);
    }
    write_records(&root.join("test_batch.bin"), &[0, 1, 2, 3]);
}

fn config(dir: &Path, extra: &[&str]) -> RunConfig {
    let data_dir = dir.join("data");
    let runs_dir = dir.join("runs");
    let mut args = vec![
        "wrn-train".to_string(),
        "--layers".into(),
        "10".into(),
        "--widen-factor".into(),
        "1".into(),
        "-b".into(),
        "4".into(),
        "-p".into(),
        "1".into(),
        "--workers".into(),
        "0".into(),
        "--seed".into(),
        "7".into(),
        "--name".into(),
        "smoke".into(),
        "--tensorboard".into(),
        "--data-dir".into(),
        data_dir.display().to_string(),
        "--runs-dir".into(),
        runs_dir.display().to_string(),
    ];
    args.extend(extra.iter().map(|s| s.to_string()));
    TrainArgs::try_parse_from(args).unwrap().into_config().unwrap()
}

#[test]
fn trains_checkpoints_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    synthetic_cifar10(&dir.path().join("data"));
    let devices = [CandleDevice::Cpu];

    let summary = run::<TrainingBackend>(
        config(dir.path(), &["--epochs", "2", "--cutout", "true"]),
        &devices,
    )
    .unwrap();

    assert_eq!(summary.history.len(), 2);
    assert_eq!(summary.history[0].epoch, 1);
    let max_val = summary
        .history
        .iter()
        .map(|row| row.validation.accuracy)
        .fold(0.0, f64::max);
    assert_eq!(summary.best_accuracy, max_val);
    for row in &summary.history {
        assert!((0.0..=100.0).contains(&row.validation.accuracy));
        assert!(row.train.loss.is_finite());
    }

    let run_dir = dir.path().join("runs/smoke");
    assert_eq!(summary.run_dir, run_dir);
    assert!(run_dir.join(CHECKPOINT_FILE).is_file());
    assert!(run_dir.join("config.json").is_file());
    let report = fs::read_to_string(run_dir.join("report.md")).unwrap();
    assert!(report.contains("| 2 |"));
    assert!(report.contains("data:image/png;base64,"));

    let scalars = read_scalars(&run_dir.join("scalars.jsonl")).unwrap();
    let names: Vec<&str> = scalars.iter().map(|p| p.name.as_str()).collect();
    for expected in ["learning_rate", "train_loss", "train_acc", "val_loss", "val_acc"] {
        assert_eq!(names.iter().filter(|&&n| n == expected).count(), 2);
    }

    // Resume for one more epoch from the saved state.
    let checkpoint = run_dir.join(CHECKPOINT_FILE).display().to_string();
    let resumed = run::<TrainingBackend>(
        config(dir.path(), &["--epochs", "3", "--resume", &checkpoint]),
        &devices,
    )
    .unwrap();
    assert_eq!(resumed.history.len(), 1);
    assert_eq!(resumed.history[0].epoch, 3);
    assert!(resumed.best_accuracy >= summary.best_accuracy);
}

#[test]
fn missing_resume_file_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    synthetic_cifar10(&dir.path().join("data"));
    let devices = [CandleDevice::Cpu];

    let summary = run::<TrainingBackend>(
        config(
            dir.path(),
            &["--epochs", "1", "--no-augment", "--resume", "does/not/exist.bin"],
        ),
        &devices,
    )
    .unwrap();

    assert_eq!(summary.history.len(), 1);
    assert_eq!(summary.history[0].epoch, 1);
    // The first epoch always beats the initial best of zero unless accuracy is zero.
    let best_exists = summary.run_dir.join(BEST_FILE).exists();
    assert_eq!(best_exists, summary.best_accuracy > 0.0);
}

#[test]
fn start_epoch_at_end_trains_nothing() {
    let dir = tempfile::tempdir().unwrap();
    synthetic_cifar10(&dir.path().join("data"));
    let devices = [CandleDevice::Cpu];

    let summary = run::<TrainingBackend>(
        config(dir.path(), &["--epochs", "2", "--start-epoch", "2"]),
        &devices,
    )
    .unwrap();
    assert!(summary.history.is_empty());
    assert_eq!(summary.best_accuracy, 0.0);
}

#[test]
fn batches_are_sharded_across_several_devices() {
    let dir = tempfile::tempdir().unwrap();
    synthetic_cifar10(&dir.path().join("data"));
    let devices = [CandleDevice::Cpu, CandleDevice::Cpu];

    let summary = run::<TrainingBackend>(
        config(dir.path(), &["--epochs", "1", "--no-augment"]),
        &devices,
    )
    .unwrap();

    assert_eq!(summary.history.len(), 1);
    assert!(summary.history[0].train.loss.is_finite());
    assert!(summary.run_dir.join(CHECKPOINT_FILE).is_file());
}
