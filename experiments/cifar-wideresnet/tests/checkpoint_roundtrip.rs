use burn::{
    module::Module,
    tensor::{Distribution, Tensor},
};
use burn_candle::CandleDevice;
use wrn_cifar::{
    checkpoint::{load_checkpoint, resolve_resume, save_checkpoint, BEST_FILE, CHECKPOINT_FILE},
    CheckpointRecord, InnerBackend, WideResNetConfig,
};

fn small_config() -> WideResNetConfig {
    WideResNetConfig {
        depth: 10,
        num_classes: 10,
        widen_factor: 1,
        droprate: 0.0,
        use_bn: true,
        use_fixup: false,
    }
}

#[test]
fn restores_counters_and_identical_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let device = CandleDevice::Cpu;
    let config = small_config();
    let model = config.init::<InnerBackend>(&device);

    let path = save_checkpoint(dir.path(), CheckpointRecord::new(7, 63.5, &model), false).unwrap();
    assert_eq!(path, dir.path().join(CHECKPOINT_FILE));
    assert!(path.is_file());

    let record = load_checkpoint::<InnerBackend>(&path, &device).unwrap();
    assert_eq!(record.epoch, 7);
    assert_eq!(record.best_prec1, 63.5);

    let restored = config.init::<InnerBackend>(&device).load_record(record.model);
    let input = Tensor::<InnerBackend, 4>::random([2, 3, 32, 32], Distribution::Default, &device);

    let expected = model.forward(input.clone()).into_data().to_vec::<f32>().unwrap();
    let actual = restored.forward(input).into_data().to_vec::<f32>().unwrap();
    assert_eq!(expected.len(), actual.len());
    for (a, b) in expected.iter().zip(&actual) {
        approx::assert_abs_diff_eq!(a, b, epsilon = 1e-6);
    }
}

#[test]
fn best_copy_only_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let device = CandleDevice::Cpu;
    let model = small_config().init::<InnerBackend>(&device);

    save_checkpoint(dir.path(), CheckpointRecord::new(1, 10.0, &model), false).unwrap();
    assert!(!dir.path().join(BEST_FILE).exists());

    save_checkpoint(dir.path(), CheckpointRecord::new(2, 20.0, &model), true).unwrap();
    let best = load_checkpoint::<InnerBackend>(&dir.path().join(BEST_FILE), &device).unwrap();
    assert_eq!(best.epoch, 2);

    // A later non-improving epoch leaves the best snapshot alone.
    save_checkpoint(dir.path(), CheckpointRecord::new(3, 20.0, &model), false).unwrap();
    let best = load_checkpoint::<InnerBackend>(&dir.path().join(BEST_FILE), &device).unwrap();
    assert_eq!(best.epoch, 2);
    let latest =
        load_checkpoint::<InnerBackend>(&dir.path().join(CHECKPOINT_FILE), &device).unwrap();
    assert_eq!(latest.epoch, 3);
}

#[test]
fn missing_checkpoint_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let device = CandleDevice::Cpu;
    assert!(load_checkpoint::<InnerBackend>(&dir.path().join("absent.bin"), &device).is_err());
}

#[test]
fn resumes_from_a_checkpoint_with_another_extension() {
    let dir = tempfile::tempdir().unwrap();
    let device = CandleDevice::Cpu;
    let model = small_config().init::<InnerBackend>(&device);

    let saved = save_checkpoint(dir.path(), CheckpointRecord::new(4, 41.0, &model), false).unwrap();
    let renamed = dir.path().join("epoch4.pth");
    std::fs::rename(&saved, &renamed).unwrap();

    // A different snapshot under the `.bin` sibling name must not be picked up instead.
    save_checkpoint(dir.path(), CheckpointRecord::new(9, 90.0, &model), false).unwrap();
    std::fs::rename(dir.path().join(CHECKPOINT_FILE), dir.path().join("epoch4.bin")).unwrap();

    let resolved = resolve_resume(&renamed).unwrap();
    assert_eq!(resolved, renamed);
    let record = load_checkpoint::<InnerBackend>(&resolved, &device).unwrap();
    assert_eq!(record.epoch, 4);
    assert_eq!(record.best_prec1, 41.0);
}
