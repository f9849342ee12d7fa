pub mod checkpoint;
pub mod cli;
pub mod dataset;
pub mod loader;
pub mod model;
pub mod notebook;
pub mod training;
pub mod transform;

use burn_autodiff::Autodiff;
use burn_candle::{Candle, CandleDevice};

pub use checkpoint::{BestAccuracy, CheckpointRecord};
pub use cli::{RunConfig, TrainArgs};
pub use dataset::{CifarDataset, CifarVariant};
pub use model::{WideResNet, WideResNetConfig};
pub use training::{run, RunSummary};

pub type InnerBackend = Candle<f32, i64>;
pub type TrainingBackend = Autodiff<InnerBackend>;

/// Devices to train on: every visible CUDA device under the `cuda` feature, otherwise the CPU.
pub fn select_devices() -> Vec<CandleDevice> {
    #[cfg(feature = "cuda")]
    {
        let count = cuda_device_count();
        if count > 0 {
            return (0..count).map(CandleDevice::cuda).collect();
        }
        tracing::warn!("no CUDA device found; training on the CPU");
    }
    vec![CandleDevice::Cpu]
}

#[cfg(feature = "cuda")]
const MAX_CUDA_DEVICES: usize = 16;

#[cfg(feature = "cuda")]
fn cuda_device_count() -> usize {
    (0..MAX_CUDA_DEVICES)
        .take_while(|&ordinal| candle_core::Device::new_cuda(ordinal).is_ok())
        .count()
}
