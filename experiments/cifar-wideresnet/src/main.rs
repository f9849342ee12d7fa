use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use wrn_cifar::{run, select_devices, TrainArgs, TrainingBackend};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = TrainArgs::parse().into_config()?;
    let devices = select_devices();
    run::<TrainingBackend>(config, &devices)?;
    Ok(())
}
