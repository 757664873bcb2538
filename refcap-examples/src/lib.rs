pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod optim;

use candle::{Device, Result};

pub const DEFAULT_TOKENIZER_REPO: &str = "bert-base-uncased";

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else {
        let device = Device::cuda_if_available(0)?;
        if !device.is_cuda() {
            tracing::info!("running on CPU, build with `--features cuda` to run on GPU");
        }
        Ok(device)
    }
}

/// Fetches `tokenizer.json` from a model repository of the Hugging Face hub.
pub fn hub_tokenizer(repo: &str) -> anyhow::Result<std::path::PathBuf> {
    let api = hf_hub::api::sync::Api::new()?;
    let path = api.model(repo.to_string()).get("tokenizer.json")?;
    Ok(path)
}

/// Sets up logging, optionally recording a chrome trace. The returned guard flushes the trace
/// file when dropped.
pub fn init_tracing(chrome: bool) -> Option<tracing_chrome::FlushGuard> {
    use tracing_subscriber::prelude::*;

    let fmt = tracing_subscriber::fmt::layer().with_target(false);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if chrome {
        let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new().build();
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .with(chrome_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry().with(filter).with(fmt).init();
        None
    }
}
