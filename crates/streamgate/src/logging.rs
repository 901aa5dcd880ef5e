use std::path::Path;

use anyhow::Context;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initializes stdout (and optional file) logging. A simplified version of the teacher's
/// logging setup: no live-log broadcast layer and no dynamic `RUST_LOG` reload, since nothing
/// here streams logs over HTTP.
pub fn init_logging(default_rust_log: &str, log_file: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let stdout_filter = EnvFilter::builder()
        .with_default_directive(default_rust_log.parse().context("invalid default log directive")?)
        .from_env()
        .context("invalid RUST_LOG value")?;

    let stdout_layer: Box<dyn tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync> =
        if json {
            Box::new(fmt::layer().json())
        } else {
            Box::new(fmt::layer())
        };

    let registry = tracing_subscriber::registry().with(stdout_layer.with_filter(stdout_filter));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("error opening log file {path:?}"))?;
            let file_filter = EnvFilter::builder()
                .with_default_directive(default_rust_log.parse().unwrap())
                .from_env()
                .context("invalid RUST_LOG value")?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)).with_filter(file_filter))
                .try_init()
                .context("can't init logging to file")?;
        }
        None => {
            registry.try_init().context("can't init logging")?;
        }
    }

    Ok(())
}
