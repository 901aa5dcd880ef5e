use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use streamgate::{http_api, janitor, logging};
use streamgate_core::{Acquirer, Config, EngineConfig, HlsPackager, LibrqbitEngine, PathService, Registry, StreamCoordinator};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// On-demand BitTorrent-to-HLS streaming gateway.
#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// The console log level.
    #[arg(value_enum, short = 'v', long = "log-level", env = "STREAMGATE_LOG_LEVEL_CONSOLE")]
    log_level: Option<LogLevel>,

    /// The log filename to also write to in addition to the console.
    #[arg(long = "log-file", env = "STREAMGATE_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Emit structured JSON logs instead of plaintext.
    #[arg(long = "log-json", env = "STREAMGATE_LOG_JSON")]
    log_json: bool,

    /// The HTTP listen address. Overrides PORT/the compiled default.
    #[arg(long = "http-addr", env = "STREAMGATE_HTTP_ADDR")]
    http_addr: Option<SocketAddr>,

    /// Root directory for per-stream working files (`streams/`, `hls/`).
    #[arg(long = "temp-root", env = "TEMP_ROOT")]
    temp_root: Option<PathBuf>,

    /// Maximum number of streams admitted concurrently.
    #[arg(long = "max-concurrent-streams", env = "MAX_CONCURRENT_STREAMS")]
    max_concurrent_streams: Option<usize>,

    /// Path to the ffmpeg binary.
    #[arg(long = "ffmpeg-path", env = "FFMPEG_PATH")]
    ffmpeg_path: Option<PathBuf>,

    /// How many worker threads the tokio runtime should spawn.
    #[arg(short = 't', long, env = "STREAMGATE_RUNTIME_WORKER_THREADS")]
    worker_threads: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let mut rt_builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(n) = opts.worker_threads {
        rt_builder.worker_threads(n);
    }
    let rt = rt_builder.enable_all().build()?;

    let cancel = CancellationToken::new();
    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        rt.spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error=%e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            warn!("received shutdown signal, cancelling");
            cancel.cancel();
        });
    }

    let result = rt.block_on(async_main(opts, cancel));
    if let Err(e) = &result {
        error!("fatal error: {e:#}");
    }
    rt.shutdown_timeout(Duration::from_secs(1));
    match result {
        Ok(()) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn async_main(opts: Opts, cancel: CancellationToken) -> anyhow::Result<()> {
    let default_log = match opts.log_level.unwrap_or(LogLevel::Info) {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };
    logging::init_logging(default_log, opts.log_file.as_deref(), opts.log_json)?;

    let mut config = Config::from_env();
    if let Some(addr) = opts.http_addr {
        config.http_addr = addr;
    }
    if let Some(root) = opts.temp_root {
        config.temp_root = root;
    }
    if let Some(n) = opts.max_concurrent_streams {
        config.max_concurrent_streams = n;
    }
    if let Some(path) = opts.ffmpeg_path {
        config.ffmpeg_path = path;
    }
    let config = Arc::new(config);

    info!(addr=%config.http_addr, temp_root=?config.temp_root, max_concurrent_streams=config.max_concurrent_streams, "starting streamgate");

    let paths = Arc::new(PathService::new(config.temp_root.clone()));
    let registry = Arc::new(Registry::new());

    let engine_config = EngineConfig {
        peer_connection_limit: config.profile.peer_connection_limit(),
        ..EngineConfig::default()
    };
    let engine = Arc::new(
        LibrqbitEngine::new(config.temp_root.join("streams"), engine_config)
            .await
            .map_err(|e| anyhow::anyhow!("failed to start torrent engine: {e:#}"))?,
    );
    let acquirer = Arc::new(Acquirer::new(engine, registry.clone(), config.watchdog_tick));
    let packager = Arc::new(HlsPackager::new(config.ffmpeg_path.clone(), registry.clone()));

    let coordinator = StreamCoordinator::new(paths, registry, acquirer, packager, config.clone());

    let janitor_handle = tokio::spawn(janitor::run(
        coordinator.clone(),
        config.janitor_interval,
        config.janitor_max_age,
    ));

    let app = http_api::router(coordinator.clone());
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!(addr=%config.http_addr, "listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = cancel.cancelled() => {
            info!("shutting down gracefully");
        }
    }

    janitor_handle.abort();
    Ok(())
}
