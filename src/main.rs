//! Reorder Proxy Command Line Tool
//!
//! This binary is the command-line interface for Reorder Proxy.

use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;

use reorder_proxy::common::{init_logger, Result};
use reorder_proxy::config::{auto_load_with_warnings, ConfigOverrides};
use reorder_proxy::proxy::{ProxyHandle, ReorderProxy};
use reorder_proxy::{APP_NAME, VERSION};

/// Reorder Proxy: frame-reordering TCP relay for protocol robustness tests
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Load configuration from a JSON file
    #[clap(long)]
    config_file: Option<PathBuf>,

    /// Host to listen on
    #[clap(long)]
    local_host: Option<String>,

    /// Port to listen on
    #[clap(long)]
    local_port: Option<u16>,

    /// Host of the real server
    #[clap(long)]
    upstream_host: Option<String>,

    /// Port of the real server
    #[clap(long)]
    upstream_port: Option<u16>,

    /// Upstream connection timeout in seconds
    #[clap(long)]
    connection_timeout: Option<u64>,

    /// Reverse frames in blocks of this size
    #[clap(long)]
    window_size: Option<usize>,

    /// Explicit per-block permutation, e.g. "2,0,1" (overrides --window-size)
    #[clap(long, value_delimiter = ',')]
    swap_pattern: Option<Vec<usize>>,

    /// Frames held per direction before reading stalls
    #[clap(long)]
    buffer_capacity: Option<usize>,

    /// Maximum bytes held while waiting for a frame boundary
    #[clap(long)]
    max_frame_size: Option<usize>,

    /// Frame delimiter; \n, \r, \t, \0 and \\ escapes are understood
    #[clap(long)]
    delimiter: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[clap(long)]
    log_level: Option<String>,
}

impl Args {
    /// Command line values that override file and environment settings
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            local_host: self.local_host.clone(),
            local_port: self.local_port,
            upstream_host: self.upstream_host.clone(),
            upstream_port: self.upstream_port,
            window_size: self.window_size,
            swap_pattern: self.swap_pattern.clone(),
            buffer_capacity: self.buffer_capacity,
            max_frame_size: self.max_frame_size,
            delimiter: self.delimiter.clone(),
            connection_timeout: self.connection_timeout,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration: defaults < file < environment < command line
    let (config, warnings) =
        auto_load_with_warnings(args.config_file.as_deref(), args.overrides())?;

    // The log level comes from the configuration, so its warnings wait for the logger
    init_logger(&config.log_level);
    info!("Starting {} v{}", APP_NAME, VERSION);
    for warning in &warnings {
        warn!("{}", warning);
    }
    config.log();

    let handle = ReorderProxy::bind(config)?.start();
    info!("Proxy service ready on {}, press Ctrl+C to stop", handle.local_addr());

    run_until_interrupted(&handle).await?;

    handle.stop().await?;
    info!("{} stopped", APP_NAME);
    Ok(())
}

/// Serve until Ctrl+C, releasing a reorder round on every SIGUSR1
#[cfg(unix)]
async fn run_until_interrupted(handle: &ProxyHandle) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut reorder_signal = signal(SignalKind::user_defined1())?;
    info!("Send SIGUSR1 to release buffered frames");

    loop {
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => {
                interrupted?;
                info!("Received Ctrl+C, shutting down");
                return Ok(());
            }
            _ = reorder_signal.recv() => {
                match handle.trigger_reorder().await {
                    Ok(round) => info!(
                        "SIGUSR1: released {} frames on {} connections",
                        round.total_frames(),
                        round.connections
                    ),
                    Err(e) => warn!("SIGUSR1: reorder round failed: {}", e),
                }
            }
        }
    }
}

/// Serve until Ctrl+C
#[cfg(not(unix))]
async fn run_until_interrupted(_handle: &ProxyHandle) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    Ok(())
}
