//! serial-fanout: transparent TCP fan-out proxy
//!
//! Main entry point.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default options file (/data/options.json) and environment
//! UPSTREAM_HOST=192.168.1.50 ./serial-fanout
//!
//! # Run with a custom options file
//! ./serial-fanout -c /etc/serial-fanout/options.json
//!
//! # Validate configuration and exit
//! ./serial-fanout -c options.json --check
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use serial_fanout::config;
use serial_fanout::control::ControlSurface;
use serial_fanout::engine::ProxyEngine;
use serial_fanout::logging::Logger;

/// Command-line arguments
struct Args {
    /// Options file path; defaults to /data/options.json
    config_path: Option<PathBuf>,
    /// Generate a default options file
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = None;
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = Some(PathBuf::from(path));
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("serial-fanout v{}", serial_fanout::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r"serial-fanout v{}

Transparent TCP fan-out proxy for shared serial-to-TCP bridges.

USAGE:
    serial-fanout [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Options file path [default: {}]
    -g, --generate-config   Generate a default options file and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    UPSTREAM_HOST      Host of the remote serial bridge (required)
    UPSTREAM_PORT      Port of the remote serial bridge [default: 8899]
    LISTEN_PORT        Local accept port [default: 18899]
    MAX_CLIENTS        Cap on concurrent clients [default: 10]
    LOG_PACKETS        Hex-log proxied bytes (true/false) [default: false]
    LOG_FILE           Packet log file [default: /data/packets.log]
    WEB_PORT           Control-plane port [default: 18080]
    RECONNECT_DELAY    Initial reconnect backoff in seconds [default: 1]
    RUST_LOG           Diagnostic trace filter (e.g. serial_fanout=debug)
",
        serial_fanout::VERSION,
        config::DEFAULT_OPTIONS_FILE,
    );
}

/// Initialize diagnostic tracing
///
/// Operator-facing lines go through the proxy's own event logger; tracing
/// carries developer diagnostics and stays quiet unless `RUST_LOG` says
/// otherwise.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let path = args
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("options.json"));
        config::create_default_config(&path)?;
        println!("Generated default configuration at {path:?}");
        return Ok(());
    }

    let config = match config::load(args.config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_tracing();
    debug!("configuration loaded: upstream={}", config.upstream_addr());

    let logger = Logger::new(config.log_packets, Some(config.log_file.as_str()));
    logger.info(format!("serial-fanout v{} starting", serial_fanout::VERSION));
    logger.info(format!(
        "Upstream {} | listen {} | max clients {}",
        config.upstream_addr(),
        config.listen_addr(),
        config.max_clients
    ));

    let engine = ProxyEngine::new(config, logger);
    let _control: Arc<ControlSurface> = ControlSurface::new(Arc::clone(&engine));

    if let Err(e) = engine.start().await {
        eprintln!("Startup failed: {e}");
        std::process::exit(1);
    }

    tokio::select! {
        _ = signal::ctrl_c() => {
            engine.logger().info("Received SIGINT, shutting down");
        }
        () = wait_for_sigterm() => {
            engine.logger().info("Received SIGTERM, shutting down");
        }
    }

    engine.stop().await;

    Ok(())
}

/// Wait for SIGTERM
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            std::future::pending::<()>().await;
            return;
        }
    };
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
