// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

mod actions;
mod client;
mod command;
mod config;
mod controller;
mod conversions;
mod daemon;
mod device_monitor;
mod drivers;
mod errors;
mod lock;
mod logger;
mod mapper;
mod poller;
mod profile;
mod scheduler;
mod transport;
mod virtual_device;

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Parser)]
#[command(name = "sccd")]
#[command(about = "The SC Controller daemon", long_about = None)]
struct Cli {
    /// Print the version.
    #[arg(short, long)]
    version: bool,
    /// The configuration directory. Defaults to ~/.config/scc.
    #[arg(short = 'C', long, value_name = "DIR")]
    config_dir: Option<PathBuf>,
    /// Profile to load instead of the most recently used one.
    #[arg(value_name = "PROFILE")]
    profile: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    if args.version {
        println!("sccd {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let sink = logger::new_sink();
    init_logging(sink.clone())?;

    debug!("starting up");

    let config_dir = args
        .config_dir
        .or_else(|| dirs::config_dir().map(|d| d.join("scc")))
        .context("cannot determine the config directory")?;
    let cfg = config::Config::load(&config_dir).context("failed to read config")?;

    // "Desktop.sccprofile" and "Desktop" mean the same profile.
    let profile = args
        .profile
        .map(|p| p.trim_end_matches(".sccprofile").to_owned());

    let socket_path = cfg.socket_path();
    let mut daemon =
        daemon::Daemon::new(cfg, sink, profile).context("failed to start daemon")?;

    let (stop, waker) = daemon.stopper()?;
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
            waker.wake().ok();
        })?;
    }

    info!("listening on {}", socket_path.display());
    daemon.run(stop).context("daemon exited")?;

    Ok(())
}

fn init_logging(sink: logger::LogSink) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let printed_log = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive("sccd=info".parse()?)
            .from_env_lossy(),
    );

    tracing_subscriber::registry()
        .with(logger::CaptureLayer::new(sink))
        .with(printed_log)
        .init();

    Ok(())
}
