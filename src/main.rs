mod configs;
mod files;
mod process;
mod protocol;
mod restart;
mod service;
mod signals;
mod supervisor;
mod tick;

use crate::configs::{LogConfig, Properties, SupervisorConfig};
use crate::process::TokioProcessController;
use crate::protocol::ControlChannel;
use crate::service::NoopHost;
use crate::supervisor::{Parts, Supervisor};
use crate::tick::{Clock, SystemClock, TimerClock};
use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Deserialize, Serialize)]
#[command(version, about)]
struct Args {
    /// Configuration file
    #[arg(
        short,
        long,
        env = "WARDEN_CONFIG",
        value_name = "FILE",
        default_value = "/etc/warden/warden.yml"
    )]
    config: PathBuf,

    /// Run as a service. Selects the service startup delay and allows pausing.
    #[arg(long)]
    service: bool,

    /// Override a property, e.g. `-D ping.timeout=60`
    #[arg(short = 'D', long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let mut properties = Properties::load(&args.config).wrap_err("Failed to read config")?;
    properties
        .apply_overrides(&args.overrides)
        .wrap_err("Invalid override")?;

    if std::env::var("WARDEN_LOG").is_err() {
        std::env::set_var("WARDEN_LOG", LogConfig::level_of(&properties));
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("WARDEN_LOG"))
        .init();

    let config = SupervisorConfig::from_properties(&properties).wrap_err("Invalid config!")?;

    info!(config = %args.config.display(), properties = properties.len(), "Configuration loaded");
    debug!("{:#?}", config);

    let clock: Arc<dyn Clock> = if config.timer.use_system_time {
        Arc::new(SystemClock)
    } else {
        Arc::new(TimerClock::start(&config.timer)?)
    };
    let (requests, receiver) = mpsc::channel(signals::REQUEST_QUEUE);
    signals::install(requests)?;

    let parts = Parts {
        clock,
        process: TokioProcessController::default(),
        channel: ControlChannel::new(config.control.clone()),
        host: Box::new(NoopHost),
    };
    let exit_code = Supervisor::new(config, properties, parts, receiver, args.service)
        .run()
        .await;
    std::process::exit(exit_code);
}
