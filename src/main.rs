use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic, path::Path, time::Duration};
use ubms_lib::{Bridge, BridgeConfig};

mod commandline;
mod daemon;
mod mqtt;
mod simulate;

use commandline::{CliArgs, CliCommands};

/// Blocking stdin readers may still be parked when the bridge stops.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(200);

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .log_to_stderr()
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn load_bridge_config(path: Option<&Path>) -> Result<BridgeConfig> {
    let Some(path) = path else {
        info!("No configuration given, using the 4s4p reference pack");
        return Ok(BridgeConfig::reference()?);
    };
    debug!("Loading bridge config from {path:?}");
    let file = std::fs::File::open(path)
        .with_context(|| format!("Cannot open bridge config file {path:?}"))?;
    let config: BridgeConfig = serde_yaml::from_reader(&file)
        .with_context(|| format!("Cannot read bridge config from file: {path:?}"))?;
    config
        .validate()
        .with_context(|| format!("Invalid bridge config in {path:?}"))?;
    Ok(config)
}

fn tokio_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Cannot start async runtime")
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = load_bridge_config(args.config.as_deref())?;

    match args.command {
        CliCommands::Run {
            output,
            input,
            realtime,
        } => {
            let bridge = Bridge::new(config).context("Cannot create bridge")?;
            let runtime = tokio_runtime()?;
            let result = runtime.block_on(daemon::run(bridge, output, input, realtime));
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
            result?;
        }
        CliCommands::Decode { input } => {
            let runtime = tokio_runtime()?;
            let result = runtime.block_on(daemon::decode(input));
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
            result?;
        }
        CliCommands::Simulate {
            ticks,
            period,
            interface,
        } => simulate::run(config.topology, ticks, period, &interface)?,
    }

    Ok(())
}
