use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Read candump traffic, aggregate the pack state and publish it on every tick
    Run {
        /// Output destination for the pack state
        #[command(subcommand)]
        output: DaemonOutput,
        /// candump -L log to read, "-" for standard input
        #[arg(short, long, default_value = "-")]
        input: PathBuf,
        /// Replay a recorded log at its original pace instead of as fast as possible
        #[arg(long, action)]
        realtime: bool,
    },
    /// Print every decoded frame of a candump -L log
    Decode {
        /// candump -L log to read, "-" for standard input
        #[arg(short, long, default_value = "-")]
        input: PathBuf,
    },
    /// Print synthetic candump -L traffic for the configured pack
    Simulate {
        /// Number of transmit cycles, runs until interrupted when omitted
        #[arg(long)]
        ticks: Option<u64>,
        /// Time between transmit cycles (e.g., "1s", "250ms")
        #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
        period: Duration,
        /// CAN interface name written into the log lines
        #[arg(long, default_value = "can0")]
        interface: String,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Print the pack state to the standard output (console).
    Console,
    /// Publish the pack state to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value = mqtt::MqttConfig::DEFAULT_CONFIG_FILE)]
        config_file: PathBuf,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "Valence U-BMS CAN bridge"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Pack configuration (YAML); the 4s4p reference pack when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommands,
}
