use clap::{ArgGroup, Parser};
use std::path::PathBuf;

use crate::mqtt::config::Broker;

const PRODUCTION_BROKER: (&str, u16) = ("192.168.1.250", 1883);
const DEVELOPMENT_BROKER: (&str, u16) = ("192.168.1.249", 1883);

/// Forward irrigation controller telemetry to a Blynk dashboard
#[derive(Parser, Debug)]
#[command(name = "blynk-bridge", version, about)]
#[command(group(
    ArgGroup::new("endpoint")
        .required(true)
        .args(["production", "development"])
))]
pub struct Cli {
    /// Read telemetry from the production broker
    #[arg(short = 'P', long)]
    pub production: bool,

    /// Read telemetry from the development broker
    #[arg(short = 'D', long)]
    pub development: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Config file (defaults to the user config directory)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Exit with an error when the ingest connection drops instead of reconnecting
    #[arg(long)]
    pub exit_on_ingest_loss: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Production,
    Development,
}

impl Endpoint {
    pub fn broker(self) -> Broker {
        let (host, port) = match self {
            Endpoint::Production => PRODUCTION_BROKER,
            Endpoint::Development => DEVELOPMENT_BROKER,
        };
        Broker::new(host, port)
    }
}

impl Cli {
    pub fn endpoint(&self) -> Endpoint {
        if self.production {
            Endpoint::Production
        } else {
            Endpoint::Development
        }
    }
}
