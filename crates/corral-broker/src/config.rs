//! Configuration for the broker binary.

use anyhow::Result;
use clap::Command;
use corral_util::config::{ConfigBag, ConfigBuilder, LogLevel};
use std::{net::SocketAddr, path::PathBuf};

#[derive(Debug)]
pub struct Config {
    /// Address the broker listens on for publishers and consumers.
    pub listen: SocketAddr,

    /// Directory holding the per-queue journals.
    pub state_dir: PathBuf,

    pub log_level: LogLevel,
}

impl Config {
    pub fn command() -> Command {
        ConfigBuilder::new(Command::new("corral-broker"), "CORRAL")
            .value("listen", None, "ADDR", "Address to bind the broker socket to.")
            .value("state-dir", None, "PATH", "Directory holding the queue journals.")
            .common_values()
            .build()
    }

    pub fn from_bag(bag: &ConfigBag) -> Result<Self> {
        Ok(Self {
            listen: bag.get_or("listen", "127.0.0.1:5672".parse()?)?,
            state_dir: bag.get_or("state-dir", PathBuf::from("corral-state"))?,
            log_level: bag.get_or("log-level", LogLevel::default())?,
        })
    }
}
