//! Configuration for the front-end binary.

use anyhow::Result;
use clap::Command;
use corral_util::config::{BrokerAddr, ConfigBag, ConfigBuilder, LogLevel};
use std::{net::SocketAddr, path::PathBuf};

#[derive(Debug)]
pub struct Config {
    /// Address to serve HTTP on.
    pub listen: SocketAddr,

    /// Root of the per-job artifact directories.
    pub store: PathBuf,

    /// Path of the SQLite job index. Kept outside the store so the static
    /// file surface can't serve it.
    pub index: PathBuf,

    /// Address of the broker.
    pub broker: BrokerAddr,

    pub log_level: LogLevel,
}

impl Config {
    pub fn command() -> Command {
        ConfigBuilder::new(Command::new("corral-frontend"), "CORRAL")
            .value("listen", None, "ADDR", "Address to serve HTTP on.")
            .value("store", None, "PATH", "Location to store job files.")
            .value("index", None, "PATH", "Path of the SQLite job index.")
            .value("broker", Some('b'), "ADDR", "Address of the broker.")
            .common_values()
            .build()
    }

    pub fn from_bag(bag: &ConfigBag) -> Result<Self> {
        Ok(Self {
            listen: bag.get_or("listen", "127.0.0.1:8080".parse()?)?,
            store: bag.get_or("store", PathBuf::from("store"))?,
            index: bag.get_or("index", PathBuf::from("corral-jobs.db"))?,
            broker: bag.get_or("broker", "127.0.0.1:5672".parse()?)?,
            log_level: bag.get_or("log-level", LogLevel::default())?,
        })
    }
}
