//! Configuration for the supervisor binary.

use anyhow::Result;
use clap::Command;
use corral_util::config::{ConfigBag, ConfigBuilder, LogLevel};
use std::path::PathBuf;

#[derive(Debug)]
pub struct Config {
    /// Path of the worker executable to launch.
    pub worker_exe: PathBuf,

    /// Config document paths, passed through to every worker.
    pub config_file: String,
    pub engine_config_file: String,

    pub log_level: LogLevel,
}

impl Config {
    pub fn command() -> Command {
        ConfigBuilder::new(Command::new("corral-supervisor"), "CORRAL")
            .value(
                "worker-exe",
                None,
                "PATH",
                "Path to the worker executable.",
            )
            .common_values()
            .build()
    }

    pub fn from_bag(bag: &ConfigBag) -> Result<Self> {
        Ok(Self {
            worker_exe: bag.get_or("worker-exe", PathBuf::from("corral-worker"))?,
            config_file: bag.get("config-file")?,
            engine_config_file: bag.get("engine-config-file")?,
            log_level: bag.get_or("log-level", LogLevel::default())?,
        })
    }
}
