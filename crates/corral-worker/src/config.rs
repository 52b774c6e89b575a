//! Configuration for the worker binary.

use anyhow::Result;
use clap::Command;
use corral_util::config::{BrokerAddr, ConfigBag, ConfigBuilder, LogLevel};
use std::path::PathBuf;

#[derive(Debug)]
pub struct Config {
    /// Name of the engine this worker consumes. Required.
    pub engine: String,

    /// Index for tagging when several workers serve one engine.
    pub index: u32,

    /// Exit cleanly after this many deliveries. Zero means no limit.
    pub job_limit: u32,

    /// Address of the broker.
    pub broker: BrokerAddr,

    /// `host:port` of the front-end, used for input fetches and result
    /// PUTs.
    pub frontend: String,

    /// Host directory the per-task work dirs are created under.
    pub jobs_dir: PathBuf,

    /// Directory container output captures are written to.
    pub log_dir: PathBuf,

    /// Where to write stats snapshots. None disables them.
    pub mule_dir: Option<PathBuf>,

    pub mule_prefix: String,

    pub log_level: LogLevel,
}

impl Config {
    pub fn command() -> Command {
        ConfigBuilder::new(Command::new("corral-worker"), "CORRAL")
            .value("engine", None, "NAME", "Engine whose queue this worker consumes.")
            .value("index", Some('i'), "N", "Worker index for tagging.")
            .value(
                "job-limit",
                None,
                "N",
                "Exit after this many deliveries (0 for no limit).",
            )
            .value("broker", Some('b'), "ADDR", "Address of the broker.")
            .value("frontend", None, "ADDR", "host:port of the front-end.")
            .value("jobs-dir", None, "PATH", "Host directory for per-task work dirs.")
            .value("log-dir", None, "PATH", "Directory for container output captures.")
            .common_values()
            .build()
    }

    pub fn from_bag(bag: &ConfigBag) -> Result<Self> {
        Ok(Self {
            engine: bag.get("engine")?,
            index: bag.get_or("index", 0)?,
            job_limit: bag.get_or("job-limit", 0)?,
            broker: bag.get_or("broker", "127.0.0.1:5672".parse()?)?,
            frontend: bag.get_or("frontend", "127.0.0.1:8080".to_string())?,
            jobs_dir: bag.get_or("jobs-dir", PathBuf::from("corral-jobs"))?,
            log_dir: bag.get_or("log-dir", PathBuf::from("log"))?,
            mule_dir: bag.get_option("mule-dir")?,
            mule_prefix: bag.get_or("mule-prefix", String::new())?,
            log_level: bag.get_or("log-level", LogLevel::default())?,
        })
    }
}
