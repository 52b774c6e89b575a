//! Configuration plumbing shared by every corral binary.
//!
//! A value can come from four places, in decreasing precedence: an explicit
//! command-line option, a `CORRAL_*` environment variable, the binary's own
//! section of the JSON config document, or that document's `all` section.
//! The engines document is a separate JSON file holding the frozen
//! [`EngineConfig`] list.

use anyhow::{anyhow, bail, Context as _, Result};
use clap::{
    parser::{MatchesError, ValueSource},
    Arg, ArgAction, ArgMatches, Command,
};
use corral_base::{EngineConfig, EngineConfigFile};
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    fmt,
    net::{SocketAddr, ToSocketAddrs as _},
    path::Path,
    result,
    str::FromStr,
};

/// Minimum level a log record must have to be emitted.
#[derive(Clone, Copy, Debug, Default, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_slog_level(&self) -> slog::Level {
        match self {
            LogLevel::Error => slog::Level::Error,
            LogLevel::Warning => slog::Level::Warning,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Debug => slog::Level::Debug,
        }
    }
}

/// Socket address of the broker, resolved at parse time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokerAddr(SocketAddr);

impl BrokerAddr {
    pub fn inner(&self) -> &SocketAddr {
        &self.0
    }
}

impl FromStr for BrokerAddr {
    type Err = std::io::Error;

    fn from_str(value: &str) -> result::Result<Self, Self::Err> {
        let addrs: Vec<SocketAddr> = value.to_socket_addrs()?.collect();
        addrs.first().copied().map(BrokerAddr).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("{value} resolved to no addresses"),
            )
        })
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for BrokerAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The merged view over command-line matches, environment, and the config
/// document's sections. Sections are consulted in the order given, so the
/// binary's own section must precede `all`.
pub struct ConfigBag {
    args: ArgMatches,
    env_prefix: &'static str,
    env: HashMap<String, String>,
    sections: Vec<(String, Map<String, Value>)>,
}

struct KeyNames {
    key: String,
    env_key: String,
    json_key: String,
}

impl ConfigBag {
    pub fn new(
        args: ArgMatches,
        env_prefix: &'static str,
        env: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
        sections: impl IntoIterator<Item = (impl Into<String>, Map<String, Value>)>,
    ) -> Self {
        Self {
            args,
            env_prefix,
            env: env.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            sections: sections
                .into_iter()
                .map(|(name, table)| (name.into(), table))
                .collect(),
        }
    }

    fn get_internal<T>(&self, key: &str) -> Result<result::Result<T, KeyNames>>
    where
        T: FromStr + DeserializeOwned,
        <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
    {
        let mut args_result = self.args.try_get_one::<String>(key);
        if let Err(MatchesError::UnknownArgument { .. }) = args_result {
            args_result = Ok(None);
        }
        let value = args_result
            .with_context(|| format!("error getting matches data for command-line option `--{key}`"))?
            .map(String::as_str)
            .map(T::from_str)
            .transpose()
            .with_context(|| format!("error parsing command-line option `--{key}`"))?;
        if let Some(value) = value {
            return Ok(Ok(value));
        }

        let env_key: String = self
            .env_prefix
            .chars()
            .chain(std::iter::once('_'))
            .chain(key.chars())
            .map(|c| match c {
                '-' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        let value = self
            .env
            .get(&env_key)
            .map(String::as_str)
            .map(T::from_str)
            .transpose()
            .with_context(|| format!("error parsing environment variable `{env_key}`"))?;
        if let Some(value) = value {
            return Ok(Ok(value));
        }

        let json_key: String = key
            .chars()
            .map(|c| match c {
                '-' => '_',
                c => c,
            })
            .collect();
        for (section, table) in &self.sections {
            if let Some(value) = table.get(&json_key) {
                return T::deserialize(value.clone()).map(Ok).with_context(|| {
                    format!("error parsing value for key `{json_key}` in config section `{section}`")
                });
            }
        }

        Ok(Err(KeyNames {
            key: key.to_string(),
            env_key,
            json_key,
        }))
    }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr + DeserializeOwned,
        <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get_internal(key) {
            Err(err) => Err(err),
            Ok(Ok(v)) => Ok(v),
            Ok(Err(KeyNames {
                key,
                env_key,
                json_key,
            })) => Err(anyhow!(
                "config value `{key}` must be set via `--{key}` command-line option, \
                `{env_key}` environment variable, or `{json_key}` key in a config file section"
            )),
        }
    }

    pub fn get_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr + DeserializeOwned,
        <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
    {
        self.get_internal(key).map(|v| v.unwrap_or(default))
    }

    pub fn get_option<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr + DeserializeOwned,
        <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
    {
        self.get_internal(key).map(result::Result::ok)
    }
}

/// Builder that declares a binary's configuration values as command-line
/// options and tacks on the options every binary shares.
pub struct ConfigBuilder {
    command: Command,
}

impl ConfigBuilder {
    pub fn new(command: Command, env_prefix: &'static str) -> Self {
        let command = command
            .after_help(format!(
                "Configuration values can be set three ways: command-line options, \
                {env_prefix}_* environment variables, or keys in a JSON config file. \
                Command-line options have the highest precedence, followed by environment \
                variables. Within the config file, the section named after this binary \
                overrides the `all` section."
            ))
            .arg(
                Arg::new("config-file")
                    .long("config-file")
                    .short('c')
                    .value_name("PATH")
                    .action(ArgAction::Set)
                    .default_value("confs/corral.json")
                    .help("JSON config file with `all` and per-binary sections."),
            )
            .arg(
                Arg::new("engine-config-file")
                    .long("engine-config-file")
                    .value_name("PATH")
                    .action(ArgAction::Set)
                    .default_value("confs/engines.json")
                    .help("JSON document listing the engines."),
            );
        Self { command }
    }

    pub fn value(
        mut self,
        field: &'static str,
        short: Option<char>,
        value_name: &'static str,
        help: &'static str,
    ) -> Self {
        let mut arg = Arg::new(field)
            .long(field)
            .value_name(value_name)
            .action(ArgAction::Set)
            .help(help);
        if let Some(short) = short {
            arg = arg.short(short);
        }
        self.command = self.command.arg(arg);
        self
    }

    /// The values every binary understands.
    pub fn common_values(self) -> Self {
        self.value("log-level", Some('l'), "LEVEL", "Minimum log level to output.")
            .value("mule-dir", None, "PATH", "Where to write stats snapshots. Empty disables them.")
            .value("mule-prefix", None, "PREFIX", "Prefix prepended to every stats key.")
    }

    pub fn build(self) -> Command {
        self.command
    }
}

fn read_json_object(path: &Path) -> Result<Map<String, Value>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file `{}`", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parsing config file `{}`", path.display()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("config file `{}` is not a JSON object", path.display()),
    }
}

fn section(map: &Map<String, Value>, name: &str, path: &Path) -> Result<Map<String, Value>> {
    match map.get(name) {
        None => Ok(Map::new()),
        Some(Value::Object(section)) => Ok(section.clone()),
        Some(_) => bail!(
            "section `{name}` in config file `{}` is not a JSON object",
            path.display()
        ),
    }
}

fn file_was_given(args: &ArgMatches, key: &str) -> bool {
    args.value_source(key) == Some(ValueSource::CommandLine)
}

/// Everything a binary gets out of configuration loading.
pub struct LoadedConfig {
    pub bag: ConfigBag,
    pub engines: Vec<EngineConfig>,
}

/// Parse the command line, then read the two config documents it names. A
/// config file named explicitly must exist; one found only at its default
/// path may be absent.
pub fn load(command: Command, binary: &str, env_prefix: &'static str) -> Result<LoadedConfig> {
    let args = command.get_matches();
    load_with(args, binary, env_prefix, std::env::vars())
}

pub fn load_with(
    args: ArgMatches,
    binary: &str,
    env_prefix: &'static str,
    env: impl IntoIterator<Item = (String, String)>,
) -> Result<LoadedConfig> {
    let config_path = Path::new(args.get_one::<String>("config-file").unwrap());
    let sections = if config_path.exists() {
        let map = read_json_object(config_path)?;
        vec![
            (binary.to_string(), section(&map, binary, config_path)?),
            ("all".to_string(), section(&map, "all", config_path)?),
        ]
    } else if file_was_given(&args, "config-file") {
        bail!("config file `{}` does not exist", config_path.display());
    } else {
        vec![]
    };

    let engine_path = Path::new(args.get_one::<String>("engine-config-file").unwrap());
    let engines = if engine_path.exists() {
        let contents = std::fs::read_to_string(engine_path)
            .with_context(|| format!("reading engine config file `{}`", engine_path.display()))?;
        let parsed: EngineConfigFile = serde_json::from_str(&contents)
            .with_context(|| format!("parsing engine config file `{}`", engine_path.display()))?;
        parsed.engines
    } else if file_was_given(&args, "engine-config-file") {
        bail!("engine config file `{}` does not exist", engine_path.display());
    } else {
        vec![]
    };

    Ok(LoadedConfig {
        bag: ConfigBag::new(args, env_prefix, env, sections),
        engines,
    })
}
