use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};
use structopt::StructOpt;

#[derive(Debug, PartialEq, Eq, Hash, Clone, StructOpt, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// path to the persistent storage file
    ///
    /// if no existing file is found, a new storage file will be created
    #[structopt(long = "storage-path", default_value = "dropmail.db")]
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// number of minutes between 2 saves of the channels and slots
    ///
    /// the state is also saved when the node stops
    #[serde(default = "default_persist_rate", with = "minutes")]
    #[structopt(long = "storage-persist-rate", default_value = "1", parse(try_from_str = duration))]
    pub persist_rate: Duration,

    #[serde(default)]
    #[structopt(long = "storage-mode", default_value = "low-space")]
    pub mode: Mode,

    /// enable the compression of the persistent storage (zstd level)
    #[serde(default)]
    #[structopt(long = "storage-compression-factor")]
    pub compression_factor: Option<i32>,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    LowSpace,
    HighThroughput,
}

impl Default for Mode {
    fn default() -> Self {
        Self::LowSpace
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low-space" => Ok(Self::LowSpace),
            "high-throughput" => Ok(Self::HighThroughput),
            _ => bail!("unknown storage mode {:?}", s),
        }
    }
}

impl From<Mode> for sled::Mode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::LowSpace => Self::LowSpace,
            Mode::HighThroughput => Self::HighThroughput,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: default_path(),
            persist_rate: default_persist_rate(),
            mode: Mode::default(),
            compression_factor: None,
        }
    }
}

fn default_path() -> PathBuf {
    PathBuf::from("dropmail.db")
}

fn default_persist_rate() -> Duration {
    Duration::from_secs(60)
}

fn duration(s: &str) -> Result<Duration> {
    let i: u64 = s
        .parse()
        .context("expecting to parse a duration in minutes")?;
    Ok(Duration::from_secs(i * 60))
}

mod minutes {
    use serde::{Deserialize as _, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs() / 60)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(|minutes| Duration::from_secs(minutes * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_from_str() {
        assert_eq!("low-space".parse::<Mode>().unwrap(), Mode::LowSpace);
        assert_eq!(
            "high-throughput".parse::<Mode>().unwrap(),
            Mode::HighThroughput
        );
        assert!("fast".parse::<Mode>().is_err());
    }

    #[test]
    fn command_line() {
        let config =
            Config::from_iter_safe(&["storage", "--storage-persist-rate", "5"]).unwrap();

        assert_eq!(config.persist_rate, Duration::from_secs(300));
        assert_eq!(config.path, default_path());
        assert_eq!(config.mode, Mode::LowSpace);
    }
}
