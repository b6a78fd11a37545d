use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use structopt::StructOpt;

/// configuration of the transport
///
/// the intervals are given in seconds, in the configuration file as
/// well as on the command line.
#[derive(StructOpt, Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// how often the receive slots of the channels are polled
    #[structopt(long = "slot-poll-interval", default_value = "300", parse(try_from_str = duration))]
    #[serde(default = "default_slot_poll_interval", with = "seconds")]
    pub slot_poll_interval: Duration,

    /// how often the pending RTS are (re)sent
    #[structopt(long = "rts-send-interval", default_value = "600", parse(try_from_str = duration))]
    #[serde(default = "default_rts_send_interval", with = "seconds")]
    pub rts_send_interval: Duration,

    /// how often our own RTS key is checked for new channel requests
    #[structopt(long = "rts-fetch-interval", default_value = "600", parse(try_from_str = duration))]
    #[serde(default = "default_rts_fetch_interval", with = "seconds")]
    pub rts_fetch_interval: Duration,

    /// how often the mailsite is checked for staleness
    ///
    /// the mailsite is only republished if the last publication is older
    /// than 6 hours.
    #[structopt(long = "mailsite-publish-interval", default_value = "21600", parse(try_from_str = duration))]
    #[serde(default = "default_mailsite_publish_interval", with = "seconds")]
    pub mailsite_publish_interval: Duration,

    /// don't accept incoming channel requests automatically
    ///
    /// the requests are kept until they are accepted or rejected
    /// explicitly.
    #[structopt(long = "manual-accept")]
    #[serde(default)]
    pub manual_accept: bool,

    /// network key space of the slots
    #[structopt(long = "slot-key-prefix", default_value = "KSK@dropmail-")]
    #[serde(default = "default_slot_key_prefix")]
    pub slot_key_prefix: String,

    /// number of remote mailsites kept in memory
    #[structopt(long = "mailsite-cache-size", default_value = "256")]
    #[serde(default = "default_mailsite_cache_size")]
    pub mailsite_cache_size: usize,
}

fn default_slot_poll_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_rts_send_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_rts_fetch_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_mailsite_publish_interval() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_slot_key_prefix() -> String {
    "KSK@dropmail-".to_owned()
}

fn default_mailsite_cache_size() -> usize {
    256
}

fn duration(s: &str) -> Result<Duration> {
    let i = s
        .parse()
        .context("expecting to parse a duration in seconds")?;
    Ok(Duration::from_secs(i))
}

mod seconds {
    use serde::{Deserialize as _, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slot_poll_interval: default_slot_poll_interval(),
            rts_send_interval: default_rts_send_interval(),
            rts_fetch_interval: default_rts_fetch_interval(),
            mailsite_publish_interval: default_mailsite_publish_interval(),
            manual_accept: false,
            slot_key_prefix: default_slot_key_prefix(),
            mailsite_cache_size: default_mailsite_cache_size(),
        }
    }
}
