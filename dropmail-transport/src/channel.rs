use chrono::{DateTime, Duration, Utc};
use dropmail_lib::{slot_base_key, ChannelId, ChannelKey, MessageId};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// largest serialized [`TransportMessage`] accepted for encryption
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// how long a channel stays active without being used
pub fn channel_ttl() -> Duration {
    Duration::days(7)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelState {
    Active,
    ReadOnly,
    Inactive,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => "active".fmt(f),
            Self::ReadOnly => "read-only".fmt(f),
            Self::Inactive => "inactive".fmt(f),
        }
    }
}

/// a channel between the local identity and a remote identity
///
/// this is also the persisted document of a channel, it contains the
/// channel key in clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub remote_identity: String,
    #[serde(default)]
    pub remote_nickname: Option<String>,
    #[serde(default)]
    pub remote_mailsite_uri: Option<String>,
    #[serde(with = "channel_key")]
    pub channel_key: ChannelKey,
    pub send_slot: u64,
    pub receive_slot: u64,
    pub state: ChannelState,
    /// both sides are known to hold the channel key
    pub established: bool,
    pub initiator: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl Channel {
    /// channel on the side that created the RTS
    ///
    /// the channel is not established until the first message of the
    /// remote is received with the channel key.
    pub fn new_initiator(
        id: ChannelId,
        remote_identity: impl Into<String>,
        channel_key: ChannelKey,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(id, remote_identity.into(), channel_key, true, false, now)
    }

    /// channel on the side that accepted the RTS, the channel key came
    /// from the initiator so it is established right away
    pub fn new_responder(
        id: ChannelId,
        remote_identity: impl Into<String>,
        channel_key: ChannelKey,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(id, remote_identity.into(), channel_key, false, true, now)
    }

    fn new(
        id: ChannelId,
        remote_identity: String,
        channel_key: ChannelKey,
        initiator: bool,
        established: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            remote_identity,
            remote_nickname: None,
            remote_mailsite_uri: None,
            channel_key,
            send_slot: 0,
            receive_slot: 0,
            state: ChannelState::Active,
            established,
            initiator,
            created_at: now,
            expires_at: now + channel_ttl(),
            last_used: now,
        }
    }

    pub fn can_send(&self) -> bool {
        self.state == ChannelState::Active
    }

    /// record an activity on the channel and push its expiry back
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_used = now;
        if self.state == ChannelState::Active {
            self.expires_at = now + channel_ttl();
        }
    }

    /// move the channel down its lifecycle if it has expired
    ///
    /// an active channel becomes read-only at its expiry, it becomes
    /// inactive one more TTL later. Returns the new state if it changed.
    pub fn refresh_state(&mut self, now: DateTime<Utc>) -> Option<ChannelState> {
        let next = match self.state {
            ChannelState::Active if now > self.expires_at => ChannelState::ReadOnly,
            ChannelState::ReadOnly if now > self.expires_at + channel_ttl() => {
                ChannelState::Inactive
            }
            _ => return None,
        };

        self.state = next;
        Some(next)
    }

    /// base key of the slots we insert our messages at
    pub fn send_base_key(&self, prefix: &str, local_identity: &str) -> String {
        slot_base_key(
            prefix,
            &self.channel_key,
            local_identity,
            &self.remote_identity,
        )
    }

    /// base key of the slots the remote inserts its messages at
    pub fn receive_base_key(&self, prefix: &str, local_identity: &str) -> String {
        slot_base_key(
            prefix,
            &self.channel_key,
            &self.remote_identity,
            local_identity,
        )
    }
}

/// a message as carried by a channel
///
/// serialized in JSON before encryption, the body is base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub slot: Option<u64>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error as _, Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(D::Error::custom)
    }
}

mod channel_key {
    use dropmail_lib::ChannelKey;
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct HexChannelKey {
        key: String,
        iv: String,
    }

    pub fn serialize<S>(channel_key: &ChannelKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        HexChannelKey {
            key: hex::encode(channel_key.key()),
            iv: hex::encode(channel_key.iv()),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<ChannelKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex_key = HexChannelKey::deserialize(deserializer)?;
        let key = hex::decode(hex_key.key).map_err(D::Error::custom)?;
        let iv = hex::decode(hex_key.iv).map_err(D::Error::custom)?;

        ChannelKey::from_slices(&key, &iv).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn channel(now: DateTime<Utc>) -> Channel {
        Channel::new_initiator(
            ChannelId::generate(OsRng),
            "bob",
            ChannelKey::generate(OsRng),
            now,
        )
    }

    #[test]
    fn lifecycle() {
        let now = Utc::now();
        let mut channel = channel(now);

        assert!(channel.can_send());
        assert_eq!(channel.refresh_state(now + Duration::days(6)), None);

        let expiry = now + channel_ttl();
        assert_eq!(
            channel.refresh_state(expiry + Duration::seconds(1)),
            Some(ChannelState::ReadOnly)
        );
        assert!(!channel.can_send());

        assert_eq!(channel.refresh_state(expiry + Duration::days(3)), None);
        assert_eq!(
            channel.refresh_state(expiry + channel_ttl() + Duration::seconds(1)),
            Some(ChannelState::Inactive)
        );
        assert_eq!(channel.refresh_state(expiry + Duration::days(365)), None);
    }

    #[test]
    fn touch_extends_active_channel() {
        let now = Utc::now();
        let mut channel = channel(now);

        channel.touch(now + Duration::days(5));
        assert_eq!(channel.refresh_state(now + Duration::days(8)), None);
        assert_eq!(channel.expires_at, now + Duration::days(12));
    }

    #[test]
    fn both_sides_derive_the_same_streams() {
        let now = Utc::now();
        let alice = channel(now);
        let mut bob = alice.clone();
        bob.remote_identity = "alice".to_owned();

        assert_eq!(
            alice.send_base_key("KSK@", "alice"),
            bob.receive_base_key("KSK@", "bob")
        );
        assert_eq!(
            alice.receive_base_key("KSK@", "alice"),
            bob.send_base_key("KSK@", "bob")
        );
        assert_ne!(
            alice.send_base_key("KSK@", "alice"),
            alice.receive_base_key("KSK@", "alice")
        );
    }

    #[test]
    fn channel_document() {
        let channel = channel(Utc::now());

        let json = serde_json::to_string(&channel).unwrap();
        assert!(json.contains("\"state\":\"active\""));
        assert!(json.contains(&hex::encode(channel.channel_key.key())));

        let decoded: Channel = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, channel);
    }

    #[test]
    fn read_only_state_name() {
        let json = serde_json::to_string(&ChannelState::ReadOnly).unwrap();
        assert_eq!(json, "\"read-only\"");
        assert_eq!(ChannelState::ReadOnly.to_string(), "read-only");
    }
}
