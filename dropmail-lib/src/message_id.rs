use chrono::{DateTime, TimeZone as _, Utc};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::{
    array::TryFromSliceError,
    convert::{TryFrom, TryInto as _},
    fmt::{self, Formatter},
    str::FromStr,
};

/// the identifier of a transport message
///
/// the identifier is composed of 2 parts. the time it has been **queued** at
/// and a hash of the content mixed with some random nonce (so queueing the
/// same body twice still gives 2 different identifiers).
///
/// The time is stored as big endian so ordering the identifiers orders the
/// messages by queueing time, which is what the outbound queue and the
/// local storage rely on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId([u8; Self::SIZE]);

impl MessageId {
    const HASH_SIZE: usize = 12;
    const TIME_SIZE: usize = std::mem::size_of::<u32>();
    pub const SIZE: usize = Self::HASH_SIZE + Self::TIME_SIZE;

    /// create a new [`MessageId`] for the given content
    ///
    /// the time will be the current time
    pub fn new<RNG>(mut rng: RNG, bytes: impl AsRef<[u8]>) -> Self
    where
        RNG: RngCore + CryptoRng,
    {
        let mut message_id = Self::timed(Utc::now());

        let mut nonce = [0; 16];
        rng.fill_bytes(&mut nonce);

        let hash = Sha256::new()
            .chain_update(nonce)
            .chain_update(bytes.as_ref())
            .finalize();
        message_id.0[Self::TIME_SIZE..].copy_from_slice(&hash[..Self::HASH_SIZE]);

        message_id
    }

    #[inline(always)]
    fn timed(time: DateTime<Utc>) -> Self {
        let seconds = time.timestamp().clamp(0, u32::MAX as i64) as u32;
        let mut message_id = [0u8; Self::SIZE];
        message_id[..Self::TIME_SIZE].copy_from_slice(&seconds.to_be_bytes());

        Self(message_id)
    }

    /// access the hash component of the [`MessageId`]
    pub fn hash(&self) -> &[u8] {
        &self.0[Self::TIME_SIZE..]
    }

    /// access the time component of the [`MessageId`]
    pub fn time(&self) -> DateTime<Utc> {
        let seconds = u32::from_be_bytes(
            self.0[..Self::TIME_SIZE]
                .try_into()
                .expect("4 bytes of BE encoded u32"),
        );
        Utc.timestamp_opt(seconds as i64, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

impl AsRef<[u8]> for MessageId {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl From<[u8; Self::SIZE]> for MessageId {
    fn from(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }
}

impl From<MessageId> for String {
    fn from(message_id: MessageId) -> Self {
        message_id.to_string()
    }
}

impl<'a> TryFrom<&'a [u8]> for MessageId {
    type Error = TryFromSliceError;
    fn try_from(value: &'a [u8]) -> Result<Self, Self::Error> {
        value.try_into().map(Self)
    }
}

impl TryFrom<String> for MessageId {
    type Error = <Self as FromStr>::Err;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(value.as_str())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageId")
            .field(&hex::encode(&self.0))
            .finish()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        hex::encode(&self.0).fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = hex::FromHexError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; Self::SIZE];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    /// tests that the order is kept by increasing time which ever is the
    /// composition of the following hash
    #[test]
    fn ordering_kept() {
        let t1 = Utc.timestamp_opt(0x200FF, 0).unwrap();
        let t2 = Utc.timestamp_opt(0x40000, 0).unwrap();

        let bytes1 = [0xFF; MessageId::HASH_SIZE];
        let bytes2 = [0x08; MessageId::HASH_SIZE];

        let mut message_id1 = MessageId::timed(t1);
        message_id1.0[MessageId::TIME_SIZE..].copy_from_slice(&bytes1);
        let mut message_id2 = MessageId::timed(t2);
        message_id2.0[MessageId::TIME_SIZE..].copy_from_slice(&bytes2);

        // test initial assumptions
        assert!(t1 < t2);
        assert!(bytes1 > bytes2);
        assert!(message_id1 < message_id2);
        assert_eq!(message_id1.time(), t1);
    }

    #[test]
    fn same_content_different_ids() {
        let id1 = MessageId::new(OsRng, b"hello");
        let id2 = MessageId::new(OsRng, b"hello");

        assert_ne!(id1, id2);
    }

    #[test]
    fn display_parse() {
        let id = MessageId::new(OsRng, b"content");
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
