use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt, str::FromStr};

/// unique identifier of a channel established between 2 identities
///
/// the identifier is chosen at random by the initiator of the channel
/// when creating the RTS and is carried inside the encrypted RTS payload,
/// so both sides end up using the same [`ChannelId`]. Re-initiating a
/// channel with the same peer will generate a new [`ChannelId`].
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId([u8; Self::SIZE]);

impl ChannelId {
    pub const SIZE: usize = 16;

    pub fn generate<RNG>(mut rng: RNG) -> Self
    where
        RNG: RngCore + CryptoRng,
    {
        let mut id = Self([0; Self::SIZE]);
        rng.fill_bytes(&mut id.0);
        id
    }

    pub const fn new(id: [u8; Self::SIZE]) -> Self {
        Self(id)
    }
}

impl AsRef<[u8]> for ChannelId {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelId")
            .field(&hex::encode(&self.0))
            .finish()
    }
}

impl FromStr for ChannelId {
    type Err = hex::FromHexError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut channel_id = ChannelId([0; Self::SIZE]);
        hex::decode_to_slice(s, &mut channel_id.0)?;
        Ok(channel_id)
    }
}

impl From<ChannelId> for String {
    fn from(channel_id: ChannelId) -> Self {
        channel_id.to_string()
    }
}

impl TryFrom<String> for ChannelId {
    type Error = hex::FromHexError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
