use crate::{channel::ChannelState, slot::Direction};
use dropmail_lib::{ChannelId, CryptoError, DecodeError, Version};
use thiserror::Error;

/// errors of the transport operations
///
/// the variants follow the families of failures of the protocol:
/// cryptographic ([`Crypto`]), format ([`Decode`], [`Json`],
/// [`UnsupportedVersion`]), network ([`Network`], [`NotFound`]) and
/// local state errors.
///
/// [`Crypto`]: TransportError::Crypto
/// [`Decode`]: TransportError::Decode
/// [`Json`]: TransportError::Json
/// [`UnsupportedVersion`]: TransportError::UnsupportedVersion
/// [`Network`]: TransportError::Network
/// [`NotFound`]: TransportError::NotFound
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Cryptographic operation failed")]
    Crypto(#[from] CryptoError),

    #[error("Malformed binary message")]
    Decode(#[from] DecodeError),

    #[error("Malformed JSON document")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported format version {0}")]
    UnsupportedVersion(Version),

    #[error("Network operation failed")]
    Network(#[source] anyhow::Error),

    #[error("Nothing found in the network at {key}")]
    NotFound { key: String },

    #[error("Message body of {size} bytes exceeds the limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("No channel {0}")]
    ChannelNotFound(ChannelId),

    #[error("Channel {channel} is {state} and cannot send messages")]
    ChannelNotWritable {
        channel: ChannelId,
        state: ChannelState,
    },

    #[error("Message for channel {found} received on channel {expected}")]
    ChannelMismatch {
        expected: ChannelId,
        found: ChannelId,
    },

    #[error("No {direction} slot range for channel {channel}")]
    SlotRangeNotFound {
        channel: ChannelId,
        direction: Direction,
    },

    #[error("No pending RTS for channel {0}")]
    RtsNotFound(ChannelId),

    #[error("RTS addressed to {recipient}, not to {identity}")]
    RtsMisaddressed { recipient: String, identity: String },
}

impl TransportError {
    /// errors that come from the network and may succeed if retried
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// the error and all its sources on one line
    pub fn report(&self) -> String {
        let mut report = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(error) = source {
            report.push_str(": ");
            report.push_str(&error.to_string());
            source = error.source();
        }
        report
    }
}
