/*!
# dropmail primitives

identifiers, binary wire formats and the hybrid cryptography shared by the
dropmail transport and the daemon.

* [`MessageCrypto`]: RSA-OAEP / AES-256-CBC / RSA-PSS hybrid encryption;
* [`EncryptedMessage`] and [`RtsMessage`]: the length prefixed documents
  inserted in the network;
* [`ChannelId`], [`MessageId`] and [`Version`];
* [`slot_base_key`]: derivation of the per direction slot key space of a
  channel.
*/

#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

mod channel_id;
pub mod crypto;
mod encrypted_message;
mod message_id;
mod rts_message;
mod slot_base;
mod version;
mod wire;

pub use self::{
    channel_id::ChannelId,
    crypto::{ChannelKey, CryptoError, MessageCrypto},
    encrypted_message::EncryptedMessage,
    message_id::MessageId,
    rts_message::RtsMessage,
    slot_base::slot_base_key,
    version::Version,
    wire::DecodeError,
};

pub use rsa::{RsaPrivateKey, RsaPublicKey};
