use crate::ChannelKey;
use hmac::{Hmac, Mac as _};
use sha2::Sha256;

const CONTEXT: &[u8] = b"dropmail-slots";

/// create the slot base key of the stream going from `sender` to `recipient`
///
/// The base key is derived with `HMAC-SHA256` keyed by the negotiated
/// channel key over the 2 identities, in order. This way both sides derive
/// the same keys without the need to negotiate them: the sender's *send*
/// range is the recipient's *receive* range.
///
/// Since the channel key never leaves the 2 participants, an observer of
/// the network cannot link the slot keys to the identities nor the send
/// stream to the receive stream of the same channel.
///
/// The `prefix` is the network key space the slots are inserted in (for
/// example `KSK@`).
pub fn slot_base_key(prefix: &str, channel_key: &ChannelKey, sender: &str, recipient: &str) -> String {
    let mut mac = <Hmac<Sha256> as hmac::Mac>::new_from_slice(channel_key.key())
        .expect("HMAC accepts keys of any length");

    mac.update(CONTEXT);
    mac.update(&[0]);
    mac.update(sender.as_bytes());
    mac.update(&[0]);
    mac.update(recipient.as_bytes());

    let digest = mac.finalize().into_bytes();

    format!("{}{}", prefix, hex::encode(digest))
}
