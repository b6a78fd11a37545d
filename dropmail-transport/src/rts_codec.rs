use crate::{error::TransportError, rts::RtsPayload};
use dropmail_lib::{
    crypto::{verify, wrap_key},
    ChannelKey, MessageCrypto, RsaPublicKey, RtsMessage,
};

/// encode and decode the RTS drops of an identity
#[derive(Debug, Clone)]
pub struct RtsEncoder {
    crypto: MessageCrypto,
}

impl RtsEncoder {
    pub fn new(crypto: MessageCrypto) -> Self {
        Self { crypto }
    }

    /// build the RTS proposing `channel_key` to the owner of `recipient`
    pub fn encode_rts(
        &self,
        payload: &RtsPayload,
        channel_key: &ChannelKey,
        recipient: &RsaPublicKey,
    ) -> Result<RtsMessage, TransportError> {
        let json = serde_json::to_vec(payload)?;

        let encrypted_payload = channel_key.encrypt(&json);
        let encrypted_key = wrap_key(recipient, &channel_key.to_concatenated())?;
        let signature = self.crypto.sign(&encrypted_payload)?;

        Ok(RtsMessage::new(encrypted_key, encrypted_payload, signature))
    }

    /// recover the payload and the proposed channel key of an RTS
    ///
    /// the signature is only checked if the `sender`'s key is given. On
    /// first contact it is not: the sender is only known once the payload
    /// is decrypted.
    pub fn decode_rts(
        &self,
        message: &RtsMessage,
        sender: Option<&RsaPublicKey>,
    ) -> Result<(RtsPayload, ChannelKey), TransportError> {
        if let Some(sender) = sender {
            verify(sender, message.encrypted_payload(), message.signature())?;
        }

        let concatenated = self.crypto.unwrap_key(message.encrypted_key())?;
        let channel_key = ChannelKey::from_concatenated(&concatenated)?;

        let json = channel_key.decrypt(message.encrypted_payload())?;
        let payload: RtsPayload = serde_json::from_slice(&json)?;

        if !payload.version.is_supported() {
            return Err(TransportError::UnsupportedVersion(payload.version));
        }

        Ok((payload, channel_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{alice, bob};
    use chrono::Utc;
    use dropmail_lib::{ChannelId, CryptoError, Version};
    use rand::rngs::OsRng;

    fn payload() -> RtsPayload {
        RtsPayload {
            version: Version::CURRENT,
            sender_mailsite_uri: "USK@alice/mailsite".to_owned(),
            sender_identity: "alice".to_owned(),
            recipient_identity: "bob".to_owned(),
            initiator_slot: 0,
            responder_slot: 0,
            channel_id: ChannelId::generate(OsRng),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn encode_decode() {
        let alice = RtsEncoder::new(alice());
        let bob_crypto = bob();
        let bob = RtsEncoder::new(bob_crypto.clone());

        let payload = payload();
        let key = ChannelKey::generate(OsRng);

        let message = alice
            .encode_rts(&payload, &key, bob_crypto.public_key())
            .unwrap();
        let message = RtsMessage::deserialize(&message.serialize()).unwrap();

        let (decoded, decoded_key) = bob.decode_rts(&message, None).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded_key, key);

        let (verified, _) = bob
            .decode_rts(&message, Some(alice.crypto.public_key()))
            .unwrap();
        assert_eq!(verified, payload);
    }

    #[test]
    fn impersonation_detected_when_sender_known() {
        let alice = RtsEncoder::new(alice());
        let bob_crypto = bob();
        let bob = RtsEncoder::new(bob_crypto.clone());

        let message = alice
            .encode_rts(&payload(), &ChannelKey::generate(OsRng), bob_crypto.public_key())
            .unwrap();

        // bob's own key is not the signer
        let result = bob.decode_rts(&message, Some(bob_crypto.public_key()));
        assert!(matches!(
            result,
            Err(TransportError::Crypto(CryptoError::SignatureMismatch))
        ));
    }

    #[test]
    fn not_for_us() {
        let alice_crypto = alice();
        let alice = RtsEncoder::new(alice_crypto.clone());

        // alice encodes an RTS for herself, bob cannot unwrap it
        let message = alice
            .encode_rts(&payload(), &ChannelKey::generate(OsRng), alice_crypto.public_key())
            .unwrap();
        let bob = RtsEncoder::new(bob());

        assert!(matches!(
            bob.decode_rts(&message, None),
            Err(TransportError::Crypto(_))
        ));
    }

    #[test]
    fn unsupported_version() {
        let alice = RtsEncoder::new(alice());
        let bob_crypto = bob();
        let bob = RtsEncoder::new(bob_crypto.clone());

        let mut payload = payload();
        payload.version = Version::from_u8(42);

        let message = alice
            .encode_rts(&payload, &ChannelKey::generate(OsRng), bob_crypto.public_key())
            .unwrap();

        assert!(matches!(
            bob.decode_rts(&message, None),
            Err(TransportError::UnsupportedVersion(version)) if version == Version::from_u8(42)
        ));
    }
}
