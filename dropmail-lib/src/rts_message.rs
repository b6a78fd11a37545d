use crate::wire::{DecodeError, FieldReader, FieldWriter};

/// the Ready-To-Send drop as it is inserted at the recipient's RTS key
///
/// * `encrypted_key`: `aes_key ‖ iv` wrapped with RSA-OAEP(SHA-256) under
///   the recipient's public key;
/// * `encrypted_payload`: the JSON payload encrypted with that AES key;
/// * `signature`: RSA-PSS(SHA-256) signature of the `encrypted_payload`
///   by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RtsMessage {
    encrypted_key: Vec<u8>,
    encrypted_payload: Vec<u8>,
    signature: Vec<u8>,
}

impl RtsMessage {
    pub fn new(encrypted_key: Vec<u8>, encrypted_payload: Vec<u8>, signature: Vec<u8>) -> Self {
        Self {
            encrypted_key,
            encrypted_payload,
            signature,
        }
    }

    pub fn encrypted_key(&self) -> &[u8] {
        &self.encrypted_key
    }

    pub fn encrypted_payload(&self) -> &[u8] {
        &self.encrypted_payload
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn serialize(&self) -> Vec<u8> {
        let capacity = FieldWriter::field_size(self.encrypted_key.len())
            + FieldWriter::field_size(self.encrypted_payload.len())
            + FieldWriter::field_size(self.signature.len());
        let mut writer = FieldWriter::with_capacity(capacity);

        writer.put_field(&self.encrypted_key);
        writer.put_field(&self.encrypted_payload);
        writer.put_field(&self.signature);

        writer.finish()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = FieldReader::new(bytes);

        let encrypted_key = reader.read_field("encrypted_key")?.to_vec();
        let encrypted_payload = reader.read_field("encrypted_payload")?.to_vec();
        let signature = reader.read_field("signature")?.to_vec();

        reader.finish()?;

        Ok(Self {
            encrypted_key,
            encrypted_payload,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};

    impl Arbitrary for RtsMessage {
        fn arbitrary(g: &mut Gen) -> Self {
            Self::new(Vec::arbitrary(g), Vec::arbitrary(g), Vec::arbitrary(g))
        }
    }

    #[quickcheck]
    fn serialize_deserialize(message: RtsMessage) -> bool {
        let bytes = message.serialize();
        let decoded = RtsMessage::deserialize(&bytes).unwrap();

        message == decoded
    }

    #[test]
    fn empty_fields() {
        let message = RtsMessage::new(Vec::new(), Vec::new(), Vec::new());
        let bytes = message.serialize();

        assert_eq!(bytes, vec![0; 12]);
        assert_eq!(RtsMessage::deserialize(&bytes).unwrap(), message);
    }

    #[test]
    fn an_encrypted_message_is_not_an_rts() {
        // 4 fields where 3 are expected
        let bytes = crate::EncryptedMessage::new(vec![1], vec![2], vec![3], vec![4]).serialize();

        assert_eq!(
            RtsMessage::deserialize(&bytes),
            Err(DecodeError::TrailingBytes(5))
        );
    }
}
