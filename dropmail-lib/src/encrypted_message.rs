use crate::wire::{DecodeError, FieldReader, FieldWriter};

/// output of the hybrid encryption
///
/// * `encrypted_session_key`: the AES-256 session key wrapped with
///   RSA-OAEP(SHA-256) under the recipient's public key. Empty when the
///   body was encrypted with an already established channel key;
/// * `iv`: the 16 bytes AES-CBC initialisation vector;
/// * `encrypted_body`: AES-256-CBC (PKCS#7 padded) ciphertext;
/// * `signature`: RSA-PSS(SHA-256) signature of the `encrypted_body`.
///
/// The object is immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncryptedMessage {
    encrypted_session_key: Vec<u8>,
    iv: Vec<u8>,
    encrypted_body: Vec<u8>,
    signature: Vec<u8>,
}

impl EncryptedMessage {
    pub fn new(
        encrypted_session_key: Vec<u8>,
        iv: Vec<u8>,
        encrypted_body: Vec<u8>,
        signature: Vec<u8>,
    ) -> Self {
        Self {
            encrypted_session_key,
            iv,
            encrypted_body,
            signature,
        }
    }

    pub fn encrypted_session_key(&self) -> &[u8] {
        &self.encrypted_session_key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn encrypted_body(&self) -> &[u8] {
        &self.encrypted_body
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// true if the body has been encrypted with a symmetric channel
    /// key rather than with a wrapped session key
    pub fn is_symmetric(&self) -> bool {
        self.encrypted_session_key.is_empty()
    }

    /// encode the 4 fields, in order, each prefixed with its length
    pub fn serialize(&self) -> Vec<u8> {
        let capacity = FieldWriter::field_size(self.encrypted_session_key.len())
            + FieldWriter::field_size(self.iv.len())
            + FieldWriter::field_size(self.encrypted_body.len())
            + FieldWriter::field_size(self.signature.len());
        let mut writer = FieldWriter::with_capacity(capacity);

        writer.put_field(&self.encrypted_session_key);
        writer.put_field(&self.iv);
        writer.put_field(&self.encrypted_body);
        writer.put_field(&self.signature);

        writer.finish()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = FieldReader::new(bytes);

        let encrypted_session_key = reader.read_field("encrypted_session_key")?.to_vec();
        let iv = reader.read_field("iv")?.to_vec();
        let encrypted_body = reader.read_field("encrypted_body")?.to_vec();
        let signature = reader.read_field("signature")?.to_vec();

        reader.finish()?;

        Ok(Self {
            encrypted_session_key,
            iv,
            encrypted_body,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};

    impl Arbitrary for EncryptedMessage {
        fn arbitrary(g: &mut Gen) -> Self {
            Self::new(
                Vec::arbitrary(g),
                Vec::arbitrary(g),
                Vec::arbitrary(g),
                Vec::arbitrary(g),
            )
        }
    }

    #[quickcheck]
    fn serialize_deserialize(message: EncryptedMessage) -> bool {
        let bytes = message.serialize();
        let decoded = EncryptedMessage::deserialize(&bytes).unwrap();

        message == decoded
    }

    #[test]
    fn empty_fields() {
        let message = EncryptedMessage::new(Vec::new(), Vec::new(), Vec::new(), Vec::new());
        let bytes = message.serialize();

        assert_eq!(bytes, vec![0; 16]);
        assert_eq!(EncryptedMessage::deserialize(&bytes).unwrap(), message);
        assert!(message.is_symmetric());
    }

    #[test]
    fn field_order() {
        let message = EncryptedMessage::new(vec![1], vec![2, 2], vec![3], vec![4]);
        let bytes = message.serialize();

        assert_eq!(
            bytes,
            vec![
                0, 0, 0, 1, 1, //
                0, 0, 0, 2, 2, 2, //
                0, 0, 0, 1, 3, //
                0, 0, 0, 1, 4,
            ]
        );
    }

    #[test]
    fn trailing_bytes_rejected() {
        let message = EncryptedMessage::new(vec![1], vec![2], vec![3], vec![4]);
        let mut bytes = message.serialize();
        bytes.push(0);

        assert_eq!(
            EncryptedMessage::deserialize(&bytes),
            Err(DecodeError::TrailingBytes(1))
        );
    }

    #[test]
    fn missing_signature_rejected() {
        let message = EncryptedMessage::new(vec![1], vec![2], vec![3], vec![4]);
        let bytes = message.serialize();

        assert!(EncryptedMessage::deserialize(&bytes[..bytes.len() - 5]).is_err());
    }
}
