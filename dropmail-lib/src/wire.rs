//! length prefixed fields
//!
//! every binary document exchanged over the network (the
//! [`EncryptedMessage`] and the [`RtsMessage`]) is a plain sequence of
//! fields, each field preceded by its length as a big endian `u32`:
//!
//! ```text
//! u32(len(field1)) ‖ field1 ‖ u32(len(field2)) ‖ field2 ‖ ...
//! ```
//!
//! [`EncryptedMessage`]: crate::EncryptedMessage
//! [`RtsMessage`]: crate::RtsMessage

use bytes::{Buf as _, BufMut as _, BytesMut};
use thiserror::Error;

const HEAD_LENGTH: usize = std::mem::size_of::<u32>();

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Not enough bytes to read the length of the field {field}")]
    MissingLength { field: &'static str },

    #[error("Field {field} announces {expected} bytes but only {available} are left")]
    Truncated {
        field: &'static str,
        expected: usize,
        available: usize,
    },

    #[error("{0} unexpected trailing bytes after the last field")]
    TrailingBytes(usize),
}

/// sequential writer of length prefixed fields
pub(crate) struct FieldWriter {
    bytes: BytesMut,
}

/// sequential reader of length prefixed fields
pub(crate) struct FieldReader<'a> {
    slice: &'a [u8],
}

impl FieldWriter {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: BytesMut::with_capacity(capacity),
        }
    }

    /// the encoded size of a field of the given length
    pub(crate) const fn field_size(len: usize) -> usize {
        HEAD_LENGTH + len
    }

    pub(crate) fn put_field(&mut self, field: &[u8]) {
        self.bytes.reserve(Self::field_size(field.len()));
        self.bytes.put_u32(field.len() as u32);
        self.bytes.put_slice(field);
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(slice: &'a [u8]) -> Self {
        Self { slice }
    }

    pub(crate) fn read_field(&mut self, field: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.slice.len() < HEAD_LENGTH {
            return Err(DecodeError::MissingLength { field });
        }

        let expected = (&self.slice[..HEAD_LENGTH]).get_u32() as usize;
        let available = self.slice.len() - HEAD_LENGTH;

        if available < expected {
            return Err(DecodeError::Truncated {
                field,
                expected,
                available,
            });
        }

        let value = &self.slice[HEAD_LENGTH..HEAD_LENGTH + expected];
        self.slice = &self.slice[HEAD_LENGTH + expected..];

        Ok(value)
    }

    /// make sure the whole input has been consumed
    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        if self.slice.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.slice.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_length() {
        let mut writer = FieldWriter::with_capacity(8);
        writer.put_field(b"abc");
        let bytes = writer.finish();

        assert_eq!(bytes, vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn empty_field() {
        let mut writer = FieldWriter::with_capacity(4);
        writer.put_field(&[]);
        let bytes = writer.finish();
        assert_eq!(bytes, vec![0, 0, 0, 0]);

        let mut reader = FieldReader::new(&bytes);
        assert_eq!(reader.read_field("empty").unwrap(), &[] as &[u8]);
        reader.finish().unwrap();
    }

    #[test]
    fn truncated_field() {
        let bytes = [0, 0, 0, 5, 1, 2];
        let mut reader = FieldReader::new(&bytes);

        assert_eq!(
            reader.read_field("body"),
            Err(DecodeError::Truncated {
                field: "body",
                expected: 5,
                available: 2
            })
        );
    }

    #[test]
    fn missing_length() {
        let bytes = [0, 0];
        let mut reader = FieldReader::new(&bytes);

        assert_eq!(
            reader.read_field("iv"),
            Err(DecodeError::MissingLength { field: "iv" })
        );
    }
}
