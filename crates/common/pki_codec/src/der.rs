//! A DER writer on top of asn1-rs.
//!
//! Values are appended one after the other and wrapped into a SEQUENCE at the end, so the length of the
//! SEQUENCE is always computed from what was actually written.

use std::borrow::Cow;

use asn1_rs::Integer;
use asn1_rs::OctetString;
use asn1_rs::Sequence;
use asn1_rs::SerializeError;
use asn1_rs::ToDer;

use crate::integer::sign_padded;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to encode DER: {0}")]
pub struct DerError(String);

impl From<SerializeError> for DerError {
    fn from(err: SerializeError) -> Self {
        DerError(err.to_string())
    }
}

#[derive(Debug, Default, Clone)]
pub struct DerWriter {
    buf: Vec<u8>,
}

impl DerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        DerWriter {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Appends an INTEGER holding the unsigned big-endian `value` as is, adding a zero byte when its top bit is
    /// set. Leading zeros are not removed.
    pub fn append_unsigned_integer(&mut self, value: &[u8]) -> Result<&mut Self, DerError> {
        let content = sign_padded(value);
        Integer::new(&content).write_der(&mut self.buf)?;
        Ok(self)
    }

    pub fn append_octet_string(&mut self, value: &[u8]) -> Result<&mut Self, DerError> {
        OctetString::new(value).write_der(&mut self.buf)?;
        Ok(self)
    }

    /// Appends already encoded DER.
    pub fn append_value(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// Wraps everything written so far into a SEQUENCE.
    pub fn into_sequence(self) -> Result<Vec<u8>, DerError> {
        Ok(Sequence::new(Cow::Owned(self.buf)).to_der_vec()?)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
