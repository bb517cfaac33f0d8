//! SubjectPublicKeyInfo of P-256 public keys.
//!
//! A token returns the public point of an EC key in `CKA_EC_POINT` as a DER OCTET STRING wrapping the
//! uncompressed point. The SubjectPublicKeyInfo of that key is a fixed 26-byte header followed by the 65 bytes
//! of the point, so it can be assembled by replacing the 2-byte OCTET STRING header with the SPKI header.

use asn1_rs::Any;
use asn1_rs::FromDer as _;
use asn1_rs::Tag;

use crate::der::DerError;
use crate::der::DerWriter;

/// `SEQUENCE { SEQUENCE { id-ecPublicKey, secp256r1 }, BIT STRING (66 bytes, 0 unused bits) ... }`
pub const P256_SPKI_HEADER: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08, 0x2a, 0x86, 0x48,
    0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

/// `0x04 || X || Y`
pub const P256_UNCOMPRESSED_POINT_LEN: usize = 65;

/// Tag and length bytes of the OCTET STRING wrapping the point in `CKA_EC_POINT`.
pub const EC_POINT_HEADER_LEN: usize = 2;

pub const P256_EC_POINT_DER_LEN: usize = P256_UNCOMPRESSED_POINT_LEN + EC_POINT_HEADER_LEN;

pub const P256_SPKI_LEN: usize = P256_SPKI_HEADER.len() + P256_UNCOMPRESSED_POINT_LEN;

const UNCOMPRESSED_POINT_TAG: u8 = 0x04;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SpkiError {
    #[error("Expected an uncompressed P-256 point of 65 bytes, got {0} bytes")]
    InvalidPoint(usize),

    #[error("Not a P-256 SubjectPublicKeyInfo")]
    NotP256,

    #[error(transparent)]
    Der(#[from] DerError),
}

/// Wraps an uncompressed point into the DER OCTET STRING stored in `CKA_EC_POINT`.
pub fn ec_point_octet_string(point: &[u8]) -> Result<Vec<u8>, SpkiError> {
    check_point(point)?;
    let mut writer = DerWriter::with_capacity(P256_EC_POINT_DER_LEN);
    writer.append_octet_string(point)?;
    Ok(writer.into_bytes())
}

/// Returns the uncompressed point held by a `CKA_EC_POINT` value.
///
/// Tokens are expected to store a DER OCTET STRING, but some return the raw point; both are accepted.
pub fn unwrap_ec_point(attribute: &[u8]) -> Result<&[u8], SpkiError> {
    if attribute.len() == P256_UNCOMPRESSED_POINT_LEN && attribute[0] == UNCOMPRESSED_POINT_TAG {
        return Ok(attribute);
    }

    match Any::from_der(attribute) {
        Ok((rest, octets)) if rest.is_empty() && octets.tag() == Tag::OctetString => {
            check_point(octets.data).map(|_| octets.data)
        }
        _ => Err(SpkiError::InvalidPoint(attribute.len())),
    }
}

/// Builds the SubjectPublicKeyInfo of the P-256 key with the given uncompressed point.
pub fn p256_spki_from_point(point: &[u8]) -> Result<Vec<u8>, SpkiError> {
    check_point(point)?;
    let mut spki = Vec::with_capacity(P256_SPKI_LEN);
    spki.extend_from_slice(&P256_SPKI_HEADER);
    spki.extend_from_slice(point);
    Ok(spki)
}

fn check_point(point: &[u8]) -> Result<(), SpkiError> {
    if point.len() != P256_UNCOMPRESSED_POINT_LEN || point[0] != UNCOMPRESSED_POINT_TAG {
        return Err(SpkiError::InvalidPoint(point.len()));
    }
    Ok(())
}
