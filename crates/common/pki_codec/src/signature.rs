//! Conversion between raw `R || S` ECDSA signatures, as returned by `CKM_ECDSA`, and ASN.1 DER signatures.

use asn1_rs::FromBer as _;
use asn1_rs::Integer;
use asn1_rs::Sequence;

use crate::der::DerError;
use crate::der::DerWriter;
use crate::integer::normalize_unsigned;

/// Length of a raw P-256 signature: 32 bytes of R followed by 32 bytes of S.
pub const ECDSA_P256_RAW_SIGNATURE_LEN: usize = 64;

const SCALAR_LEN: usize = ECDSA_P256_RAW_SIGNATURE_LEN / 2;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Raw ECDSA signature must be {expected} bytes long, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Malformed DER ECDSA signature: {0}")]
    MalformedSignature(&'static str),

    #[error(transparent)]
    Der(#[from] DerError),
}

/// Encodes a raw P-256 signature as `SEQUENCE { INTEGER r, INTEGER s }`.
///
/// Both integers keep their full 32 bytes; a zero byte is prepended when the top bit is set, giving a length
/// of 0x21 instead of 0x20. The SEQUENCE length is computed from the two encoded integers, so the output is
/// 70, 71 or 72 bytes long.
pub fn reencode_ecdsa_signature(raw: &[u8]) -> Result<Vec<u8>, EncodeError> {
    if raw.len() != ECDSA_P256_RAW_SIGNATURE_LEN {
        return Err(EncodeError::LengthMismatch {
            expected: ECDSA_P256_RAW_SIGNATURE_LEN,
            actual: raw.len(),
        });
    }

    let (r, s) = raw.split_at(SCALAR_LEN);
    let mut writer = DerWriter::with_capacity(ECDSA_P256_RAW_SIGNATURE_LEN + 6);
    writer.append_unsigned_integer(r)?.append_unsigned_integer(s)?;

    Ok(writer.into_sequence()?)
}

/// Decodes a DER ECDSA signature back into its raw `R || S` form.
///
/// The integers are read with BER rules, so that the non-minimal integers written by [reencode_ecdsa_signature]
/// are accepted: a 32-byte R or S starting with a zero byte keeps its leading zero there.
pub fn decode_ecdsa_signature(der: &[u8]) -> Result<[u8; ECDSA_P256_RAW_SIGNATURE_LEN], EncodeError> {
    let (rest, sequence) =
        Sequence::from_ber(der).map_err(|_| EncodeError::MalformedSignature("expected a SEQUENCE"))?;
    if !rest.is_empty() {
        return Err(EncodeError::MalformedSignature(
            "trailing bytes after the SEQUENCE",
        ));
    }

    let mut body: &[u8] = &sequence.content;
    let mut raw = [0u8; ECDSA_P256_RAW_SIGNATURE_LEN];
    for chunk in raw.chunks_exact_mut(SCALAR_LEN) {
        let (after, integer) = Integer::from_ber(body)
            .map_err(|_| EncodeError::MalformedSignature("expected an INTEGER"))?;
        let scalar = normalize_unsigned(integer.as_ref(), SCALAR_LEN)
            .map_err(|_| EncodeError::MalformedSignature("INTEGER does not fit 32 bytes"))?;
        chunk.copy_from_slice(&scalar);
        body = after;
    }
    if !body.is_empty() {
        return Err(EncodeError::MalformedSignature(
            "trailing bytes after the INTEGERs",
        ));
    }

    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use test_case::test_case;

    fn raw_signature(r_top: u8, s_top: u8) -> Vec<u8> {
        let mut raw: Vec<u8> = (0..64u8).collect();
        raw[0] = r_top;
        raw[32] = s_top;
        raw
    }

    #[test_case(0x11, 0x22, 0x20, 0x20 ; "neither padded")]
    #[test_case(0x11, 0x82, 0x20, 0x21 ; "s padded")]
    #[test_case(0x91, 0x22, 0x21, 0x20 ; "r padded")]
    #[test_case(0x91, 0x82, 0x21, 0x21 ; "both padded")]
    fn reencodes_all_sign_combinations(r_top: u8, s_top: u8, r_len: usize, s_len: usize) {
        let raw = raw_signature(r_top, s_top);
        let der = reencode_ecdsa_signature(&raw).unwrap();

        assert_eq!(der[0], 0x30);
        assert_eq!(der[1] as usize, 4 + r_len + s_len);
        assert_eq!(der.len(), 2 + 4 + r_len + s_len);

        assert_eq!(der[2], 0x02);
        assert_eq!(der[3] as usize, r_len);
        let r = &der[4..4 + r_len];
        assert_eq!(&r[r_len - 32..], &raw[..32]);

        let s_start = 4 + r_len;
        assert_eq!(der[s_start], 0x02);
        assert_eq!(der[s_start + 1] as usize, s_len);
        let s = &der[s_start + 2..];
        assert_eq!(s.len(), s_len);
        assert_eq!(&s[s_len - 32..], &raw[32..]);

        if r_len == 0x21 {
            assert_eq!(r[0], 0x00);
        }
        if s_len == 0x21 {
            assert_eq!(s[0], 0x00);
        }
    }

    #[test_case(0 ; "empty")]
    #[test_case(63 ; "one byte short")]
    #[test_case(65 ; "one byte too many")]
    fn rejects_wrong_raw_length(len: usize) {
        assert_matches!(
            reencode_ecdsa_signature(&vec![1; len]),
            Err(EncodeError::LengthMismatch { expected: 64, actual }) if actual == len
        );
    }

    #[test_case(0x11, 0x22)]
    #[test_case(0x91, 0x82)]
    #[test_case(0x00, 0x00)]
    fn decodes_reencoded_signatures(r_top: u8, s_top: u8) {
        let raw = raw_signature(r_top, s_top);
        let der = reencode_ecdsa_signature(&raw).unwrap();

        assert_eq!(decode_ecdsa_signature(&der).unwrap().as_slice(), raw);
    }

    #[test]
    fn decodes_minimally_encoded_signatures() {
        // r = 1, s = 0x80
        let der = [0x30, 0x07, 0x02, 0x01, 0x01, 0x02, 0x02, 0x00, 0x80];
        let raw = decode_ecdsa_signature(&der).unwrap();

        assert_eq!(raw[31], 0x01);
        assert_eq!(raw[63], 0x80);
        assert!(raw[..31].iter().all(|b| *b == 0));
        assert!(raw[32..63].iter().all(|b| *b == 0));
    }

    #[test]
    fn rejects_malformed_der_signatures() {
        assert_matches!(
            decode_ecdsa_signature(&[0x02, 0x01, 0x01]),
            Err(EncodeError::MalformedSignature(_))
        );
        assert_matches!(
            decode_ecdsa_signature(&[0x30, 0x03, 0x02, 0x01, 0x01]),
            Err(EncodeError::MalformedSignature(_))
        );
        let mut trailing = reencode_ecdsa_signature(&raw_signature(1, 1)).unwrap();
        trailing.push(0);
        assert_matches!(
            decode_ecdsa_signature(&trailing),
            Err(EncodeError::MalformedSignature(_))
        );
    }
}
