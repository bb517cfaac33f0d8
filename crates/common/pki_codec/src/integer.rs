//! Big-endian unsigned integers as exported by key parsers.
//!
//! Key parsers export the numeric fields of a key (RSA modulus, exponents, EC scalar) as the content of an
//! ASN.1 INTEGER. When the most significant bit of the value is set, the INTEGER carries one extra leading
//! zero byte so that it is not read as negative. PKCS #11 attributes on the other hand expect plain unsigned
//! big-endian values of a fixed width.

use zeroize::Zeroizing;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegerError {
    #[error("Integer of {len} bytes does not fit into a field of {width} bytes")]
    TooLong { len: usize, width: usize },

    #[error("Integer field is empty")]
    Empty,

    #[error("Failed to allocate {0} bytes for an integer field")]
    AllocationFailure(usize),
}

/// Returns the unsigned value of a field exported with one byte of slack for the sign pad.
///
/// - `width + 1` bytes starting with `0x00`: the pad is skipped.
/// - at most `width` bytes: nothing is skipped, even if the first byte is `0x00`, because it is a data byte.
/// - anything else does not fit the field.
pub fn strip_sign_pad(bytes: &[u8], width: usize) -> Result<&[u8], IntegerError> {
    match bytes {
        [] => Err(IntegerError::Empty),
        [0, value @ ..] if bytes.len() == width + 1 => Ok(value),
        _ if bytes.len() <= width => Ok(bytes),
        _ => Err(IntegerError::TooLong {
            len: bytes.len(),
            width,
        }),
    }
}

/// Strips the sign pad (see [strip_sign_pad]) and left-pads the value with zeros to exactly `width` bytes.
///
/// The returned buffer is zeroed on drop, as it may hold private key material.
pub fn normalize_unsigned(bytes: &[u8], width: usize) -> Result<Zeroizing<Vec<u8>>, IntegerError> {
    let value = strip_sign_pad(bytes, width)?;

    let mut field = Vec::new();
    field
        .try_reserve_exact(width)
        .map_err(|_| IntegerError::AllocationFailure(width))?;
    let mut field = Zeroizing::new(field);
    field.resize(width - value.len(), 0);
    field.extend_from_slice(value);

    Ok(field)
}

/// Returns the content of the ASN.1 INTEGER encoding `value`: a zero byte is prepended when the top bit is set.
pub fn sign_padded(value: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(value.len() + 1);
    if value.first().is_some_and(|byte| byte & 0x80 != 0) {
        encoded.push(0);
    }
    encoded.extend_from_slice(value);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(&[0x00, 0x80, 0x01], 2, &[0x80, 0x01] ; "pad stripped")]
    #[test_case(&[0x80, 0x01], 2, &[0x80, 0x01] ; "full width without pad")]
    #[test_case(&[0x00, 0x01], 2, &[0x00, 0x01] ; "leading zero data byte kept")]
    #[test_case(&[0x01], 2, &[0x01] ; "short value kept")]
    #[test_case(&[0x00, 0x00, 0x01], 2, &[0x00, 0x01] ; "only one pad byte stripped")]
    fn strips_sign_pad(input: &[u8], width: usize, expected: &[u8]) {
        assert_eq!(strip_sign_pad(input, width).unwrap(), expected);
    }

    #[test]
    fn rejects_values_wider_than_the_field() {
        assert_matches!(
            strip_sign_pad(&[0x01, 0x02, 0x03], 2),
            Err(IntegerError::TooLong { len: 3, width: 2 })
        );
        assert_matches!(
            strip_sign_pad(&[0x00, 0x01, 0x02, 0x03], 2),
            Err(IntegerError::TooLong { len: 4, width: 2 })
        );
        assert_matches!(strip_sign_pad(&[], 2), Err(IntegerError::Empty));
    }

    #[test]
    fn normalizes_to_fixed_width() {
        assert_eq!(
            normalize_unsigned(&[0x01, 0x00, 0x01], 4).unwrap().as_slice(),
            &[0x00, 0x01, 0x00, 0x01]
        );
        assert_eq!(
            normalize_unsigned(&[0x00, 0xff, 0xee, 0xdd, 0xcc], 4)
                .unwrap()
                .as_slice(),
            &[0xff, 0xee, 0xdd, 0xcc]
        );
    }

    #[test]
    fn sign_pads_only_negative_looking_values() {
        assert_eq!(sign_padded(&[0x80]), vec![0x00, 0x80]);
        assert_eq!(sign_padded(&[0x7f]), vec![0x7f]);
        assert_eq!(sign_padded(&[]), Vec::<u8>::new());
    }

    proptest! {
        #[test]
        fn strip_inverts_sign_pad(value in proptest::collection::vec(any::<u8>(), 1..=64)) {
            let width = value.len();
            let exported = sign_padded(&value);
            prop_assert_eq!(strip_sign_pad(&exported, width).unwrap(), value.as_slice());
        }

        #[test]
        fn normalize_preserves_numeric_value(value in proptest::collection::vec(any::<u8>(), 1..=32)) {
            let width = 32;
            let field = normalize_unsigned(&sign_padded(&value), width).unwrap();
            prop_assert_eq!(field.len(), width);
            prop_assert_eq!(&field[width - value.len()..], value.as_slice());
            prop_assert!(field[..width - value.len()].iter().all(|byte| *byte == 0));
        }
    }
}
