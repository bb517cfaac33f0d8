//! Parsing private keys and extracting the fields a token needs to import them.
//!
//! Parsing itself is delegated to a [KeyCodec]. The extractor then exports every numeric field of the key at the
//! fixed width the token template expects: RSA fields are sized after the configured modulus length, EC keys are
//! restricted to P-256 and carry a 32-byte scalar.

use std::fmt::Debug;

use pki_codec::integer::strip_sign_pad;
use pki_codec::normalize_unsigned;
use pki_codec::oid::SECP256R1_OID;
use pki_codec::oid::SECP256R1_OID_DER;
use pki_codec::IntegerError;
use tracing::debug;
use zeroize::Zeroizing;

use crate::store::KeyType;

mod rustcrypto;

pub use rustcrypto::RustCryptoKeyCodec;

/// Width of RSA public exponents, enough for 65537.
pub const RSA_PUBLIC_EXPONENT_LEN: usize = 3;

/// Width of P-256 private scalars.
pub const EC_P256_SCALAR_LEN: usize = 32;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("Unsupported curve {0}: only secp256r1 (P-256) keys can be provisioned")]
    UnsupportedCurve(String),

    #[error("Unsupported key algorithm {0}")]
    UnsupportedKeyType(String),

    #[error("Private key is an {actual} key, but an {declared} key was expected")]
    KeyTypeMismatch { declared: KeyType, actual: KeyType },

    #[error("RSA modulus is {actual} bits long, expected {expected} bits")]
    ModulusSizeMismatch { expected: u32, actual: usize },

    #[error("Failed to parse private key: {0}")]
    ParseFailure(String),

    #[error("Failed to allocate {0} bytes for a key field")]
    AllocationFailure(usize),
}

impl From<IntegerError> for ExtractError {
    fn from(err: IntegerError) -> Self {
        match err {
            IntegerError::AllocationFailure(len) => ExtractError::AllocationFailure(len),
            other => ExtractError::ParseFailure(other.to_string()),
        }
    }
}

/// Numeric fields a parsed key can export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyField {
    Modulus,
    PublicExponent,
    PrivateExponent,
    Prime1,
    Prime2,
    Exponent1,
    Exponent2,
    Coefficient,
    EcPrivateScalar,
}

/// A private key decoded by a [KeyCodec].
pub trait ParsedKey: Debug {
    fn key_type(&self) -> KeyType;

    /// Dotted OID of the curve of an EC key.
    fn curve_oid(&self) -> Option<String>;

    /// Exports a field as a big-endian integer of at most `max_len` bytes.
    ///
    /// Fields may be exported as the content of an ASN.1 INTEGER, with a zero byte in front of values whose top
    /// bit is set.
    fn export_field(
        &self,
        field: KeyField,
        max_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, ExtractError>;

    /// Uncompressed public point (`0x04 || X || Y`) of an EC key.
    fn public_point(&self) -> Option<Vec<u8>>;
}

pub trait KeyCodec {
    /// Parses a PEM or DER private key.
    fn parse_private_key(&self, input: &[u8]) -> Result<Box<dyn ParsedKey>, ExtractError>;
}

/// Fields of a private key ready to be put into a token template.
///
/// Private components are zeroed when dropped.
pub enum KeyMaterial {
    Rsa(RsaKeyMaterial),
    Ec(EcKeyMaterial),
}

impl KeyMaterial {
    pub fn key_type(&self) -> KeyType {
        match self {
            KeyMaterial::Rsa(_) => KeyType::Rsa,
            KeyMaterial::Ec(_) => KeyType::Ec,
        }
    }
}

impl Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMaterial::Rsa(rsa) => f
                .debug_struct("Rsa")
                .field("modulus_len", &rsa.modulus.len())
                .finish_non_exhaustive(),
            KeyMaterial::Ec(ec) => f
                .debug_struct("Ec")
                .field("curve", &SECP256R1_OID)
                .field("has_public_point", &ec.public_point.is_some())
                .finish_non_exhaustive(),
        }
    }
}

pub struct RsaKeyMaterial {
    pub modulus: Vec<u8>,
    pub public_exponent: Vec<u8>,
    pub private_exponent: Zeroizing<Vec<u8>>,
    pub prime1: Zeroizing<Vec<u8>>,
    pub prime2: Zeroizing<Vec<u8>>,
    pub exponent1: Zeroizing<Vec<u8>>,
    pub exponent2: Zeroizing<Vec<u8>>,
    pub coefficient: Zeroizing<Vec<u8>>,
}

pub struct EcKeyMaterial {
    pub private_scalar: Zeroizing<Vec<u8>>,
    /// DER encoded curve OID, as stored in `CKA_EC_PARAMS`.
    pub curve_oid: Vec<u8>,
    pub public_point: Option<Vec<u8>>,
}

/// Extracts the fields of `key` at the widths the token template expects.
///
/// When `declared` is set, the key must be of that type. RSA fields are `rsa_modulus_bits / 8` bytes wide (CRT
/// fields half that). Every field is exported with one byte of slack for the ASN.1 sign pad, which is dropped.
pub fn extract_key_fields(
    key: &dyn ParsedKey,
    declared: Option<KeyType>,
    rsa_modulus_bits: u32,
) -> Result<KeyMaterial, ExtractError> {
    let actual = key.key_type();
    if let Some(declared) = declared {
        if declared != actual {
            return Err(ExtractError::KeyTypeMismatch { declared, actual });
        }
    }

    match actual {
        KeyType::Rsa => extract_rsa_fields(key, rsa_modulus_bits).map(KeyMaterial::Rsa),
        KeyType::Ec => extract_ec_fields(key).map(KeyMaterial::Ec),
    }
}

fn extract_rsa_fields(key: &dyn ParsedKey, modulus_bits: u32) -> Result<RsaKeyMaterial, ExtractError> {
    let modulus_len = modulus_bits as usize / 8;
    let prime_len = modulus_len / 2;
    let field = |field: KeyField, width: usize| -> Result<Zeroizing<Vec<u8>>, ExtractError> {
        let exported = key.export_field(field, width + 1)?;
        Ok(normalize_unsigned(&exported, width)?)
    };

    let exported_modulus = key.export_field(KeyField::Modulus, modulus_len + 1)?;
    let modulus = strip_sign_pad(&exported_modulus, modulus_len)?;
    if modulus.len() != modulus_len || modulus[0] == 0 {
        let leading_zeros = modulus.iter().take_while(|b| **b == 0).count();
        return Err(ExtractError::ModulusSizeMismatch {
            expected: modulus_bits,
            actual: (modulus.len() - leading_zeros) * 8,
        });
    }
    debug!(modulus_bits, "Extracting RSA key fields");

    Ok(RsaKeyMaterial {
        modulus: modulus.to_vec(),
        public_exponent: field(KeyField::PublicExponent, RSA_PUBLIC_EXPONENT_LEN)?.to_vec(),
        private_exponent: field(KeyField::PrivateExponent, modulus_len)?,
        prime1: field(KeyField::Prime1, prime_len)?,
        prime2: field(KeyField::Prime2, prime_len)?,
        exponent1: field(KeyField::Exponent1, prime_len)?,
        exponent2: field(KeyField::Exponent2, prime_len)?,
        coefficient: field(KeyField::Coefficient, prime_len)?,
    })
}

fn extract_ec_fields(key: &dyn ParsedKey) -> Result<EcKeyMaterial, ExtractError> {
    let curve = key
        .curve_oid()
        .ok_or_else(|| ExtractError::ParseFailure("EC key without a named curve".into()))?;
    if curve != SECP256R1_OID {
        return Err(ExtractError::UnsupportedCurve(curve));
    }

    let exported = key.export_field(KeyField::EcPrivateScalar, EC_P256_SCALAR_LEN + 1)?;
    let private_scalar = normalize_unsigned(&exported, EC_P256_SCALAR_LEN)?;

    Ok(EcKeyMaterial {
        private_scalar,
        curve_oid: SECP256R1_OID_DER.to_vec(),
        public_point: key.public_point(),
    })
}
