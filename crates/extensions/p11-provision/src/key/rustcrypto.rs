use p256::elliptic_curve::sec1::ToEncodedPoint;
use pki_codec::oid::SECP256R1_OID;
use pki_codec::pem_codec::trim_trailing_nul;
use pki_codec::pem_codec::PEM_MARKER;
use pki_codec::sign_padded;
use pkcs8::ObjectIdentifier;
use pkcs8::PrivateKeyInfo;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PrivateKeyParts;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sec1::der::Decode;
use sec1::EcPrivateKey;
use tracing::debug;
use zeroize::Zeroizing;

use super::ExtractError;
use super::KeyCodec;
use super::KeyField;
use super::ParsedKey;
use crate::store::KeyType;

const EC_PUBLIC_KEY_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

/// Parses PKCS #1 RSA keys, SEC1 EC keys and unencrypted PKCS #8 keys of either type, PEM or DER encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustCryptoKeyCodec;

impl KeyCodec for RustCryptoKeyCodec {
    fn parse_private_key(&self, input: &[u8]) -> Result<Box<dyn ParsedKey>, ExtractError> {
        let input = trim_trailing_nul(input);
        if input.first() != Some(&PEM_MARKER) {
            return parse_pkcs8(input)
                .or_else(|_| parse_pkcs1(input))
                .or_else(|_| parse_sec1(input, None));
        }

        let pem = ::pem::parse(input).map_err(|e| ExtractError::ParseFailure(e.to_string()))?;
        let der = Zeroizing::new(pem.contents().to_vec());
        debug!(label = pem.tag(), "Parsing PEM private key");
        match pem.tag() {
            "RSA PRIVATE KEY" => parse_pkcs1(&der),
            "EC PRIVATE KEY" => parse_sec1(&der, None),
            "PRIVATE KEY" => parse_pkcs8(&der),
            "ENCRYPTED PRIVATE KEY" => Err(ExtractError::ParseFailure(
                "encrypted private keys are not supported".into(),
            )),
            other => Err(ExtractError::ParseFailure(format!(
                "PEM block '{other}' is not a private key"
            ))),
        }
    }
}

fn parse_pkcs1(der: &[u8]) -> Result<Box<dyn ParsedKey>, ExtractError> {
    let key = RsaPrivateKey::from_pkcs1_der(der)
        .map_err(|e| ExtractError::ParseFailure(format!("invalid PKCS #1 key: {e}")))?;
    rsa_key(key)
}

fn parse_pkcs8(der: &[u8]) -> Result<Box<dyn ParsedKey>, ExtractError> {
    let info = PrivateKeyInfo::try_from(der)
        .map_err(|e| ExtractError::ParseFailure(format!("invalid PKCS #8 key: {e}")))?;

    if info.algorithm.oid == rsa::pkcs1::ALGORITHM_OID {
        let key = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| ExtractError::ParseFailure(format!("invalid PKCS #8 RSA key: {e}")))?;
        rsa_key(key)
    } else if info.algorithm.oid == EC_PUBLIC_KEY_OID {
        let curve = info
            .algorithm
            .parameters_oid()
            .map_err(|e| ExtractError::ParseFailure(format!("invalid EC parameters: {e}")))?;
        parse_sec1(info.private_key, Some(curve.to_string()))
    } else {
        Err(ExtractError::UnsupportedKeyType(info.algorithm.oid.to_string()))
    }
}

/// Parses a SEC1 `ECPrivateKey`, whose curve is either given by the enclosing PKCS #8 structure or by its own
/// parameters.
fn parse_sec1(der: &[u8], curve: Option<String>) -> Result<Box<dyn ParsedKey>, ExtractError> {
    let key = EcPrivateKey::from_der(der)
        .map_err(|e| ExtractError::ParseFailure(format!("invalid SEC1 key: {e}")))?;

    let curve = key
        .parameters
        .and_then(|parameters| parameters.named_curve())
        .map(|oid| oid.to_string())
        .or(curve)
        .ok_or_else(|| ExtractError::ParseFailure("EC key without a named curve".into()))?;

    let secret = if curve == SECP256R1_OID {
        let secret = p256::SecretKey::from_slice(key.private_key)
            .map_err(|_| ExtractError::ParseFailure("invalid P-256 private scalar".into()))?;
        Some(secret)
    } else {
        None
    };

    Ok(Box::new(RustCryptoKey::Ec {
        curve,
        scalar: Zeroizing::new(key.private_key.to_vec()),
        secret,
    }))
}

fn rsa_key(mut key: RsaPrivateKey) -> Result<Box<dyn ParsedKey>, ExtractError> {
    if key.dp().is_none() {
        key.precompute()
            .map_err(|e| ExtractError::ParseFailure(format!("invalid RSA key: {e}")))?;
    }
    Ok(Box::new(RustCryptoKey::Rsa(key)))
}

enum RustCryptoKey {
    Rsa(RsaPrivateKey),
    Ec {
        curve: String,
        scalar: Zeroizing<Vec<u8>>,
        /// Only set for P-256 keys.
        secret: Option<p256::SecretKey>,
    },
}

impl std::fmt::Debug for RustCryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RustCryptoKey::Rsa(key) => f
                .debug_struct("Rsa")
                .field("bits", &(key.size() * 8))
                .finish_non_exhaustive(),
            RustCryptoKey::Ec { curve, .. } => f
                .debug_struct("Ec")
                .field("curve", curve)
                .finish_non_exhaustive(),
        }
    }
}

impl ParsedKey for RustCryptoKey {
    fn key_type(&self) -> KeyType {
        match self {
            RustCryptoKey::Rsa(_) => KeyType::Rsa,
            RustCryptoKey::Ec { .. } => KeyType::Ec,
        }
    }

    fn curve_oid(&self) -> Option<String> {
        match self {
            RustCryptoKey::Rsa(_) => None,
            RustCryptoKey::Ec { curve, .. } => Some(curve.clone()),
        }
    }

    fn export_field(
        &self,
        field: KeyField,
        max_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, ExtractError> {
        let exported = match (self, field) {
            (RustCryptoKey::Rsa(key), field) => {
                Zeroizing::new(sign_padded(&rsa_field(key, field)?))
            }
            (RustCryptoKey::Ec { scalar, .. }, KeyField::EcPrivateScalar) => scalar.clone(),
            (RustCryptoKey::Ec { .. }, field) => {
                return Err(ExtractError::ParseFailure(format!(
                    "EC keys have no {field:?} field"
                )))
            }
        };

        if exported.len() > max_len {
            return Err(ExtractError::ParseFailure(format!(
                "{field:?} is {} bytes long, more than the {max_len} bytes expected",
                exported.len()
            )));
        }
        Ok(exported)
    }

    fn public_point(&self) -> Option<Vec<u8>> {
        match self {
            RustCryptoKey::Ec {
                secret: Some(secret),
                ..
            } => Some(secret.public_key().to_encoded_point(false).as_bytes().to_vec()),
            _ => None,
        }
    }
}

/// Returns the unsigned big-endian value of an RSA key field.
fn rsa_field(key: &RsaPrivateKey, field: KeyField) -> Result<Zeroizing<Vec<u8>>, ExtractError> {
    let missing = || ExtractError::ParseFailure(format!("RSA key has no {field:?}"));
    let value = match field {
        KeyField::Modulus => key.n().to_bytes_be(),
        KeyField::PublicExponent => key.e().to_bytes_be(),
        KeyField::PrivateExponent => key.d().to_bytes_be(),
        KeyField::Prime1 => key.primes().first().ok_or_else(missing)?.to_bytes_be(),
        KeyField::Prime2 => key.primes().get(1).ok_or_else(missing)?.to_bytes_be(),
        KeyField::Exponent1 => key.dp().ok_or_else(missing)?.to_bytes_be(),
        KeyField::Exponent2 => key.dq().ok_or_else(missing)?.to_bytes_be(),
        // computed on demand, so wiped as soon as its bytes are taken
        KeyField::Coefficient => Zeroizing::new(key.crt_coefficient().ok_or_else(missing)?).to_bytes_be(),
        KeyField::EcPrivateScalar => return Err(missing()),
    };
    Ok(Zeroizing::new(value))
}
