use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::Signature;
use p256::ecdsa::VerifyingKey;
use p256::pkcs8::DecodePublicKey;
use pki_codec::decode_ecdsa_signature;
use pki_codec::reencode_ecdsa_signature;
use pki_codec::SpkiError;
use tracing::debug;
use x509_parser::prelude::FromDer;
use x509_parser::prelude::X509Certificate;

use super::Advisory;
use crate::error::ProvisioningError;
use crate::export::ExportError;
use crate::store::CredentialStore;
use crate::store::Mechanism;
use crate::store::ObjectHandle;

/// Length of the random challenge signed to check a key pair, the size of a SHA-256 digest.
const CHALLENGE_LEN: usize = 32;

/// Checks that the private key signs for the public key whose SPKI is `public_key_der`.
///
/// The token signs a random challenge with `CKM_ECDSA`; the raw signature goes through the DER encoding used by
/// TLS before being verified locally. Returns an advisory when the token cannot sign.
pub(super) fn verify_key_pair<S: CredentialStore + ?Sized>(
    store: &S,
    private_key: ObjectHandle,
    public_key: ObjectHandle,
    public_key_der: &[u8],
) -> Result<Option<Advisory>, ProvisioningError> {
    let verifying_key = VerifyingKey::from_public_key_der(public_key_der).map_err(|err| {
        debug!(%public_key, "Invalid P-256 public key: {err}");
        ExportError::MalformedPoint {
            handle: public_key,
            source: SpkiError::NotP256,
        }
    })?;

    let mut challenge = [0u8; CHALLENGE_LEN];
    if let Err(err) = store.generate_random(&mut challenge) {
        return Ok(Some(Advisory::KeyPairNotVerified(err)));
    }

    let raw = match store.sign(Mechanism::Ecdsa, private_key, &challenge) {
        Ok(raw) => raw,
        Err(err) if err.is_not_supported() => return Ok(Some(Advisory::KeyPairNotVerified(err))),
        Err(err) => return Err(err.into()),
    };
    let der = reencode_ecdsa_signature(&raw)?;
    let raw = decode_ecdsa_signature(&der)?;

    let mismatch = ProvisioningError::KeyPairMismatch {
        private_key,
        public_key,
    };
    let signature = Signature::from_slice(&raw).map_err(|_| mismatch.clone())?;
    verifying_key
        .verify_prehash(&challenge, &signature)
        .map_err(|_| mismatch)?;

    debug!(%private_key, %public_key, "Key pair verified");
    Ok(None)
}

/// Checks that `certificate_der` certifies the public key whose SPKI is `public_key_der`.
pub(super) fn check_certificate_key(
    label: &str,
    certificate_der: &[u8],
    public_key_der: &[u8],
) -> Option<Advisory> {
    let certificate = match X509Certificate::from_der(certificate_der) {
        Ok((_, certificate)) => certificate,
        Err(err) => {
            return Some(Advisory::CertificateNotChecked {
                label: label.to_string(),
                reason: format!("{err}"),
            })
        }
    };

    if certificate.public_key().raw == public_key_der {
        None
    } else {
        Some(Advisory::CertificateKeyMismatch {
            label: label.to_string(),
        })
    }
}
