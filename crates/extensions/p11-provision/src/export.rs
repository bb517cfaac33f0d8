//! Exporting the public key held by the token as a DER SubjectPublicKeyInfo.
//!
//! Only P-256 keys can be exported. The SPKI is assembled in place: the `CKA_EC_POINT` OCTET STRING is read
//! into a buffer leaving room for the fixed SPKI header, whose last two bytes overwrite the OCTET STRING header.

use pki_codec::oid::SECP256R1_OID_DER;
use pki_codec::spki::p256_spki_from_point;
use pki_codec::spki::unwrap_ec_point;
use pki_codec::spki::EC_POINT_HEADER_LEN;
use pki_codec::spki::P256_EC_POINT_DER_LEN;
use pki_codec::spki::P256_SPKI_HEADER;
use pki_codec::SpkiError;
use tracing::debug;

use crate::store::read_attribute;
use crate::store::AttributeType;
use crate::store::CredentialStore;
use crate::store::ObjectHandle;
use crate::store::RvError;
use crate::store::StoreError;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExportError {
    #[error("Object {0} is not an EC key: only EC public keys can be exported")]
    NotEcKey(ObjectHandle),

    #[error("Public key {0} is not on the P-256 curve")]
    UnsupportedCurve(ObjectHandle),

    #[error("Public key {handle} holds a malformed EC point")]
    MalformedPoint {
        handle: ObjectHandle,
        #[source]
        source: SpkiError,
    },

    #[error("Failed to allocate {0} bytes for the public key")]
    AllocationFailure(usize),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Returns the DER SubjectPublicKeyInfo of the P-256 public key object `handle`.
pub fn export_public_key_der<S: CredentialStore + ?Sized>(
    store: &S,
    handle: ObjectHandle,
) -> Result<Vec<u8>, ExportError> {
    let ec_params = match read_attribute(store, handle, AttributeType::EcParams) {
        Ok(ec_params) => ec_params,
        Err(err) if err.rv == RvError::AttributeTypeInvalid => {
            return Err(ExportError::NotEcKey(handle))
        }
        Err(err) => return Err(err.into()),
    };
    if ec_params != SECP256R1_OID_DER {
        return Err(ExportError::UnsupportedCurve(handle));
    }

    let point_len = store.get_attribute(handle, AttributeType::EcPoint, None)?;
    if point_len != P256_EC_POINT_DER_LEN {
        // not the expected OCTET STRING: possibly a raw point, which is accepted as well
        let ec_point = read_attribute(store, handle, AttributeType::EcPoint)?;
        let point = unwrap_ec_point(&ec_point)
            .map_err(|source| ExportError::MalformedPoint { handle, source })?;
        return p256_spki_from_point(point)
            .map_err(|source| ExportError::MalformedPoint { handle, source });
    }

    let header_len = P256_SPKI_HEADER.len();
    let spki_len = point_len + header_len - EC_POINT_HEADER_LEN;
    let mut spki = Vec::new();
    spki.try_reserve_exact(spki_len)
        .map_err(|_| ExportError::AllocationFailure(spki_len))?;
    spki.resize(spki_len, 0);

    let offset = header_len - EC_POINT_HEADER_LEN;
    let written = store.get_attribute(handle, AttributeType::EcPoint, Some(&mut spki[offset..]))?;
    unwrap_ec_point(&spki[offset..offset + written])
        .map_err(|source| ExportError::MalformedPoint { handle, source })?;

    spki[..header_len].copy_from_slice(&P256_SPKI_HEADER);
    debug!(%handle, len = spki.len(), "Exported public key");
    Ok(spki)
}
