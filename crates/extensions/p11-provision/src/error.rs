use pki_codec::CodecError;
use pki_codec::EncodeError;

use crate::export::ExportError;
use crate::key::ExtractError;
use crate::store::ObjectHandle;
use crate::store::StoreError;
use crate::template::TemplateError;

/// A fatal provisioning failure.
///
/// Failures that only degrade the result, such as a token unable to destroy stale objects, are reported as
/// [Advisory](crate::provision::Advisory) instead.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("Invalid certificate '{label}'")]
    Certificate {
        label: String,
        #[source]
        source: CodecError,
    },

    #[error("Invalid private key")]
    PrivateKey(#[from] ExtractError),

    #[error("Failed to build object template")]
    Template(#[from] TemplateError),

    #[error("Failed to encode signature")]
    Signature(#[from] EncodeError),

    #[error("Failed to export public key")]
    PublicKeyExport(#[from] ExportError),

    #[error("Token operation failed")]
    Store(#[from] StoreError),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Private key {private_key} does not match public key {public_key}")]
    KeyPairMismatch {
        private_key: ObjectHandle,
        public_key: ObjectHandle,
    },

    #[error("Nothing to provision: no certificate nor private key given and key generation is disabled")]
    NothingToProvision,
}

/// Error taxonomy shared by all provisioning failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedInput,
    UnsupportedCurve,
    UnsupportedOperation,
    ParseFailure,
    StoreError,
    AllocationFailure,
    LengthMismatch,
    KeyPairMismatch,
}

impl ProvisioningError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisioningError::Certificate { source, .. } => match source {
                CodecError::MalformedInput => ErrorKind::MalformedInput,
                CodecError::ConversionFailed(_) => ErrorKind::MalformedInput,
            },
            ProvisioningError::PrivateKey(err) => match err {
                ExtractError::UnsupportedCurve(_) => ErrorKind::UnsupportedCurve,
                ExtractError::UnsupportedKeyType(_) => ErrorKind::UnsupportedOperation,
                ExtractError::AllocationFailure(_) => ErrorKind::AllocationFailure,
                ExtractError::KeyTypeMismatch { .. }
                | ExtractError::ModulusSizeMismatch { .. }
                | ExtractError::ParseFailure(_) => ErrorKind::ParseFailure,
            },
            ProvisioningError::Template(err) => match err {
                TemplateError::AllocationFailure(_) => ErrorKind::AllocationFailure,
                TemplateError::MissingEcPoint | TemplateError::InvalidEcPoint(_) => {
                    ErrorKind::ParseFailure
                }
            },
            ProvisioningError::Signature(err) => match err {
                EncodeError::LengthMismatch { .. } => ErrorKind::LengthMismatch,
                EncodeError::MalformedSignature(_) | EncodeError::Der(_) => ErrorKind::MalformedInput,
            },
            ProvisioningError::PublicKeyExport(err) => match err {
                ExportError::NotEcKey(_) => ErrorKind::UnsupportedOperation,
                ExportError::UnsupportedCurve(_) => ErrorKind::UnsupportedCurve,
                ExportError::MalformedPoint { .. } => ErrorKind::MalformedInput,
                ExportError::AllocationFailure(_) => ErrorKind::AllocationFailure,
                ExportError::Store(_) => ErrorKind::StoreError,
            },
            ProvisioningError::Store(_) => ErrorKind::StoreError,
            ProvisioningError::UnsupportedOperation(_) | ProvisioningError::NothingToProvision => {
                ErrorKind::UnsupportedOperation
            }
            ProvisioningError::KeyPairMismatch { .. } => ErrorKind::KeyPairMismatch,
        }
    }
}
