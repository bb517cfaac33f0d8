//! Device credential provisioning for PKCS #11 tokens.
//!
//! Imports a device certificate and private key onto a token, or generates a P-256 key pair on it when no key is
//! supplied, then checks the result: the private key must sign for the public key and the certificate should be
//! issued for it.
//!
//! The token is reached through the [store::CredentialStore] trait, implemented for real PKCS #11 modules by
//! [store::CryptokiStore] and in memory by [store::InMemoryStore]. Private keys are parsed by a [key::KeyCodec].

pub mod config;
pub mod error;
pub mod export;
pub mod key;
pub mod provision;
pub mod store;
pub mod template;

pub use config::Labels;
pub use config::ProvisioningConfig;
pub use error::ErrorKind;
pub use error::ProvisioningError;
pub use key::RustCryptoKeyCodec;
pub use provision::destroy_credentials;
pub use provision::provision_device;
pub use provision::Advisory;
pub use provision::ProvisionedState;
pub use provision::ProvisioningParameters;
pub use provision::ProvisioningReport;
