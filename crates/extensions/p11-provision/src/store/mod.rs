//! The credential store: a token holding keys and certificates by label and class.
//!
//! [CredentialStore] is the subset of PKCS #11 session operations provisioning needs. It is implemented by
//! [CryptokiStore] for real PKCS #11 modules and by [InMemoryStore], a software token used for dry runs and
//! tests.
//!
//! Stores are used through a shared reference and serialize their own operations internally, so a token can
//! be used by other consumers while a device is being provisioned.

use std::fmt::Display;
use std::num::NonZeroU64;

pub use cryptoki::error::RvError;

mod attribute;
mod memory;
mod pkcs11;

pub use attribute::find_attribute;
pub use attribute::Attribute;
pub use attribute::AttributeType;
pub use attribute::CertificateType;
pub use attribute::KeyType;
pub use attribute::Mechanism;
pub use attribute::ObjectClass;
pub use memory::InMemoryStore;
pub use pkcs11::CryptokiConfig;
pub use pkcs11::CryptokiStore;
pub use pkcs11::SecretString;

/// Handle of an object held by a store.
///
/// `CK_INVALID_HANDLE` (0) has no representation, so a handle that exists always designates an object the store
/// returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(NonZeroU64);

impl ObjectHandle {
    pub fn new(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(ObjectHandle)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl Display for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    /// Token label, blank padded to 32 characters by most tokens.
    pub label: String,
}

/// The PKCS #11 function that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    CreateObject,
    DestroyObject,
    FindObjects,
    GetAttributeValue,
    GenerateKeyPair,
    GenerateRandom,
    Sign,
    Verify,
    GetTokenInfo,
}

impl Display for StoreOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StoreOperation::CreateObject => "C_CreateObject",
            StoreOperation::DestroyObject => "C_DestroyObject",
            StoreOperation::FindObjects => "C_FindObjects",
            StoreOperation::GetAttributeValue => "C_GetAttributeValue",
            StoreOperation::GenerateKeyPair => "C_GenerateKeyPair",
            StoreOperation::GenerateRandom => "C_GenerateRandom",
            StoreOperation::Sign => "C_Sign",
            StoreOperation::Verify => "C_Verify",
            StoreOperation::GetTokenInfo => "C_GetTokenInfo",
        };
        f.write_str(name)
    }
}

/// A failed store operation, with the return value reported by the token.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed: {rv}")]
pub struct StoreError {
    pub operation: StoreOperation,
    pub rv: RvError,
}

impl StoreError {
    pub fn new(operation: StoreOperation, rv: RvError) -> Self {
        StoreError { operation, rv }
    }

    /// The token does not implement the operation or mechanism.
    pub fn is_not_supported(&self) -> bool {
        matches!(
            self.rv,
            RvError::FunctionNotSupported | RvError::MechanismInvalid
        )
    }

    /// The token has no room left for a new object.
    pub fn is_out_of_device_memory(&self) -> bool {
        matches!(self.rv, RvError::DeviceMemory)
    }
}

pub trait CredentialStore {
    fn create_object(&self, template: &[Attribute]) -> Result<ObjectHandle, StoreError>;

    fn destroy_object(&self, handle: ObjectHandle) -> Result<(), StoreError>;

    /// Returns all objects with the given label and class.
    fn find_objects(
        &self,
        label: &str,
        class: ObjectClass,
    ) -> Result<Vec<ObjectHandle>, StoreError>;

    /// Reads the value of an attribute.
    ///
    /// Returns the length of the value. When `buffer` is `None` nothing is copied, which is how callers learn
    /// the size to allocate. A buffer too small for the value fails with `CKR_BUFFER_TOO_SMALL`.
    fn get_attribute(
        &self,
        handle: ObjectHandle,
        attribute: AttributeType,
        buffer: Option<&mut [u8]>,
    ) -> Result<usize, StoreError>;

    /// Generates a key pair, returning the public and the private key handles.
    fn generate_key_pair(
        &self,
        mechanism: Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), StoreError>;

    fn generate_random(&self, buffer: &mut [u8]) -> Result<(), StoreError>;

    fn sign(
        &self,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, StoreError>;

    fn verify(
        &self,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), StoreError>;

    fn token_info(&self) -> Result<TokenInfo, StoreError>;

    /// Returns the first object with the given label and class, if any.
    fn find_object(
        &self,
        label: &str,
        class: ObjectClass,
    ) -> Result<Option<ObjectHandle>, StoreError> {
        Ok(self.find_objects(label, class)?.into_iter().next())
    }
}

/// Reads a whole attribute value, querying its length first.
pub fn read_attribute<S: CredentialStore + ?Sized>(
    store: &S,
    handle: ObjectHandle,
    attribute: AttributeType,
) -> Result<Vec<u8>, StoreError> {
    let len = store.get_attribute(handle, attribute, None)?;
    let mut value = vec![0; len];
    let written = store.get_attribute(handle, attribute, Some(&mut value))?;
    value.truncate(written);
    Ok(value)
}
