//! A software token keeping its objects in memory.
//!
//! Supports what provisioning needs and nothing more: object creation and lookup, P-256 key pair generation and
//! raw `CKM_ECDSA` signing. Token limitations seen on constrained devices (a full object store, no support for
//! destroying objects or for signing) can be switched on to exercise the degraded paths.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::Signature;
use p256::ecdsa::SigningKey;
use p256::ecdsa::VerifyingKey;
use pki_codec::oid::SECP256R1_OID_DER;
use pki_codec::spki::ec_point_octet_string;
use pki_codec::spki::unwrap_ec_point;
use rand::Rng;
use tracing::trace;
use zeroize::Zeroizing;

use super::find_attribute;
use super::Attribute;
use super::AttributeType;
use super::CredentialStore;
use super::KeyType;
use super::Mechanism;
use super::ObjectClass;
use super::ObjectHandle;
use super::RvError;
use super::StoreError;
use super::StoreOperation;
use super::TokenInfo;

#[derive(Debug)]
pub struct InMemoryStore {
    label: String,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    last_handle: u64,
    objects: BTreeMap<ObjectHandle, StoredObject>,
    capacity: Option<usize>,
    destroy_unsupported: bool,
    signing_unsupported: bool,
    created_objects: usize,
    generated_key_pairs: usize,
}

#[derive(Debug)]
struct StoredObject {
    attributes: Vec<Attribute>,
    signing_key: Option<SigningKey>,
}

impl StoredObject {
    fn class(&self) -> Option<ObjectClass> {
        match find_attribute(&self.attributes, AttributeType::Class) {
            Some(Attribute::Class(class)) => Some(*class),
            _ => None,
        }
    }

    fn has_label(&self, label: &str) -> bool {
        matches!(
            find_attribute(&self.attributes, AttributeType::Label),
            Some(Attribute::Label(l)) if l == label
        )
    }
}

impl InMemoryStore {
    /// Creates an empty token. Like PKCS #11 token labels, `label` is blank padded to 32 characters.
    pub fn new(label: &str) -> Self {
        InMemoryStore {
            label: format!("{label:<32}"),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Limits the number of objects the token can hold.
    pub fn with_capacity(self, capacity: usize) -> Self {
        self.lock().capacity = Some(capacity);
        self
    }

    /// Makes `C_DestroyObject` fail with `CKR_FUNCTION_NOT_SUPPORTED`.
    pub fn without_destroy(self) -> Self {
        self.lock().destroy_unsupported = true;
        self
    }

    /// Makes `C_Sign` fail with `CKR_FUNCTION_NOT_SUPPORTED`.
    pub fn without_signing(self) -> Self {
        self.lock().signing_unsupported = true;
        self
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Handles of all objects, in creation order.
    pub fn handles(&self) -> Vec<ObjectHandle> {
        self.lock().objects.keys().copied().collect()
    }

    /// Number of objects created, by `C_CreateObject` or by key generation.
    pub fn created_objects(&self) -> usize {
        self.lock().created_objects
    }

    pub fn generated_key_pairs(&self) -> usize {
        self.lock().generated_key_pairs
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(err) => err.into_inner(),
        }
    }
}

impl Inner {
    fn insert(
        &mut self,
        operation: StoreOperation,
        object: StoredObject,
    ) -> Result<ObjectHandle, StoreError> {
        if self
            .capacity
            .is_some_and(|capacity| self.objects.len() >= capacity)
        {
            return Err(StoreError::new(operation, RvError::DeviceMemory));
        }

        self.last_handle += 1;
        let handle = ObjectHandle::new(self.last_handle)
            .ok_or(StoreError::new(operation, RvError::GeneralError))?;
        self.objects.insert(handle, object);
        self.created_objects += 1;
        Ok(handle)
    }

    fn object(
        &self,
        operation: StoreOperation,
        handle: ObjectHandle,
    ) -> Result<&StoredObject, StoreError> {
        self.objects
            .get(&handle)
            .ok_or(StoreError::new(operation, RvError::ObjectHandleInvalid))
    }

    fn has_room_for(&self, count: usize) -> bool {
        self.capacity
            .is_none_or(|capacity| self.objects.len() + count <= capacity)
    }
}

impl CredentialStore for InMemoryStore {
    fn create_object(&self, template: &[Attribute]) -> Result<ObjectHandle, StoreError> {
        const OP: StoreOperation = StoreOperation::CreateObject;
        trace!(?template, "Creating object");

        let class = match find_attribute(template, AttributeType::Class) {
            Some(Attribute::Class(class)) => *class,
            _ => return Err(StoreError::new(OP, RvError::TemplateIncomplete)),
        };

        let signing_key = match (class, find_attribute(template, AttributeType::KeyType)) {
            (ObjectClass::PrivateKey, Some(Attribute::KeyType(KeyType::Ec))) => {
                if find_attribute(template, AttributeType::EcParams)
                    != Some(&Attribute::EcParams(SECP256R1_OID_DER.to_vec()))
                {
                    return Err(StoreError::new(OP, RvError::AttributeValueInvalid));
                }
                let Some(Attribute::Value(scalar)) = find_attribute(template, AttributeType::Value)
                else {
                    return Err(StoreError::new(OP, RvError::TemplateIncomplete));
                };
                let key = SigningKey::from_slice(scalar)
                    .map_err(|_| StoreError::new(OP, RvError::AttributeValueInvalid))?;
                Some(key)
            }
            _ => None,
        };

        self.lock().insert(
            OP,
            StoredObject {
                attributes: template.to_vec(),
                signing_key,
            },
        )
    }

    fn destroy_object(&self, handle: ObjectHandle) -> Result<(), StoreError> {
        const OP: StoreOperation = StoreOperation::DestroyObject;
        let mut inner = self.lock();
        if inner.destroy_unsupported {
            return Err(StoreError::new(OP, RvError::FunctionNotSupported));
        }
        inner
            .objects
            .remove(&handle)
            .map(|_| ())
            .ok_or(StoreError::new(OP, RvError::ObjectHandleInvalid))
    }

    fn find_objects(
        &self,
        label: &str,
        class: ObjectClass,
    ) -> Result<Vec<ObjectHandle>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .objects
            .iter()
            .filter(|(_, object)| object.class() == Some(class) && object.has_label(label))
            .map(|(handle, _)| *handle)
            .collect())
    }

    fn get_attribute(
        &self,
        handle: ObjectHandle,
        attribute: AttributeType,
        buffer: Option<&mut [u8]>,
    ) -> Result<usize, StoreError> {
        const OP: StoreOperation = StoreOperation::GetAttributeValue;
        let inner = self.lock();
        let object = inner.object(OP, handle)?;

        if object
            .class()
            .is_some_and(|class| attribute.is_sensitive_for(class))
        {
            return Err(StoreError::new(OP, RvError::AttributeSensitive));
        }

        let value = find_attribute(&object.attributes, attribute)
            .and_then(Attribute::as_bytes)
            .ok_or(StoreError::new(OP, RvError::AttributeTypeInvalid))?;

        if let Some(buffer) = buffer {
            let destination = buffer
                .get_mut(..value.len())
                .ok_or(StoreError::new(OP, RvError::BufferTooSmall))?;
            destination.copy_from_slice(value);
        }
        Ok(value.len())
    }

    fn generate_key_pair(
        &self,
        mechanism: Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), StoreError> {
        const OP: StoreOperation = StoreOperation::GenerateKeyPair;
        if mechanism != Mechanism::EcKeyPairGen {
            return Err(StoreError::new(OP, RvError::MechanismInvalid));
        }
        let ec_params = Attribute::EcParams(SECP256R1_OID_DER.to_vec());
        if find_attribute(public_template, AttributeType::EcParams) != Some(&ec_params) {
            return Err(StoreError::new(OP, RvError::AttributeValueInvalid));
        }

        let mut inner = self.lock();
        if !inner.has_room_for(2) {
            return Err(StoreError::new(OP, RvError::DeviceMemory));
        }

        let signing_key = random_signing_key();
        let point = signing_key.verifying_key().to_encoded_point(false);
        let ec_point = ec_point_octet_string(point.as_bytes())
            .map_err(|_| StoreError::new(OP, RvError::GeneralError))?;

        let mut public = with_defaults(public_template, ObjectClass::PublicKey);
        public.push(Attribute::EcPoint(ec_point));
        let mut private = with_defaults(private_template, ObjectClass::PrivateKey);
        if find_attribute(&private, AttributeType::EcParams).is_none() {
            private.push(ec_params);
        }

        let public = inner.insert(
            OP,
            StoredObject {
                attributes: public,
                signing_key: None,
            },
        )?;
        let private = inner.insert(
            OP,
            StoredObject {
                attributes: private,
                signing_key: Some(signing_key),
            },
        )?;
        inner.generated_key_pairs += 1;

        Ok((public, private))
    }

    fn generate_random(&self, buffer: &mut [u8]) -> Result<(), StoreError> {
        rand::rng().fill(buffer);
        Ok(())
    }

    fn sign(
        &self,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, StoreError> {
        const OP: StoreOperation = StoreOperation::Sign;
        let inner = self.lock();
        if inner.signing_unsupported {
            return Err(StoreError::new(OP, RvError::FunctionNotSupported));
        }
        if mechanism != Mechanism::Ecdsa {
            return Err(StoreError::new(OP, RvError::MechanismInvalid));
        }

        let signing_key = inner
            .object(OP, key)?
            .signing_key
            .as_ref()
            .ok_or(StoreError::new(OP, RvError::KeyHandleInvalid))?;
        let signature: Signature = signing_key
            .sign_prehash(data)
            .map_err(|_| StoreError::new(OP, RvError::DataLenRange))?;

        Ok(signature.to_bytes().to_vec())
    }

    fn verify(
        &self,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), StoreError> {
        const OP: StoreOperation = StoreOperation::Verify;
        if mechanism != Mechanism::Ecdsa {
            return Err(StoreError::new(OP, RvError::MechanismInvalid));
        }

        let inner = self.lock();
        let object = inner.object(OP, key)?;
        let verifying_key = match (
            &object.signing_key,
            find_attribute(&object.attributes, AttributeType::EcPoint),
        ) {
            (Some(signing_key), _) => VerifyingKey::from(signing_key),
            (None, Some(Attribute::EcPoint(ec_point))) => unwrap_ec_point(ec_point)
                .ok()
                .and_then(|point| VerifyingKey::from_sec1_bytes(point).ok())
                .ok_or(StoreError::new(OP, RvError::KeyHandleInvalid))?,
            (None, _) => return Err(StoreError::new(OP, RvError::KeyHandleInvalid)),
        };

        let signature = Signature::from_slice(signature)
            .map_err(|_| StoreError::new(OP, RvError::SignatureLenRange))?;
        verifying_key
            .verify_prehash(data, &signature)
            .map_err(|_| StoreError::new(OP, RvError::SignatureInvalid))
    }

    fn token_info(&self) -> Result<TokenInfo, StoreError> {
        Ok(TokenInfo {
            label: self.label.clone(),
        })
    }
}

fn random_signing_key() -> SigningKey {
    loop {
        let scalar = Zeroizing::new(rand::random::<[u8; 32]>());
        // rejects zero and values not below the group order
        if let Ok(key) = SigningKey::from_slice(scalar.as_slice()) {
            return key;
        }
    }
}

fn with_defaults(template: &[Attribute], class: ObjectClass) -> Vec<Attribute> {
    let mut attributes = template.to_vec();
    if find_attribute(&attributes, AttributeType::Class).is_none() {
        attributes.push(Attribute::Class(class));
    }
    if find_attribute(&attributes, AttributeType::KeyType).is_none() {
        attributes.push(Attribute::KeyType(KeyType::Ec));
    }
    attributes
}
