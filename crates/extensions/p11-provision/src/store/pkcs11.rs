//! [CredentialStore] backed by a PKCS #11 module loaded with the cryptoki crate.

use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Display;
use std::num::NonZeroU64;
use std::os::raw::c_ulong;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::Context;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use cryptoki::context::CInitializeArgs;
use cryptoki::context::CInitializeFlags;
use cryptoki::context::Pkcs11;
use cryptoki::error::Error;
use cryptoki::mechanism::Mechanism as CkMechanism;
use cryptoki::object::Attribute as CkAttribute;
use cryptoki::object::AttributeInfo;
use cryptoki::object::AttributeType as CkAttributeType;
use cryptoki::object::CertificateType as CkCertificateType;
use cryptoki::object::KeyType as CkKeyType;
use cryptoki::object::ObjectClass as CkObjectClass;
use cryptoki::object::ObjectHandle as CkObjectHandle;
use cryptoki::session::Session;
use cryptoki::session::UserType;
use cryptoki::types::AuthPin;
use tracing::debug;
use tracing::instrument;
use tracing::trace;
use zeroize::Zeroize;

use super::Attribute;
use super::AttributeType;
use super::CertificateType;
use super::CredentialStore;
use super::KeyType;
use super::Mechanism;
use super::ObjectClass;
use super::ObjectHandle;
use super::RvError;
use super::StoreError;
use super::StoreOperation;
use super::TokenInfo;

/// A secret string that should not be printed by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(string: String) -> Self {
        Self(string)
    }
}

impl From<SecretString> for AuthPin {
    fn from(value: SecretString) -> Self {
        AuthPin::new(value.0.into())
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        SecretString::new(value)
    }
}

impl Display for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// How to reach the token to provision.
#[derive(Clone)]
pub struct CryptokiConfig {
    pub module_path: Utf8PathBuf,
    pub pin: SecretString,
    /// Label of the token to use. The first slot with a token is used when not set.
    pub token_label: Option<String>,
}

impl Debug for CryptokiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptokiConfig")
            .field("module_path", &self.module_path)
            .field("pin", &"[REDACTED]")
            .field("token_label", &self.token_label)
            .finish()
    }
}

/// A logged-in read-write session on a PKCS #11 token.
///
/// Object handles handed out are our own: cryptoki handles can't be built back from an integer, so every handle
/// the token returns is registered in a table and gets a stable id for the lifetime of the store.
pub struct CryptokiStore {
    session: Mutex<Session>,
    handles: Mutex<HandleTable>,
    token_info: TokenInfo,
}

#[derive(Default)]
struct HandleTable {
    last_id: u64,
    by_id: HashMap<ObjectHandle, CkObjectHandle>,
    by_handle: HashMap<c_ulong, ObjectHandle>,
}

impl HandleTable {
    fn register(&mut self, handle: CkObjectHandle) -> ObjectHandle {
        if let Some(id) = self.by_handle.get(&handle.handle()) {
            return *id;
        }
        let id = ObjectHandle(NonZeroU64::MIN.saturating_add(self.last_id));
        self.last_id += 1;
        self.by_id.insert(id, handle);
        self.by_handle.insert(handle.handle(), id);
        id
    }

    fn get(&self, operation: StoreOperation, id: ObjectHandle) -> Result<CkObjectHandle, StoreError> {
        self.by_id
            .get(&id)
            .copied()
            .ok_or(StoreError::new(operation, RvError::ObjectHandleInvalid))
    }

    fn forget(&mut self, id: ObjectHandle) {
        if let Some(handle) = self.by_id.remove(&id) {
            self.by_handle.remove(&handle.handle());
        }
    }
}

impl Debug for CryptokiStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptokiStore")
            .field("token_info", &self.token_info)
            .finish_non_exhaustive()
    }
}

impl CryptokiStore {
    /// Loads the module, selects the token and logs in as the user.
    #[instrument(skip_all)]
    pub fn open(config: &CryptokiConfig) -> anyhow::Result<Self> {
        debug!(?config, "Opening PKCS#11 session");
        let context = load(&config.module_path)?;
        context
            .initialize(CInitializeArgs::new(CInitializeFlags::OS_LOCKING_OK))
            .context("Failed to initialize PKCS#11 module")?;

        let slots_with_tokens = context.get_slots_with_token()?;
        let tokens: Result<Vec<_>, _> = slots_with_tokens
            .iter()
            .map(|s| {
                context
                    .get_token_info(*s)
                    .context("Failed to get token info")
            })
            .collect();
        let tokens = tokens?;

        let wanted_label = config.token_label.as_deref();
        let (slot, token_info) = slots_with_tokens
            .into_iter()
            .zip(tokens)
            .find(|(_, t)| wanted_label.is_none_or(|l| t.label().trim_end() == l))
            .context("Didn't find a slot to use. The device may be disconnected.")?;
        debug!(?slot, ?token_info, "Selected slot");

        let session = context
            .open_rw_session(slot)
            .context("Failed to open a read-write session")?;
        let pin = AuthPin::from(config.pin.clone());
        session
            .login(UserType::User, Some(&pin))
            .context("Failed to log in to the token")?;

        Ok(CryptokiStore {
            session: Mutex::new(session),
            handles: Mutex::new(HandleTable::default()),
            token_info: TokenInfo {
                label: token_info.label().to_string(),
            },
        })
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        match self.session.lock() {
            Ok(s) => s,
            Err(e) => e.into_inner(),
        }
    }

    fn handles(&self) -> MutexGuard<'_, HandleTable> {
        match self.handles.lock() {
            Ok(h) => h,
            Err(e) => e.into_inner(),
        }
    }
}

fn load(module_path: &Utf8Path) -> anyhow::Result<Pkcs11> {
    debug!(%module_path, "Loading PKCS#11 module");
    Pkcs11::new(module_path).context("Failed to load PKCS#11 dynamic object")
}

impl CredentialStore for CryptokiStore {
    fn create_object(&self, template: &[Attribute]) -> Result<ObjectHandle, StoreError> {
        const OP: StoreOperation = StoreOperation::CreateObject;
        trace!(?template, "Creating object");

        let mut ck_template: Vec<_> = template.iter().map(to_cryptoki_attribute).collect();
        let created = self.session().create_object(&ck_template);
        wipe(&mut ck_template);

        let handle = created.map_err(|e| store_error(OP, e))?;
        Ok(self.handles().register(handle))
    }

    fn destroy_object(&self, handle: ObjectHandle) -> Result<(), StoreError> {
        const OP: StoreOperation = StoreOperation::DestroyObject;
        let ck_handle = self.handles().get(OP, handle)?;
        self.session()
            .destroy_object(ck_handle)
            .map_err(|e| store_error(OP, e))?;
        self.handles().forget(handle);
        Ok(())
    }

    fn find_objects(
        &self,
        label: &str,
        class: ObjectClass,
    ) -> Result<Vec<ObjectHandle>, StoreError> {
        let template = [
            CkAttribute::Label(label.as_bytes().to_vec()),
            CkAttribute::Class(to_cryptoki_class(class)),
        ];
        let objects = self
            .session()
            .find_objects(&template)
            .map_err(|e| store_error(StoreOperation::FindObjects, e))?;
        trace!(label, ?class, ?objects, "Objects found in the token");

        let mut handles = self.handles();
        Ok(objects.into_iter().map(|o| handles.register(o)).collect())
    }

    fn get_attribute(
        &self,
        handle: ObjectHandle,
        attribute: AttributeType,
        buffer: Option<&mut [u8]>,
    ) -> Result<usize, StoreError> {
        const OP: StoreOperation = StoreOperation::GetAttributeValue;
        let ck_handle = self.handles().get(OP, handle)?;
        let ck_type = to_cryptoki_attribute_type(attribute);

        let attrs = self
            .session()
            .get_attributes(ck_handle, &[ck_type])
            .map_err(|e| store_error(OP, e))?;
        let Some(mut attr) = attrs.into_iter().next() else {
            // cryptoki leaves out attributes the object lacks as well as those the token refuses to reveal
            let info = self
                .session()
                .get_attribute_info(ck_handle, &[ck_type])
                .map_err(|e| store_error(OP, e))?;
            let rv = info
                .first()
                .map_or(RvError::AttributeSensitive, omitted_attribute_rv);
            trace!(%handle, ?attribute, ?info, "Attribute omitted by the token");
            return Err(StoreError::new(OP, rv));
        };

        let result = match cryptoki_attribute_bytes(&attr) {
            None => Err(StoreError::new(OP, RvError::AttributeTypeInvalid)),
            Some(value) => match buffer {
                None => Ok(value.len()),
                Some(buffer) => match buffer.get_mut(..value.len()) {
                    Some(destination) => {
                        destination.copy_from_slice(value);
                        Ok(value.len())
                    }
                    None => Err(StoreError::new(OP, RvError::BufferTooSmall)),
                },
            },
        };
        wipe(std::slice::from_mut(&mut attr));
        result
    }

    #[instrument(skip_all)]
    fn generate_key_pair(
        &self,
        mechanism: Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), StoreError> {
        const OP: StoreOperation = StoreOperation::GenerateKeyPair;
        let public: Vec<_> = public_template.iter().map(to_cryptoki_attribute).collect();
        let private: Vec<_> = private_template.iter().map(to_cryptoki_attribute).collect();

        trace!(?public_template, ?private_template, "Generating keypair");
        let (public, private) = self
            .session()
            .generate_key_pair(&to_cryptoki_mechanism(mechanism), &public, &private)
            .map_err(|e| store_error(OP, e))?;

        let mut handles = self.handles();
        Ok((handles.register(public), handles.register(private)))
    }

    fn generate_random(&self, buffer: &mut [u8]) -> Result<(), StoreError> {
        self.session()
            .generate_random_slice(buffer)
            .map_err(|e| store_error(StoreOperation::GenerateRandom, e))
    }

    fn sign(
        &self,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, StoreError> {
        const OP: StoreOperation = StoreOperation::Sign;
        let ck_key = self.handles().get(OP, key)?;
        self.session()
            .sign(&to_cryptoki_mechanism(mechanism), ck_key, data)
            .map_err(|e| store_error(OP, e))
    }

    fn verify(
        &self,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), StoreError> {
        const OP: StoreOperation = StoreOperation::Verify;
        let ck_key = self.handles().get(OP, key)?;
        self.session()
            .verify(&to_cryptoki_mechanism(mechanism), ck_key, data, signature)
            .map_err(|e| store_error(OP, e))
    }

    fn token_info(&self) -> Result<TokenInfo, StoreError> {
        Ok(self.token_info.clone())
    }
}

fn store_error(operation: StoreOperation, error: Error) -> StoreError {
    let rv = match error {
        Error::Pkcs11(rv, function) => {
            debug!(?function, %rv, "PKCS#11 call failed");
            rv
        }
        other => {
            debug!(error = %other, "cryptoki call failed");
            RvError::GeneralError
        }
    };
    StoreError::new(operation, rv)
}

/// Return value matching the reason why an attribute was left out of a `C_GetAttributeValue` result.
fn omitted_attribute_rv(info: &AttributeInfo) -> RvError {
    match info {
        AttributeInfo::TypeInvalid => RvError::AttributeTypeInvalid,
        _ => RvError::AttributeSensitive,
    }
}

fn to_cryptoki_class(class: ObjectClass) -> CkObjectClass {
    match class {
        ObjectClass::PrivateKey => CkObjectClass::PRIVATE_KEY,
        ObjectClass::PublicKey => CkObjectClass::PUBLIC_KEY,
        ObjectClass::Certificate => CkObjectClass::CERTIFICATE,
    }
}

fn to_cryptoki_mechanism(mechanism: Mechanism) -> CkMechanism<'static> {
    match mechanism {
        Mechanism::EcKeyPairGen => CkMechanism::EccKeyPairGen,
        Mechanism::RsaPkcsKeyPairGen => CkMechanism::RsaPkcsKeyPairGen,
        Mechanism::Ecdsa => CkMechanism::Ecdsa,
    }
}

fn to_cryptoki_attribute(attribute: &Attribute) -> CkAttribute {
    match attribute {
        Attribute::Class(class) => CkAttribute::Class(to_cryptoki_class(*class)),
        Attribute::KeyType(KeyType::Rsa) => CkAttribute::KeyType(CkKeyType::RSA),
        Attribute::KeyType(KeyType::Ec) => CkAttribute::KeyType(CkKeyType::EC),
        Attribute::CertificateType(CertificateType::X509) => {
            CkAttribute::CertificateType(CkCertificateType::X_509)
        }
        Attribute::Label(label) => CkAttribute::Label(label.as_bytes().to_vec()),
        Attribute::Token(v) => CkAttribute::Token(*v),
        Attribute::Sign(v) => CkAttribute::Sign(*v),
        Attribute::Verify(v) => CkAttribute::Verify(*v),
        // u64 or u32 depending on the platform
        Attribute::ModulusBits(bits) => {
            CkAttribute::ModulusBits(std::os::raw::c_ulong::from(*bits).into())
        }
        Attribute::Modulus(v) => CkAttribute::Modulus(v.clone()),
        Attribute::PublicExponent(v) => CkAttribute::PublicExponent(v.clone()),
        Attribute::PrivateExponent(v) => CkAttribute::PrivateExponent(v.to_vec()),
        Attribute::Prime1(v) => CkAttribute::Prime1(v.to_vec()),
        Attribute::Prime2(v) => CkAttribute::Prime2(v.to_vec()),
        Attribute::Exponent1(v) => CkAttribute::Exponent1(v.to_vec()),
        Attribute::Exponent2(v) => CkAttribute::Exponent2(v.to_vec()),
        Attribute::Coefficient(v) => CkAttribute::Coefficient(v.to_vec()),
        Attribute::EcParams(v) => CkAttribute::EcParams(v.clone()),
        Attribute::EcPoint(v) => CkAttribute::EcPoint(v.clone()),
        Attribute::Value(v) => CkAttribute::Value(v.to_vec()),
        Attribute::Subject(v) => CkAttribute::Subject(v.clone()),
    }
}

fn to_cryptoki_attribute_type(attribute: AttributeType) -> CkAttributeType {
    match attribute {
        AttributeType::Class => CkAttributeType::Class,
        AttributeType::KeyType => CkAttributeType::KeyType,
        AttributeType::CertificateType => CkAttributeType::CertificateType,
        AttributeType::Label => CkAttributeType::Label,
        AttributeType::Token => CkAttributeType::Token,
        AttributeType::Sign => CkAttributeType::Sign,
        AttributeType::Verify => CkAttributeType::Verify,
        AttributeType::ModulusBits => CkAttributeType::ModulusBits,
        AttributeType::Modulus => CkAttributeType::Modulus,
        AttributeType::PublicExponent => CkAttributeType::PublicExponent,
        AttributeType::PrivateExponent => CkAttributeType::PrivateExponent,
        AttributeType::Prime1 => CkAttributeType::Prime1,
        AttributeType::Prime2 => CkAttributeType::Prime2,
        AttributeType::Exponent1 => CkAttributeType::Exponent1,
        AttributeType::Exponent2 => CkAttributeType::Exponent2,
        AttributeType::Coefficient => CkAttributeType::Coefficient,
        AttributeType::EcParams => CkAttributeType::EcParams,
        AttributeType::EcPoint => CkAttributeType::EcPoint,
        AttributeType::Value => CkAttributeType::Value,
        AttributeType::Subject => CkAttributeType::Subject,
    }
}

fn cryptoki_attribute_bytes(attribute: &CkAttribute) -> Option<&[u8]> {
    match attribute {
        CkAttribute::Label(v)
        | CkAttribute::Modulus(v)
        | CkAttribute::PublicExponent(v)
        | CkAttribute::PrivateExponent(v)
        | CkAttribute::Prime1(v)
        | CkAttribute::Prime2(v)
        | CkAttribute::Exponent1(v)
        | CkAttribute::Exponent2(v)
        | CkAttribute::Coefficient(v)
        | CkAttribute::EcParams(v)
        | CkAttribute::EcPoint(v)
        | CkAttribute::Value(v)
        | CkAttribute::Subject(v) => Some(v.as_slice()),
        _ => None,
    }
}

/// Clears the private key components of a converted template.
fn wipe(template: &mut [CkAttribute]) {
    for attribute in template {
        match attribute {
            CkAttribute::PrivateExponent(v)
            | CkAttribute::Prime1(v)
            | CkAttribute::Prime2(v)
            | CkAttribute::Exponent1(v)
            | CkAttribute::Exponent2(v)
            | CkAttribute::Coefficient(v)
            | CkAttribute::Value(v) => v.zeroize(),
            _ => {}
        }
    }
}
