//! Provisioning a device's credentials onto a token.
//!
//! [provision_device] runs the provisioning state machine against a store session:
//!
//! - `Init`: the request is checked, certificates converted and key fields extracted.
//! - `Inspecting`: the objects already on the token are looked up by label.
//! - `Importing`: supplied objects are created, unless the token holds them already.
//! - `Generating`: a P-256 key pair is generated when none was imported and the token holds no usable one.
//! - `Verifying`: the private key must sign for the public key, and the certificate should certify it.
//! - `Reporting`: the public key is logged and certificate enrollment recommended when needed.
//!
//! The first fatal error ends the run and is returned. Conditions that only degrade the result are returned in
//! the [ProvisioningReport] as [Advisory] entries, and logged.

use std::fmt::Debug;
use std::fmt::Display;

use pki_codec::oid::SECP256R1_OID_DER;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::config::ProvisioningConfig;
use crate::error::ProvisioningError;
use crate::export::export_public_key_der;
use crate::export::ExportError;
use crate::key::KeyCodec;
use crate::key::KeyMaterial;
use crate::store::read_attribute;
use crate::store::AttributeType;
use crate::store::CredentialStore;
use crate::store::KeyType;
use crate::store::Mechanism;
use crate::store::ObjectClass;
use crate::store::ObjectHandle;
use crate::store::StoreError;
use crate::template::ec_key_pair_generation_templates;

mod destroy;
mod import;
mod verify;

pub use destroy::destroy_credentials;

use destroy::destroy_labelled;
use import::create_certificate;
use import::create_key_pair;
use import::find_current_certificate;
use import::find_current_key_pair;
use import::ImportRequest;
use verify::check_certificate_key;
use verify::verify_key_pair;

/// What to provision. All inputs are PEM encoded; a trailing NUL is ignored.
#[derive(Clone, Copy, Default)]
pub struct ProvisioningParameters<'a> {
    /// Private key to import, in PKCS #1, SEC1 or PKCS #8 format.
    pub private_key: Option<&'a [u8]>,

    /// Expected type of `private_key`, if known.
    pub private_key_type: Option<KeyType>,

    pub certificate: Option<&'a [u8]>,

    /// DER-encoded subject Name stored with the certificate, the certificate's own subject if not set.
    pub certificate_subject: Option<&'a [u8]>,

    /// CA certificate used for Just-In-Time Registration.
    pub jitr_certificate: Option<&'a [u8]>,

    /// Re-create supplied objects even when the token holds them already.
    pub force: bool,
}

impl Debug for ProvisioningParameters<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningParameters")
            .field("private_key", &self.private_key.map(|_| "[REDACTED]"))
            .field("private_key_type", &self.private_key_type)
            .field("certificate", &self.certificate.map(<[u8]>::len))
            .field("certificate_subject", &self.certificate_subject.map(<[u8]>::len))
            .field("jitr_certificate", &self.jitr_certificate.map(<[u8]>::len))
            .field("force", &self.force)
            .finish()
    }
}

/// The credentials held by the token at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionedState {
    pub private_key: Option<ObjectHandle>,
    pub public_key: Option<ObjectHandle>,
    pub certificate: Option<ObjectHandle>,

    /// SubjectPublicKeyInfo of the public key, only known for EC keys.
    pub public_key_der: Option<Vec<u8>>,

    /// Token label without its blank padding.
    pub token_label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningPhase {
    Init,
    Inspecting,
    Importing,
    Generating,
    Verifying,
    Reporting,
    Done,
}

/// A non fatal condition met while provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    /// Stale objects could not be destroyed before being replaced.
    CleanupFailed { label: String, error: StoreError },

    /// The token has no room left for the JITR certificate.
    JitrCertificateNotStored { label: String, error: StoreError },

    /// The token cannot sign, so the key pair could not be checked.
    KeyPairNotVerified(StoreError),

    /// The certificate does not certify the provisioned public key.
    CertificateKeyMismatch { label: String },

    CertificateNotChecked { label: String, reason: String },

    TokenLabelUnavailable(StoreError),

    /// The token holds no key pair and key generation is disabled.
    NoKeyPair,

    /// The device key pair has no matching certificate yet.
    ///
    /// Never reported without a key pair on the token, [Advisory::NoKeyPair] is reported instead.
    EnrollmentRecommended { subject: Option<String> },
}

impl Display for Advisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Advisory::CleanupFailed { label, error } => {
                write!(f, "Failed to destroy stale objects labelled '{label}': {error}")
            }
            Advisory::JitrCertificateNotStored { label, error } => {
                write!(f, "JITR certificate '{label}' not stored, the token is full: {error}")
            }
            Advisory::KeyPairNotVerified(error) => {
                write!(f, "Key pair not verified, the token cannot sign: {error}")
            }
            Advisory::CertificateKeyMismatch { label } => {
                write!(f, "Certificate '{label}' was not issued for the device public key")
            }
            Advisory::CertificateNotChecked { label, reason } => {
                write!(f, "Certificate '{label}' not checked against the device public key: {reason}")
            }
            Advisory::TokenLabelUnavailable(error) => {
                write!(f, "Failed to read the token label: {error}")
            }
            Advisory::NoKeyPair => write!(
                f,
                "The token holds no key pair, provide a private key or enable key generation"
            ),
            Advisory::EnrollmentRecommended { subject: Some(subject) } => write!(
                f,
                "Issue a certificate for the device public key, with subject '{subject}'"
            ),
            Advisory::EnrollmentRecommended { subject: None } => {
                write!(f, "Issue a certificate for the device public key")
            }
        }
    }
}

/// Outcome of a successful provisioning run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningReport {
    pub state: ProvisionedState,

    /// Phases the run went through, in order.
    pub phases: Vec<ProvisioningPhase>,

    pub advisories: Vec<Advisory>,

    /// Labels of supplied objects the token held already, and which were left untouched.
    pub unchanged: Vec<String>,

    pub generated_key_pair: bool,
}

/// Provisions the device credentials described by `params` onto `store`.
///
/// Running it again with the same parameters leaves the token untouched. Key generation is never attempted when
/// a private key is supplied.
#[instrument(skip_all)]
pub fn provision_device<S, C>(
    store: &S,
    codec: &C,
    config: &ProvisioningConfig,
    params: &ProvisioningParameters<'_>,
) -> Result<ProvisioningReport, ProvisioningError>
where
    S: CredentialStore + ?Sized,
    C: KeyCodec + ?Sized,
{
    debug!(?params, "Provisioning device");
    let mut run = Run {
        store,
        config,
        existing_rsa_key_pair: false,
        imported: false,
        report: ProvisioningReport::default(),
    };

    match run.execute(codec, params) {
        Ok(()) => {
            run.enter(ProvisioningPhase::Done);
            info!(advisories = run.report.advisories.len(), "Device provisioned");
            Ok(run.report)
        }
        Err(err) => {
            let phase = run.report.phases.last();
            error!(?phase, "Provisioning failed: {err}");
            Err(err)
        }
    }
}

struct Run<'a, S: ?Sized> {
    store: &'a S,
    config: &'a ProvisioningConfig,
    /// The token holds a key pair that cannot be exported, as RSA ones.
    existing_rsa_key_pair: bool,
    /// Objects were supplied by the caller.
    imported: bool,
    report: ProvisioningReport,
}

impl<S: CredentialStore + ?Sized> Run<'_, S> {
    fn execute<C: KeyCodec + ?Sized>(
        &mut self,
        codec: &C,
        params: &ProvisioningParameters<'_>,
    ) -> Result<(), ProvisioningError> {
        self.enter(ProvisioningPhase::Init);
        if params.private_key.is_none()
            && params.certificate.is_none()
            && !self.config.generate_missing_key
        {
            return Err(ProvisioningError::NothingToProvision);
        }
        let request = ImportRequest::prepare(codec, self.config, params)?;

        self.enter(ProvisioningPhase::Inspecting);
        self.inspect()?;

        let imports_key = request.key.is_some();
        if !request.is_empty() {
            self.enter(ProvisioningPhase::Importing);
            self.imported = true;
            self.import(request, params.force)?;
        }

        if !imports_key && self.needs_key_pair() {
            if self.config.generate_missing_key {
                self.enter(ProvisioningPhase::Generating);
                self.generate()?;
            } else {
                self.advise(Advisory::NoKeyPair);
            }
        }

        self.enter(ProvisioningPhase::Verifying);
        self.verify()?;

        self.enter(ProvisioningPhase::Reporting);
        self.report_state();
        Ok(())
    }

    fn enter(&mut self, phase: ProvisioningPhase) {
        debug!(?phase, "Entering provisioning phase");
        self.report.phases.push(phase);
    }

    fn advise(&mut self, advisory: Advisory) {
        warn!("{advisory}");
        self.report.advisories.push(advisory);
    }

    fn inspect(&mut self) -> Result<(), ProvisioningError> {
        let labels = &self.config.labels;
        let state = &mut self.report.state;
        state.private_key = self
            .store
            .find_object(&labels.private_key, ObjectClass::PrivateKey)?;
        state.public_key = self
            .store
            .find_object(&labels.public_key, ObjectClass::PublicKey)?;
        state.certificate = self
            .store
            .find_object(&labels.certificate, ObjectClass::Certificate)?;

        if let (Some(_), Some(public_key)) = (state.private_key, state.public_key) {
            match export_public_key_der(self.store, public_key) {
                Ok(der) => state.public_key_der = Some(der),
                Err(ExportError::NotEcKey(_)) => {
                    debug!(%public_key, "Token holds a key pair that cannot be exported");
                    self.existing_rsa_key_pair = true;
                }
                Err(err) => debug!(%public_key, "Existing public key is unusable: {err}"),
            }
        }

        debug!(state = ?self.report.state, "Inspected token");
        Ok(())
    }

    fn needs_key_pair(&self) -> bool {
        let state = &self.report.state;
        state.private_key.is_none()
            || state.public_key.is_none()
            || (state.public_key_der.is_none() && !self.existing_rsa_key_pair)
    }

    fn import(&mut self, request: ImportRequest, force: bool) -> Result<(), ProvisioningError> {
        let store = self.store;
        let config = self.config;
        let labels = &config.labels;
        let ImportRequest {
            certificate,
            key,
            jitr_certificate,
        } = request;

        if let Some(certificate) = certificate {
            let label = &labels.certificate;
            let current = if force {
                None
            } else {
                find_current_certificate(store, label, &certificate.der)?
            };
            match current {
                Some(handle) => {
                    info!(label = %label, %handle, "Certificate already provisioned");
                    self.report.unchanged.push(label.clone());
                    self.report.state.certificate = Some(handle);
                }
                None => {
                    self.destroy_stale(label, ObjectClass::Certificate);
                    let handle = create_certificate(store, label, &certificate)?;
                    info!(label = %label, %handle, "Certificate provisioned");
                    self.report.state.certificate = Some(handle);
                }
            }
        }

        if let Some(key) = key {
            let current = if force {
                None
            } else {
                find_current_key_pair(store, &labels.private_key, &labels.public_key, &key)?
            };
            match current {
                Some((private_key, public_key)) => {
                    info!(label = %labels.private_key, handle = %private_key, "Private key already provisioned");
                    self.report.unchanged.push(labels.private_key.clone());
                    self.set_key_pair(&key, private_key, public_key)?;
                }
                None => {
                    self.destroy_stale(&labels.private_key, ObjectClass::PrivateKey);
                    self.destroy_stale(&labels.public_key, ObjectClass::PublicKey);
                    self.import_key(&key)?;
                }
            }
        }

        if let Some(jitr_certificate) = jitr_certificate {
            let label = &labels.jitr_certificate;
            let current = if force {
                None
            } else {
                find_current_certificate(store, label, &jitr_certificate.der)?
            };
            if let Some(handle) = current {
                info!(label = %label, %handle, "JITR certificate already provisioned");
                self.report.unchanged.push(label.clone());
            } else {
                self.destroy_stale(label, ObjectClass::Certificate);
                match create_certificate(store, label, &jitr_certificate) {
                    Ok(handle) => info!(label = %label, %handle, "JITR certificate provisioned"),
                    Err(ProvisioningError::Store(error)) if error.is_out_of_device_memory() => {
                        self.advise(Advisory::JitrCertificateNotStored {
                            label: label.clone(),
                            error,
                        })
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(())
    }

    fn import_key(&mut self, key: &KeyMaterial) -> Result<(), ProvisioningError> {
        let config = self.config;
        let labels = &config.labels;
        let (private_key, public_key) =
            create_key_pair(self.store, &labels.private_key, &labels.public_key, key)?;
        info!(label = %labels.private_key, handle = %private_key, key_type = %key.key_type(), "Private key provisioned");
        self.set_key_pair(key, private_key, public_key)
    }

    fn set_key_pair(
        &mut self,
        key: &KeyMaterial,
        private_key: ObjectHandle,
        public_key: ObjectHandle,
    ) -> Result<(), ProvisioningError> {
        let state = &mut self.report.state;
        state.private_key = Some(private_key);
        state.public_key = Some(public_key);
        state.public_key_der = match key {
            KeyMaterial::Ec(_) => Some(export_public_key_der(self.store, public_key)?),
            KeyMaterial::Rsa(_) => None,
        };
        Ok(())
    }

    fn generate(&mut self) -> Result<(), ProvisioningError> {
        let config = self.config;
        if config.generate_key_type == KeyType::Rsa {
            return Err(ProvisioningError::UnsupportedOperation(
                "RSA key pair generation: tokens can only generate EC (P-256) key pairs".into(),
            ));
        }

        if !config.generation_delay.is_zero() {
            info!(
                delay = %humantime::format_duration(config.generation_delay),
                "Waiting before generating a key pair"
            );
            std::thread::sleep(config.generation_delay);
        }

        let labels = &config.labels;
        self.destroy_stale(&labels.private_key, ObjectClass::PrivateKey);
        self.destroy_stale(&labels.public_key, ObjectClass::PublicKey);

        let (public_template, private_template) =
            ec_key_pair_generation_templates(&labels.public_key, &labels.private_key, &SECP256R1_OID_DER)?;
        let (public_key, private_key) =
            self.store
                .generate_key_pair(Mechanism::EcKeyPairGen, &public_template, &private_template)?;
        info!(label = %labels.private_key, handle = %private_key, "Generated P-256 key pair");

        let state = &mut self.report.state;
        state.private_key = Some(private_key);
        state.public_key = Some(public_key);
        state.public_key_der = Some(export_public_key_der(self.store, public_key)?);
        self.report.generated_key_pair = true;
        Ok(())
    }

    /// Destroys the objects under `label` ahead of their replacement. Failures are only advisory.
    fn destroy_stale(&mut self, label: &str, class: ObjectClass) {
        match destroy_labelled(self.store, label, class) {
            Ok(0) => {}
            Ok(destroyed) => debug!(label, destroyed, "Destroyed stale {class:?}"),
            Err(error) => self.advise(Advisory::CleanupFailed {
                label: label.to_string(),
                error,
            }),
        }
    }

    fn verify(&mut self) -> Result<(), ProvisioningError> {
        let state = &self.report.state;
        let Some(public_key_der) = state.public_key_der.clone() else {
            return Ok(());
        };

        if let (Some(private_key), Some(public_key)) = (state.private_key, state.public_key) {
            if let Some(advisory) = verify_key_pair(self.store, private_key, public_key, &public_key_der)? {
                self.advise(advisory);
            }
        }

        if let Some(certificate) = self.report.state.certificate {
            let config = self.config;
            let label = &config.labels.certificate;
            let advisory = match read_attribute(self.store, certificate, AttributeType::Value) {
                Ok(certificate_der) => check_certificate_key(label, &certificate_der, &public_key_der),
                Err(err) => Some(Advisory::CertificateNotChecked {
                    label: label.clone(),
                    reason: err.to_string(),
                }),
            };
            if let Some(advisory) = advisory {
                self.advise(advisory);
            }
        }
        Ok(())
    }

    fn report_state(&mut self) {
        if let Some(der) = &self.report.state.public_key_der {
            info!(public_key = %hex_dump(der), "Device public key (DER)");
        }

        let token_label = match self.store.token_info() {
            Ok(info) => Some(info.label.trim_end_matches(|c: char| c == ' ' || c == '\0').to_string())
                .filter(|label| !label.is_empty()),
            Err(error) => {
                self.advise(Advisory::TokenLabelUnavailable(error));
                None
            }
        };

        let state = &self.report.state;
        let has_key_pair = state.private_key.is_some() && state.public_key.is_some();
        let needs_certificate =
            state.certificate.is_none() || (self.report.generated_key_pair && !self.imported);
        if needs_certificate && !has_key_pair {
            debug!("No key pair to enroll a certificate for");
        } else if needs_certificate {
            let subject = token_label.as_ref().map(|label| format!("CN={label}"));
            self.advise(Advisory::EnrollmentRecommended { subject });
        }
        self.report.state.token_label = token_label;
    }
}

fn hex_dump(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests;
