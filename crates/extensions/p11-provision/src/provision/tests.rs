use super::*;
use crate::config::Labels;
use crate::error::ErrorKind;
use crate::key::ExtractError;
use crate::key::RustCryptoKeyCodec;
use crate::store::InMemoryStore;
use crate::store::RvError;
use assert_matches::assert_matches;
use pki_codec::spki::P256_SPKI_LEN;
use pki_codec::CodecError;

const RSA_KEY: &str = include_str!("../../test_data/rsa2048.key");
const RSA_CERTIFICATE: &str = include_str!("../../test_data/rsa2048.crt");
const EC_KEY: &str = include_str!("../../test_data/ec_p256.key");
const EC_CERTIFICATE: &str = include_str!("../../test_data/ec_p256.crt");
const OTHER_CERTIFICATE: &str = include_str!("../../test_data/other_p256.crt");
const EC_P384_KEY: &str = include_str!("../../test_data/ec_p384.key");

fn token() -> InMemoryStore {
    InMemoryStore::new("test-token")
}

fn provision(
    store: &InMemoryStore,
    params: ProvisioningParameters<'_>,
) -> Result<ProvisioningReport, ProvisioningError> {
    provision_device(store, &RustCryptoKeyCodec, &ProvisioningConfig::default(), &params)
}

fn ec_import() -> ProvisioningParameters<'static> {
    ProvisioningParameters {
        private_key: Some(EC_KEY.as_bytes()),
        private_key_type: Some(KeyType::Ec),
        certificate: Some(EC_CERTIFICATE.as_bytes()),
        ..Default::default()
    }
}

#[test]
fn fresh_rsa_import() {
    let store = token();

    let report = provision(
        &store,
        ProvisioningParameters {
            private_key: Some(RSA_KEY.as_bytes()),
            private_key_type: Some(KeyType::Rsa),
            certificate: Some(RSA_CERTIFICATE.as_bytes()),
            ..Default::default()
        },
    )
    .unwrap();

    let certificate = store.find_object("device-cert", ObjectClass::Certificate).unwrap();
    let private_key = store.find_object("device-key", ObjectClass::PrivateKey).unwrap();
    assert!(certificate.is_some());
    assert!(private_key.is_some());
    assert_eq!(report.state.certificate, certificate);
    assert_eq!(report.state.private_key, private_key);
    assert_eq!(report.state.public_key_der, None);
    assert_eq!(report.state.token_label.as_deref(), Some("test-token"));
    assert_eq!(store.object_count(), 3);
    assert_eq!(store.generated_key_pairs(), 0);
    assert!(!report.generated_key_pair);
    assert!(!report.phases.contains(&ProvisioningPhase::Generating));
    assert!(report.advisories.is_empty(), "{:?}", report.advisories);
}

#[test]
fn malformed_certificate_creates_nothing() {
    let store = token();

    let err = provision(
        &store,
        ProvisioningParameters {
            private_key: Some(RSA_KEY.as_bytes()),
            certificate: Some(b"MIIB not a PEM certificate".as_slice()),
            ..Default::default()
        },
    )
    .unwrap_err();

    assert_matches!(
        err,
        ProvisioningError::Certificate {
            source: CodecError::MalformedInput,
            ..
        }
    );
    assert_eq!(err.kind(), ErrorKind::MalformedInput);
    assert_eq!(store.object_count(), 0);
}

#[test]
fn generates_ec_key_pair_when_nothing_is_provisioned() {
    let store = token();

    let report = provision(&store, ProvisioningParameters::default()).unwrap();

    assert!(report.generated_key_pair);
    assert_eq!(store.generated_key_pairs(), 1);
    assert_eq!(
        report.phases,
        vec![
            ProvisioningPhase::Init,
            ProvisioningPhase::Inspecting,
            ProvisioningPhase::Generating,
            ProvisioningPhase::Verifying,
            ProvisioningPhase::Reporting,
            ProvisioningPhase::Done,
        ]
    );
    let public_key_der = report.state.public_key_der.as_deref().unwrap();
    assert_eq!(public_key_der.len(), P256_SPKI_LEN);
    assert_eq!(
        report.advisories,
        vec![Advisory::EnrollmentRecommended {
            subject: Some("CN=test-token".into())
        }]
    );
}

#[test]
fn generation_is_skipped_when_key_pair_exists() {
    let store = token();
    let first = provision(&store, ProvisioningParameters::default()).unwrap();

    let second = provision(&store, ProvisioningParameters::default()).unwrap();

    assert!(!second.generated_key_pair);
    assert_eq!(store.generated_key_pairs(), 1);
    assert_eq!(second.state.private_key, first.state.private_key);
    assert_eq!(second.state.public_key_der, first.state.public_key_der);
}

#[test]
fn provisioning_twice_leaves_token_unchanged() {
    let store = token();
    let first = provision(&store, ec_import()).unwrap();
    let handles = store.handles();
    let created = store.created_objects();

    let second = provision(&store, ec_import()).unwrap();

    assert_eq!(store.handles(), handles);
    assert_eq!(store.created_objects(), created);
    assert_eq!(second.state, first.state);
    assert_eq!(second.unchanged, vec!["device-cert", "device-key"]);
    assert!(second.advisories.is_empty(), "{:?}", second.advisories);
}

#[test]
fn certificate_alone_is_replaced_once() {
    let store = token();
    provision(&store, ec_import()).unwrap();
    let renewal = ProvisioningParameters {
        certificate: Some(OTHER_CERTIFICATE.as_bytes()),
        ..Default::default()
    };

    let first = provision(&store, renewal).unwrap();
    let handles = store.handles();
    let second = provision(&store, renewal).unwrap();

    assert!(first.unchanged.is_empty());
    assert_eq!(second.unchanged, vec!["device-cert"]);
    assert_eq!(store.handles(), handles);
    assert_eq!(store.object_count(), 3);
    assert_eq!(
        store.find_objects("device-cert", ObjectClass::Certificate).unwrap(),
        vec![second.state.certificate.unwrap()]
    );
    assert_eq!(second.state, first.state);
}

#[test]
fn key_alone_is_replaced_once() {
    let store = token();
    provision(&store, ec_import()).unwrap();
    let rsa_key = ProvisioningParameters {
        private_key: Some(RSA_KEY.as_bytes()),
        ..Default::default()
    };

    let first = provision(&store, rsa_key).unwrap();
    let handles = store.handles();
    let second = provision(&store, rsa_key).unwrap();

    assert!(first.unchanged.is_empty());
    assert_eq!(second.unchanged, vec!["device-key"]);
    assert_eq!(store.handles(), handles);
    assert_eq!(store.object_count(), 3);
    assert_eq!(second.state, first.state);
    assert_eq!(second.state.public_key_der, None);
    assert!(second.advisories.is_empty(), "{:?}", second.advisories);
}

#[test]
fn jitr_certificate_alone_is_stored_once() {
    let store = token();
    provision(&store, ec_import()).unwrap();
    let jitr = ProvisioningParameters {
        jitr_certificate: Some(RSA_CERTIFICATE.as_bytes()),
        ..Default::default()
    };

    let first = provision(&store, jitr).unwrap();
    let handles = store.handles();
    let second = provision(&store, jitr).unwrap();

    assert!(first.unchanged.is_empty());
    assert_eq!(second.unchanged, vec!["jitr-cert"]);
    assert_eq!(store.handles(), handles);
    assert_eq!(store.object_count(), 4);
    assert!(!second.generated_key_pair);
    assert_eq!(second.state.certificate, first.state.certificate);
}

#[test]
fn other_jitr_certificate_replaces_the_stored_one() {
    let store = token();
    provision(
        &store,
        ProvisioningParameters {
            jitr_certificate: Some(RSA_CERTIFICATE.as_bytes()),
            ..ec_import()
        },
    )
    .unwrap();

    let report = provision(
        &store,
        ProvisioningParameters {
            jitr_certificate: Some(OTHER_CERTIFICATE.as_bytes()),
            ..Default::default()
        },
    )
    .unwrap();

    assert!(report.unchanged.is_empty());
    assert_eq!(store.find_objects("jitr-cert", ObjectClass::Certificate).unwrap().len(), 1);
    assert_eq!(store.object_count(), 4);
}

#[test]
fn ec_key_replaces_rsa_key_pair() {
    let store = token();
    provision(
        &store,
        ProvisioningParameters {
            private_key: Some(RSA_KEY.as_bytes()),
            certificate: Some(RSA_CERTIFICATE.as_bytes()),
            ..Default::default()
        },
    )
    .unwrap();

    let report = provision(&store, ec_import()).unwrap();

    assert!(report.unchanged.is_empty());
    assert_eq!(store.object_count(), 3);
    assert_eq!(
        store.find_objects("device-pub-key", ObjectClass::PublicKey).unwrap(),
        vec![report.state.public_key.unwrap()]
    );
    assert!(report.state.public_key_der.is_some());
    assert!(report.advisories.is_empty(), "{:?}", report.advisories);
}

#[test]
fn forced_provisioning_replaces_objects() {
    let store = token();
    provision(&store, ec_import()).unwrap();
    let handles = store.handles();

    let report = provision(
        &store,
        ProvisioningParameters {
            force: true,
            ..ec_import()
        },
    )
    .unwrap();

    assert_eq!(store.object_count(), 3);
    assert!(store.handles().iter().all(|handle| !handles.contains(handle)));
    assert!(report.unchanged.is_empty());
}

#[test]
fn imported_key_takes_precedence_over_generation() {
    let store = token();

    let report = provision(
        &store,
        ProvisioningParameters {
            private_key: Some(EC_KEY.as_bytes()),
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(store.generated_key_pairs(), 0);
    assert!(!report.phases.contains(&ProvisioningPhase::Generating));
    assert!(report.state.public_key_der.is_some());
    // a key without certificate still needs one
    assert_matches!(
        report.advisories.as_slice(),
        [Advisory::EnrollmentRecommended { .. }]
    );
}

#[test]
fn imported_key_replaces_generated_one() {
    let store = token();
    let generated = provision(&store, ProvisioningParameters::default()).unwrap();

    let report = provision(&store, ec_import()).unwrap();

    assert_eq!(store.generated_key_pairs(), 1);
    assert_ne!(report.state.private_key, generated.state.private_key);
    assert_eq!(
        store.find_objects("device-key", ObjectClass::PrivateKey).unwrap(),
        vec![report.state.private_key.unwrap()]
    );
}

#[test]
fn cleanup_after_provisioning_is_idempotent() {
    let store = token();
    provision(&store, ec_import()).unwrap();

    assert_eq!(destroy_credentials(&store, &Labels::default()).unwrap(), 3);
    assert_eq!(destroy_credentials(&store, &Labels::default()).unwrap(), 0);
    assert_eq!(store.object_count(), 0);
}

#[test]
fn full_token_does_not_fail_on_jitr_certificate() {
    let store = token().with_capacity(3);

    let report = provision(
        &store,
        ProvisioningParameters {
            jitr_certificate: Some(RSA_CERTIFICATE.as_bytes()),
            ..ec_import()
        },
    )
    .unwrap();

    assert_matches!(
        report.advisories.as_slice(),
        [Advisory::JitrCertificateNotStored {
            label,
            error: StoreError {
                rv: RvError::DeviceMemory,
                ..
            }
        }] if label == "jitr-cert"
    );
    assert_eq!(store.object_count(), 3);
}

#[test]
fn full_token_fails_on_device_certificate() {
    let store = token().with_capacity(1);

    let err = provision(&store, ec_import()).unwrap_err();

    assert_matches!(err, ProvisioningError::Store(StoreError { rv: RvError::DeviceMemory, .. }));
    assert_eq!(err.kind(), ErrorKind::StoreError);
}

#[test]
fn jitr_certificate_is_stored_when_there_is_room() {
    let store = token();

    provision(
        &store,
        ProvisioningParameters {
            jitr_certificate: Some(RSA_CERTIFICATE.as_bytes()),
            ..ec_import()
        },
    )
    .unwrap();

    assert!(store
        .find_object("jitr-cert", ObjectClass::Certificate)
        .unwrap()
        .is_some());
}

#[test]
fn p384_key_is_rejected_before_touching_the_token() {
    let store = token();

    let err = provision(
        &store,
        ProvisioningParameters {
            private_key: Some(EC_P384_KEY.as_bytes()),
            certificate: Some(EC_CERTIFICATE.as_bytes()),
            ..Default::default()
        },
    )
    .unwrap_err();

    assert_matches!(err, ProvisioningError::PrivateKey(ExtractError::UnsupportedCurve(_)));
    assert_eq!(err.kind(), ErrorKind::UnsupportedCurve);
    assert_eq!(store.object_count(), 0);
}

#[test]
fn certificate_for_another_key_is_reported() {
    let store = token();

    let report = provision(
        &store,
        ProvisioningParameters {
            certificate: Some(OTHER_CERTIFICATE.as_bytes()),
            ..ec_import()
        },
    )
    .unwrap();

    assert_eq!(
        report.advisories,
        vec![Advisory::CertificateKeyMismatch {
            label: "device-cert".into()
        }]
    );
}

#[test]
fn token_unable_to_sign_skips_verification() {
    let store = token().without_signing();

    let report = provision(&store, ProvisioningParameters::default()).unwrap();

    assert!(report.generated_key_pair);
    assert_matches!(
        report.advisories.as_slice(),
        [
            Advisory::KeyPairNotVerified(StoreError {
                rv: RvError::FunctionNotSupported,
                ..
            }),
            Advisory::EnrollmentRecommended { .. }
        ]
    );
}

#[test]
fn token_unable_to_destroy_still_provisions() {
    let store = token().without_destroy();
    provision(&store, ec_import()).unwrap();

    let report = provision(
        &store,
        ProvisioningParameters {
            private_key: Some(RSA_KEY.as_bytes()),
            certificate: Some(RSA_CERTIFICATE.as_bytes()),
            ..Default::default()
        },
    )
    .unwrap();

    assert!(report
        .advisories
        .iter()
        .all(|advisory| matches!(advisory, Advisory::CleanupFailed { .. })));
    assert_eq!(report.advisories.len(), 3);
    assert_eq!(store.object_count(), 6);
}

#[test]
fn rsa_key_generation_is_unsupported() {
    let store = token();
    let config = ProvisioningConfig {
        generate_key_type: KeyType::Rsa,
        ..Default::default()
    };

    let err = provision_device(
        &store,
        &RustCryptoKeyCodec,
        &config,
        &ProvisioningParameters::default(),
    )
    .unwrap_err();

    assert_matches!(err, ProvisioningError::UnsupportedOperation(_));
    assert_eq!(store.generated_key_pairs(), 0);
    assert_eq!(store.object_count(), 0);
}

#[test]
fn nothing_to_provision_without_generation() {
    let store = token();
    let config = ProvisioningConfig {
        generate_missing_key: false,
        ..Default::default()
    };

    assert_matches!(
        provision_device(
            &store,
            &RustCryptoKeyCodec,
            &config,
            &ProvisioningParameters::default()
        ),
        Err(ProvisioningError::NothingToProvision)
    );
}

#[test]
fn certificate_alone_does_not_generate_when_disabled() {
    let store = token();
    let config = ProvisioningConfig {
        generate_missing_key: false,
        ..Default::default()
    };

    let report = provision_device(
        &store,
        &RustCryptoKeyCodec,
        &config,
        &ProvisioningParameters {
            certificate: Some(EC_CERTIFICATE.as_bytes()),
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(report.advisories, vec![Advisory::NoKeyPair]);
    assert_eq!(store.object_count(), 1);
}

#[test]
fn rsa_key_pair_on_token_is_kept() {
    let store = token();
    let rsa_import = ProvisioningParameters {
        private_key: Some(RSA_KEY.as_bytes()),
        certificate: Some(RSA_CERTIFICATE.as_bytes()),
        ..Default::default()
    };
    provision(&store, rsa_import).unwrap();

    let report = provision(&store, ProvisioningParameters::default()).unwrap();

    assert!(!report.generated_key_pair);
    assert_eq!(store.object_count(), 3);
}

#[test]
fn private_key_is_never_printed() {
    let params = ec_import();

    let printed = format!("{params:?}");

    assert!(printed.contains("[REDACTED]"));
    assert!(!printed.contains("BEGIN"));
}

#[test]
fn advisories_are_readable() {
    let advisory = Advisory::EnrollmentRecommended {
        subject: Some("CN=test-token".into()),
    };

    assert_eq!(
        advisory.to_string(),
        "Issue a certificate for the device public key, with subject 'CN=test-token'"
    );
}
