use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::config::Labels;
use crate::store::CredentialStore;
use crate::store::ObjectClass;
use crate::store::RvError;
use crate::store::StoreError;

/// Destroys every object provisioned under the well-known labels.
///
/// A label may hold several objects, all of them are destroyed. Destroying an object that has already vanished
/// is not an error, and a token that cannot destroy objects leaves them in place: the remaining labels are still
/// processed. Other failures stop the cleanup of the current label and the first one is returned once all labels
/// have been processed.
///
/// Returns the number of objects destroyed.
#[instrument(skip_all)]
pub fn destroy_credentials<S: CredentialStore + ?Sized>(
    store: &S,
    labels: &Labels,
) -> Result<usize, StoreError> {
    let targets = [
        (labels.certificate.as_str(), ObjectClass::Certificate),
        (labels.code_verification_key.as_str(), ObjectClass::PublicKey),
        (labels.private_key.as_str(), ObjectClass::PrivateKey),
        (labels.public_key.as_str(), ObjectClass::PublicKey),
        (labels.jitr_certificate.as_str(), ObjectClass::Certificate),
    ];

    let mut destroyed = 0;
    let mut first_error = None;
    for (label, class) in targets {
        match destroy_labelled(store, label, class) {
            Ok(count) => destroyed += count,
            Err(err) if err.is_not_supported() => {
                warn!(label, "Token cannot destroy objects, {class:?} left in place");
            }
            Err(err) => {
                warn!(label, "Failed to destroy {class:?}: {err}");
                first_error.get_or_insert(err);
            }
        }
    }

    info!(destroyed, "Destroyed provisioned objects");
    match first_error {
        Some(err) => Err(err),
        None => Ok(destroyed),
    }
}

/// Destroys all the objects with the given label and class, stopping at the first failure.
pub(super) fn destroy_labelled<S: CredentialStore + ?Sized>(
    store: &S,
    label: &str,
    class: ObjectClass,
) -> Result<usize, StoreError> {
    let mut destroyed = 0;
    for handle in store.find_objects(label, class)? {
        match store.destroy_object(handle) {
            Ok(()) => {
                debug!(label, %handle, "Destroyed {class:?}");
                destroyed += 1;
            }
            Err(err) if err.rv == RvError::ObjectHandleInvalid => {
                debug!(label, %handle, "{class:?} already destroyed");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(destroyed)
}
