//! Object templates for the token.
//!
//! Every template starts with the same header, in this order: class, key type (or certificate type), label and
//! token flag. Keys then carry their capability flag (`CKA_SIGN` or `CKA_VERIFY`) followed by their numeric
//! fields. Some tokens consume attributes positionally, so the order must not change.

use pki_codec::spki::ec_point_octet_string;
use pki_codec::SpkiError;
use zeroize::Zeroizing;

use crate::key::EcKeyMaterial;
use crate::key::KeyMaterial;
use crate::key::RsaKeyMaterial;
use crate::store::Attribute;
use crate::store::CertificateType;
use crate::store::KeyType;
use crate::store::ObjectClass;

/// Number of attributes of the largest template, an RSA private key.
const MAX_TEMPLATE_LEN: usize = 13;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("The EC key has no public point: its public key object cannot be created")]
    MissingEcPoint,

    #[error(transparent)]
    InvalidEcPoint(#[from] SpkiError),

    #[error("Failed to allocate a template of {0} attributes")]
    AllocationFailure(usize),
}

/// Template of a private key object holding `key`.
pub fn private_key_template(
    label: &str,
    key: &KeyMaterial,
) -> Result<Vec<Attribute>, TemplateError> {
    let mut template = header(ObjectClass::PrivateKey, Some(key.key_type()), label)?;
    template.push(Attribute::Sign(true));
    match key {
        KeyMaterial::Rsa(rsa) => {
            template.push(Attribute::Modulus(rsa.modulus.clone()));
            template.push(Attribute::PublicExponent(rsa.public_exponent.clone()));
            template.extend(rsa_private_fields(rsa));
        }
        KeyMaterial::Ec(ec) => {
            template.push(Attribute::EcParams(ec.curve_oid.clone()));
            template.push(Attribute::Value(ec.private_scalar.clone()));
        }
    }
    Ok(template)
}

fn rsa_private_fields(rsa: &RsaKeyMaterial) -> [Attribute; 6] {
    [
        Attribute::PrivateExponent(rsa.private_exponent.clone()),
        Attribute::Prime1(rsa.prime1.clone()),
        Attribute::Prime2(rsa.prime2.clone()),
        Attribute::Exponent1(rsa.exponent1.clone()),
        Attribute::Exponent2(rsa.exponent2.clone()),
        Attribute::Coefficient(rsa.coefficient.clone()),
    ]
}

/// Template of the public key object matching `key`.
///
/// EC points are stored as a DER OCTET STRING, the `CKA_EC_POINT` encoding.
pub fn public_key_template(
    label: &str,
    key: &KeyMaterial,
) -> Result<Vec<Attribute>, TemplateError> {
    let mut template = header(ObjectClass::PublicKey, Some(key.key_type()), label)?;
    template.push(Attribute::Verify(true));
    match key {
        KeyMaterial::Rsa(rsa) => {
            template.push(Attribute::Modulus(rsa.modulus.clone()));
            template.push(Attribute::PublicExponent(rsa.public_exponent.clone()));
        }
        KeyMaterial::Ec(EcKeyMaterial {
            curve_oid,
            public_point,
            ..
        }) => {
            let point = public_point.as_deref().ok_or(TemplateError::MissingEcPoint)?;
            template.push(Attribute::EcParams(curve_oid.clone()));
            template.push(Attribute::EcPoint(ec_point_octet_string(point)?));
        }
    }
    Ok(template)
}

/// Template of an X.509 certificate object.
///
/// `subject` is the DER-encoded subject Name stored in `CKA_SUBJECT`.
pub fn certificate_template(
    label: &str,
    certificate_der: &[u8],
    subject: &[u8],
) -> Result<Vec<Attribute>, TemplateError> {
    let mut template = header(ObjectClass::Certificate, None, label)?;
    template.push(Attribute::Subject(subject.to_vec()));
    template.push(Attribute::Value(Zeroizing::new(certificate_der.to_vec())));
    Ok(template)
}

/// Public and private templates for generating a P-256 key pair with `CKM_EC_KEY_PAIR_GEN`.
///
/// The curve goes into the public template only; the token derives the rest.
pub fn ec_key_pair_generation_templates(
    public_label: &str,
    private_label: &str,
    curve_oid: &[u8],
) -> Result<(Vec<Attribute>, Vec<Attribute>), TemplateError> {
    let mut public = header(ObjectClass::PublicKey, Some(KeyType::Ec), public_label)?;
    public.push(Attribute::Verify(true));
    public.push(Attribute::EcParams(curve_oid.to_vec()));

    let mut private = header(ObjectClass::PrivateKey, Some(KeyType::Ec), private_label)?;
    private.push(Attribute::Sign(true));

    Ok((public, private))
}

fn header(
    class: ObjectClass,
    key_type: Option<KeyType>,
    label: &str,
) -> Result<Vec<Attribute>, TemplateError> {
    let mut template = Vec::new();
    template
        .try_reserve_exact(MAX_TEMPLATE_LEN)
        .map_err(|_| TemplateError::AllocationFailure(MAX_TEMPLATE_LEN))?;

    template.push(Attribute::Class(class));
    match key_type {
        Some(key_type) => template.push(Attribute::KeyType(key_type)),
        None => template.push(Attribute::CertificateType(CertificateType::X509)),
    }
    template.push(Attribute::Label(label.to_string()));
    template.push(Attribute::Token(true));
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AttributeType;
    use assert_matches::assert_matches;
    use pki_codec::oid::SECP256R1_OID_DER;

    fn ec_key(public_point: Option<Vec<u8>>) -> KeyMaterial {
        KeyMaterial::Ec(EcKeyMaterial {
            private_scalar: Zeroizing::new(vec![7; 32]),
            curve_oid: SECP256R1_OID_DER.to_vec(),
            public_point,
        })
    }

    fn rsa_key() -> KeyMaterial {
        KeyMaterial::Rsa(RsaKeyMaterial {
            modulus: vec![0xc1; 256],
            public_exponent: vec![1, 0, 1],
            private_exponent: Zeroizing::new(vec![2; 256]),
            prime1: Zeroizing::new(vec![3; 128]),
            prime2: Zeroizing::new(vec![4; 128]),
            exponent1: Zeroizing::new(vec![5; 128]),
            exponent2: Zeroizing::new(vec![6; 128]),
            coefficient: Zeroizing::new(vec![7; 128]),
        })
    }

    fn types(template: &[Attribute]) -> Vec<AttributeType> {
        template.iter().map(Attribute::attribute_type).collect()
    }

    #[test]
    fn rsa_private_key_attributes_are_in_stable_order() {
        let template = private_key_template("device-key", &rsa_key()).unwrap();

        assert_eq!(
            types(&template),
            vec![
                AttributeType::Class,
                AttributeType::KeyType,
                AttributeType::Label,
                AttributeType::Token,
                AttributeType::Sign,
                AttributeType::Modulus,
                AttributeType::PublicExponent,
                AttributeType::PrivateExponent,
                AttributeType::Prime1,
                AttributeType::Prime2,
                AttributeType::Exponent1,
                AttributeType::Exponent2,
                AttributeType::Coefficient,
            ]
        );
        assert_eq!(template.len(), MAX_TEMPLATE_LEN);
        assert_eq!(template[0], Attribute::Class(ObjectClass::PrivateKey));
        assert_eq!(template[1], Attribute::KeyType(KeyType::Rsa));
    }

    #[test]
    fn ec_private_key_carries_curve_and_scalar() {
        let template = private_key_template("device-key", &ec_key(None)).unwrap();

        assert_eq!(
            types(&template)[4..],
            [
                AttributeType::Sign,
                AttributeType::EcParams,
                AttributeType::Value
            ]
        );
        assert_eq!(
            template[5],
            Attribute::EcParams(SECP256R1_OID_DER.to_vec())
        );
    }

    #[test]
    fn ec_public_key_point_is_wrapped_in_octet_string() {
        let mut point = vec![0x04];
        point.extend([0x11; 64]);
        let template = public_key_template("device-pub-key", &ec_key(Some(point.clone()))).unwrap();

        let Some(Attribute::EcPoint(ec_point)) = template.last() else {
            panic!("EC point missing from {template:?}");
        };
        assert_eq!(ec_point[..2], [0x04, 0x41]);
        assert_eq!(ec_point[2..], point[..]);
        assert_eq!(template[4], Attribute::Verify(true));
    }

    #[test]
    fn ec_public_key_needs_a_point() {
        assert_matches!(
            public_key_template("device-pub-key", &ec_key(None)),
            Err(TemplateError::MissingEcPoint)
        );
        assert_matches!(
            public_key_template("device-pub-key", &ec_key(Some(vec![0x04; 10]))),
            Err(TemplateError::InvalidEcPoint(SpkiError::InvalidPoint(10)))
        );
    }

    #[test]
    fn rsa_public_key_has_no_private_fields() {
        let template = public_key_template("device-pub-key", &rsa_key()).unwrap();

        assert_eq!(
            types(&template)[4..],
            [
                AttributeType::Verify,
                AttributeType::Modulus,
                AttributeType::PublicExponent
            ]
        );
    }

    #[test]
    fn certificate_carries_type_subject_and_value() {
        let template = certificate_template("device-cert", &[0x30, 0x00], b"subject").unwrap();

        assert_eq!(
            template,
            vec![
                Attribute::Class(ObjectClass::Certificate),
                Attribute::CertificateType(CertificateType::X509),
                Attribute::Label("device-cert".into()),
                Attribute::Token(true),
                Attribute::Subject(b"subject".to_vec()),
                Attribute::Value(Zeroizing::new(vec![0x30, 0x00])),
            ]
        );
    }

    #[test]
    fn generation_templates_put_curve_on_public_key() {
        let (public, private) =
            ec_key_pair_generation_templates("device-pub-key", "device-key", &SECP256R1_OID_DER)
                .unwrap();

        assert_eq!(
            public.last(),
            Some(&Attribute::EcParams(SECP256R1_OID_DER.to_vec()))
        );
        assert_eq!(private.last(), Some(&Attribute::Sign(true)));
        assert_eq!(private[2], Attribute::Label("device-key".into()));
    }
}
