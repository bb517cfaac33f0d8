use serde::Deserialize;
use serde::Serialize;
use std::fmt::Debug;
use zeroize::Zeroizing;

/// `CKA_CLASS` of the objects we provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectClass {
    PrivateKey,
    PublicKey,
    Certificate,
}

/// `CKA_KEY_TYPE` of the keys we provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    Ec,
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyType::Rsa => write!(f, "RSA"),
            KeyType::Ec => write!(f, "EC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateType {
    X509,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// `CKM_EC_KEY_PAIR_GEN`
    EcKeyPairGen,
    /// `CKM_RSA_PKCS_KEY_PAIR_GEN`
    RsaPkcsKeyPairGen,
    /// `CKM_ECDSA`: signs a digest, producing a raw `R || S` signature.
    Ecdsa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Class,
    KeyType,
    CertificateType,
    Label,
    Token,
    Sign,
    Verify,
    ModulusBits,
    Modulus,
    PublicExponent,
    PrivateExponent,
    Prime1,
    Prime2,
    Exponent1,
    Exponent2,
    Coefficient,
    EcParams,
    EcPoint,
    Value,
    Subject,
}

impl AttributeType {
    /// Attributes that a token never reveals for private keys.
    pub fn is_sensitive_for(self, class: ObjectClass) -> bool {
        class == ObjectClass::PrivateKey
            && matches!(
                self,
                AttributeType::PrivateExponent
                    | AttributeType::Prime1
                    | AttributeType::Prime2
                    | AttributeType::Exponent1
                    | AttributeType::Exponent2
                    | AttributeType::Coefficient
                    | AttributeType::Value
            )
    }
}

/// A single entry of an object template.
///
/// Private key components are held in zeroizing buffers and are never printed by [Debug].
#[derive(Clone, PartialEq, Eq)]
pub enum Attribute {
    Class(ObjectClass),
    KeyType(KeyType),
    CertificateType(CertificateType),
    Label(String),
    Token(bool),
    Sign(bool),
    Verify(bool),
    ModulusBits(u32),
    Modulus(Vec<u8>),
    PublicExponent(Vec<u8>),
    PrivateExponent(Zeroizing<Vec<u8>>),
    Prime1(Zeroizing<Vec<u8>>),
    Prime2(Zeroizing<Vec<u8>>),
    Exponent1(Zeroizing<Vec<u8>>),
    Exponent2(Zeroizing<Vec<u8>>),
    Coefficient(Zeroizing<Vec<u8>>),
    EcParams(Vec<u8>),
    EcPoint(Vec<u8>),
    /// Private scalar of EC keys, DER of certificates.
    Value(Zeroizing<Vec<u8>>),
    Subject(Vec<u8>),
}

impl Attribute {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Attribute::Class(_) => AttributeType::Class,
            Attribute::KeyType(_) => AttributeType::KeyType,
            Attribute::CertificateType(_) => AttributeType::CertificateType,
            Attribute::Label(_) => AttributeType::Label,
            Attribute::Token(_) => AttributeType::Token,
            Attribute::Sign(_) => AttributeType::Sign,
            Attribute::Verify(_) => AttributeType::Verify,
            Attribute::ModulusBits(_) => AttributeType::ModulusBits,
            Attribute::Modulus(_) => AttributeType::Modulus,
            Attribute::PublicExponent(_) => AttributeType::PublicExponent,
            Attribute::PrivateExponent(_) => AttributeType::PrivateExponent,
            Attribute::Prime1(_) => AttributeType::Prime1,
            Attribute::Prime2(_) => AttributeType::Prime2,
            Attribute::Exponent1(_) => AttributeType::Exponent1,
            Attribute::Exponent2(_) => AttributeType::Exponent2,
            Attribute::Coefficient(_) => AttributeType::Coefficient,
            Attribute::EcParams(_) => AttributeType::EcParams,
            Attribute::EcPoint(_) => AttributeType::EcPoint,
            Attribute::Value(_) => AttributeType::Value,
            Attribute::Subject(_) => AttributeType::Subject,
        }
    }

    /// Returns the value of byte-string attributes, `None` for flags and enumerations.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Attribute::Label(label) => Some(label.as_bytes()),
            Attribute::Modulus(v)
            | Attribute::PublicExponent(v)
            | Attribute::EcParams(v)
            | Attribute::EcPoint(v)
            | Attribute::Subject(v) => Some(v.as_slice()),
            Attribute::PrivateExponent(v)
            | Attribute::Prime1(v)
            | Attribute::Prime2(v)
            | Attribute::Exponent1(v)
            | Attribute::Exponent2(v)
            | Attribute::Coefficient(v)
            | Attribute::Value(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    fn is_secret(&self) -> bool {
        matches!(
            self,
            Attribute::PrivateExponent(_)
                | Attribute::Prime1(_)
                | Attribute::Prime2(_)
                | Attribute::Exponent1(_)
                | Attribute::Exponent2(_)
                | Attribute::Coefficient(_)
        )
    }
}

impl Debug for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.attribute_type();
        match self {
            Attribute::Class(v) => write!(f, "{name:?}({v:?})"),
            Attribute::KeyType(v) => write!(f, "{name:?}({v:?})"),
            Attribute::CertificateType(v) => write!(f, "{name:?}({v:?})"),
            Attribute::Label(v) => write!(f, "{name:?}({v:?})"),
            Attribute::Token(v) | Attribute::Sign(v) | Attribute::Verify(v) => {
                write!(f, "{name:?}({v})")
            }
            Attribute::ModulusBits(v) => write!(f, "{name:?}({v})"),
            // CKA_VALUE may hold an EC private scalar
            Attribute::Value(v) => write!(f, "{name:?}([REDACTED; {}])", v.len()),
            other if other.is_secret() => write!(f, "{name:?}([REDACTED])"),
            other => {
                let len = other.as_bytes().map_or(0, <[u8]>::len);
                write!(f, "{name:?}([{len} bytes])")
            }
        }
    }
}

/// Returns the first attribute of the given type in a template.
pub fn find_attribute(template: &[Attribute], attribute_type: AttributeType) -> Option<&Attribute> {
    template
        .iter()
        .find(|attribute| attribute.attribute_type() == attribute_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_private_components() {
        let template = vec![
            Attribute::Label("device-key".into()),
            Attribute::PrivateExponent(Zeroizing::new(vec![0xaa; 4])),
            Attribute::Value(Zeroizing::new(vec![0xbb; 32])),
            Attribute::Modulus(vec![0xcc; 8]),
        ];

        let printed = format!("{template:?}");

        assert!(printed.contains("device-key"));
        assert!(printed.contains("PrivateExponent([REDACTED])"));
        assert!(printed.contains("Value([REDACTED; 32])"));
        assert!(printed.contains("Modulus([8 bytes])"));
        assert!(!printed.contains("170"));
        assert!(!printed.contains("187"));
    }

    #[test]
    fn finds_attributes_by_type() {
        let template = vec![
            Attribute::Class(ObjectClass::Certificate),
            Attribute::Label("device-cert".into()),
        ];

        assert_eq!(
            find_attribute(&template, AttributeType::Label),
            Some(&Attribute::Label("device-cert".into()))
        );
        assert_eq!(find_attribute(&template, AttributeType::Value), None);
    }

    #[test]
    fn key_type_parses_lowercase_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            key_type: KeyType,
        }

        let parsed: Wrapper = toml::from_str(r#"key_type = "ec""#).unwrap();
        assert_eq!(parsed.key_type, KeyType::Ec);
        let parsed: Wrapper = toml::from_str(r#"key_type = "rsa""#).unwrap();
        assert_eq!(parsed.key_type, KeyType::Rsa);
    }
}
