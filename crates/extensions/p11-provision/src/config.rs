use std::time::Duration;

use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Deserializer;

use crate::store::KeyType;

pub const DEFAULT_PRIVATE_KEY_LABEL: &str = "device-key";
pub const DEFAULT_PUBLIC_KEY_LABEL: &str = "device-pub-key";
pub const DEFAULT_CERTIFICATE_LABEL: &str = "device-cert";
pub const DEFAULT_JITR_CERTIFICATE_LABEL: &str = "jitr-cert";
pub const DEFAULT_CODE_VERIFICATION_KEY_LABEL: &str = "code-verify-key";

pub const SUPPORTED_RSA_MODULUS_BITS: [u32; 3] = [2048, 3072, 4096];

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read the configuration file {path}")]
    FromIo {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid provisioning configuration")]
    FromToml(#[from] toml::de::Error),
}

/// How credentials are provisioned: object labels, accepted key sizes and key generation policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisioningConfig {
    pub labels: Labels,

    /// Size of imported RSA keys, which fixes the width of every RSA field.
    #[serde(deserialize_with = "parse_rsa_modulus_bits")]
    pub rsa_modulus_bits: u32,

    /// Type of the key pair generated when none is provisioned. Only `ec` is supported by tokens.
    pub generate_key_type: KeyType,

    /// Time to wait before generating a key pair, leaving a flashing tool the chance to provision the device.
    #[serde(deserialize_with = "parse_human_duration")]
    pub generation_delay: Duration,

    /// Generate a key pair when the token holds none and none is provided.
    pub generate_missing_key: bool,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        ProvisioningConfig {
            labels: Labels::default(),
            rsa_modulus_bits: 2048,
            generate_key_type: KeyType::Ec,
            generation_delay: Duration::ZERO,
            generate_missing_key: true,
        }
    }
}

impl ProvisioningConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FromIo {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}

/// Labels of the objects provisioned on the token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Labels {
    pub private_key: String,
    pub public_key: String,
    pub certificate: String,
    pub jitr_certificate: String,
    pub code_verification_key: String,
}

impl Default for Labels {
    fn default() -> Self {
        Labels {
            private_key: DEFAULT_PRIVATE_KEY_LABEL.to_string(),
            public_key: DEFAULT_PUBLIC_KEY_LABEL.to_string(),
            certificate: DEFAULT_CERTIFICATE_LABEL.to_string(),
            jitr_certificate: DEFAULT_JITR_CERTIFICATE_LABEL.to_string(),
            code_verification_key: DEFAULT_CODE_VERIFICATION_KEY_LABEL.to_string(),
        }
    }
}

fn parse_human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    humantime::parse_duration(&value).map_err(|_| serde::de::Error::custom("Invalid duration"))
}

fn parse_rsa_modulus_bits<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let bits = u32::deserialize(deserializer)?;
    if SUPPORTED_RSA_MODULUS_BITS.contains(&bits) {
        Ok(bits)
    } else {
        Err(serde::de::Error::custom(format!(
            "Unsupported RSA modulus size {bits}: expected one of {SUPPORTED_RSA_MODULUS_BITS:?}"
        )))
    }
}
