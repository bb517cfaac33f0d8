//! Provisions a device certificate and key pair onto a PKCS #11 token.
//!
//! The certificate and private key are read from PEM files. Without a private key, a P-256 key pair is generated
//! on the token and its public key printed, ready to be certified.

use anyhow::Context;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use clap::Parser;
use clap::Subcommand;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use p11_provision::destroy_credentials;
use p11_provision::provision_device;
use p11_provision::store::CredentialStore;
use p11_provision::store::CryptokiConfig;
use p11_provision::store::CryptokiStore;
use p11_provision::store::InMemoryStore;
use p11_provision::store::KeyType;
use p11_provision::store::SecretString;
use p11_provision::ProvisioningConfig;
use p11_provision::ProvisioningParameters;
use p11_provision::RustCryptoKeyCodec;

/// Provision device credentials onto a PKCS#11 token.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    /// The path to the PKCS#11 module.
    #[arg(long, required_unless_present = "dry_run")]
    module_path: Option<Utf8PathBuf>,

    /// The PIN for the PKCS#11 token.
    #[arg(long, env = "P11_PROVISION_PIN", hide_env_values = true, default_value = "123456")]
    pin: SecretString,

    /// Label of the token to provision. The first token found is used if not set.
    #[arg(long)]
    token_label: Option<String>,

    /// Provision an empty in-memory token instead of a PKCS#11 token.
    #[arg(long)]
    dry_run: bool,

    /// Provisioning configuration file (TOML).
    #[arg(long)]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Import a certificate and private key, generating a key pair when no private key is given.
    Provision(ProvisionArgs),

    /// Destroy all the provisioned objects.
    Destroy,
}

#[derive(Debug, clap::Args)]
struct ProvisionArgs {
    /// Private key to import (PEM).
    #[arg(long)]
    private_key: Option<Utf8PathBuf>,

    /// Expected type of the private key.
    #[arg(long, value_enum, requires = "private_key")]
    key_type: Option<KeyType>,

    /// Device certificate to import (PEM).
    #[arg(long)]
    certificate: Option<Utf8PathBuf>,

    /// DER-encoded subject to store with the certificate, instead of the certificate's own subject.
    #[arg(long, requires = "certificate")]
    subject_der: Option<Utf8PathBuf>,

    /// CA certificate for Just-In-Time Registration (PEM).
    #[arg(long)]
    jitr_certificate: Option<Utf8PathBuf>,

    /// Re-create objects the token holds already.
    #[arg(long)]
    force: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()
                .context("Invalid log filter in RUST_LOG")?,
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ProvisioningConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {path}"))?,
        None => ProvisioningConfig::default(),
    };
    info!(?config, "Using provisioning configuration");

    match args.module_path {
        Some(module_path) if !args.dry_run => {
            let cryptoki_config = CryptokiConfig {
                module_path,
                pin: args.pin,
                token_label: args.token_label,
            };
            info!(?cryptoki_config, "Using cryptoki configuration");
            let store = CryptokiStore::open(&cryptoki_config).context("Failed to open the token")?;
            run(&store, &config, args.command)
        }
        _ => {
            info!("Dry run: provisioning an in-memory token");
            let label = args.token_label.as_deref().unwrap_or("dry-run");
            run(&InMemoryStore::new(label), &config, args.command)
        }
    }
}

fn run<S: CredentialStore + ?Sized>(
    store: &S,
    config: &ProvisioningConfig,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::Provision(args) => {
            let private_key = read_optional(args.private_key.as_deref())?;
            let certificate = read_optional(args.certificate.as_deref())?;
            let subject = read_optional(args.subject_der.as_deref())?;
            let jitr_certificate = read_optional(args.jitr_certificate.as_deref())?;

            let params = ProvisioningParameters {
                private_key: private_key.as_deref().map(Vec::as_slice),
                private_key_type: args.key_type,
                certificate: certificate.as_deref().map(Vec::as_slice),
                certificate_subject: subject.as_deref().map(Vec::as_slice),
                jitr_certificate: jitr_certificate.as_deref().map(Vec::as_slice),
                force: args.force,
            };
            let report = provision_device(store, &RustCryptoKeyCodec, config, &params)
                .context("Failed to provision the device")?;

            for advisory in &report.advisories {
                eprintln!("warning: {advisory}");
            }
            if let Some(public_key_der) = report.state.public_key_der {
                print!("{}", pem::encode(&pem::Pem::new("PUBLIC KEY", public_key_der)));
            }
        }
        Command::Destroy => {
            let destroyed = destroy_credentials(store, &config.labels)
                .context("Failed to destroy the provisioned objects")?;
            println!("Destroyed {destroyed} objects");
        }
    }
    Ok(())
}

fn read_optional(path: Option<&Utf8Path>) -> anyhow::Result<Option<Zeroizing<Vec<u8>>>> {
    path.map(read_file).transpose()
}

fn read_file(path: &Utf8Path) -> anyhow::Result<Zeroizing<Vec<u8>>> {
    std::fs::read(path)
        .map(Zeroizing::new)
        .with_context(|| format!("Failed to read {path}"))
}
