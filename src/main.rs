//! smime-ca - Local S/MIME Certificate Authority
//!
//! Command-line front end for the CA store:
//!
//! ```bash
//! smime-ca init
//! smime-ca create-root-ca
//! SMIME_CA_BUNDLE_PASSWORD=... smime-ca create-user-cert alice@example.com
//! smime-ca verify-cert alice@example.com
//! smime-ca list
//! ```
//!
//! Settings come from `config.toml` (or `--config <path>`); without a config file the
//! built-in defaults are used. The exit status is 0 only when the operation committed,
//! or for `verify-cert`, when the certificate is valid.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tracing::error;

use smime_ca::configs::AppConfig;
use smime_ca::issuance::Issuer;
use smime_ca::logging;
use smime_ca::policy::{derive_identifier, validate_email, CaIdentity, Subject};
use smime_ca::store::CaStore;
use smime_ca::verifier::{CertificateRef, Verifier};

#[derive(Parser)]
#[command(name = "smime-ca")]
#[command(about = "Local certificate authority for S/MIME certificates")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// CA store directory (overrides the configured path)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty CA store
    Init,
    /// Create the self-signed root certificate
    CreateRootCa,
    /// Issue an S/MIME certificate and PKCS#12 bundle for an email address
    CreateUserCert { email: String },
    /// Verify the certificate issued to an email address
    VerifyCert { email: String },
    /// List every certificate recorded in the ledger
    List,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version arrive here as well
            let _ = e.print();
            return ExitCode::from(parse_exit_status(&e));
        }
    };
    let mut config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(store) = &cli.store {
        config.store.path = store.clone();
    }
    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli.command, &config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Usage errors exit 1 like every other failure; help and version output exit 0.
fn parse_exit_status(error: &clap::Error) -> u8 {
    if error.use_stderr() {
        1
    } else {
        0
    }
}

/// Returns `Ok(false)` when the command ran but its outcome is negative.
fn run(command: Command, config: &AppConfig) -> Result<bool> {
    let store_path = &config.store.path;
    let lock_timeout = config.store.lock_timeout();

    match command {
        Command::Init => {
            CaStore::init(store_path, lock_timeout)
                .with_context(|| format!("Failed to initialize {}", store_path.display()))?;
            println!("✓ CA store initialized at {}", store_path.display());
        }
        Command::CreateRootCa => {
            let store = CaStore::open(store_path, lock_timeout)?;
            let root = Issuer::new(&store)
                .issue_root(&config.ca_identity.to_identity(), config.validity.root_days)
                .context("Failed to create root CA")?;
            println!(
                "✓ Root CA {} (serial {}) written to {}",
                root.entry.subject.common_name,
                root.entry.serial,
                root.cert_path.display()
            );
        }
        Command::CreateUserCert { email } => {
            validate_email(&email)?;
            let store = CaStore::open(store_path, lock_timeout)?;
            let root = store.load_root_certificate()?;
            let identity = CaIdentity::from_certificate(&root)?;
            let password = bundle_password(config)?;
            let (issued, _bundle) = Issuer::new(&store)
                .leaf_key_bits(config.keys.leaf_bits)
                .issue_leaf(
                    &Subject::for_email(&email, &identity),
                    config.validity.leaf_days,
                    &password,
                )
                .with_context(|| format!("Failed to issue certificate for {}", email))?;
            println!(
                "✓ Certificate for {} (serial {}) written to {}",
                email,
                issued.entry.serial,
                issued.cert_path.display()
            );
            println!("✓ PKCS#12 bundle written to {}", issued.bundle_path.display());
        }
        Command::VerifyCert { email } => {
            let identifier = derive_identifier(&email)?;
            let store = CaStore::open(store_path, lock_timeout)?;
            let report = Verifier::new(&store)
                .verify(&CertificateRef::Identifier(identifier), Utc::now())
                .with_context(|| format!("Failed to verify certificate for {}", email))?;
            let status = report
                .status
                .map_or_else(|| "unrecorded".to_string(), |s| s.to_string());
            println!("Subject:    {}", report.subject);
            println!("Serial:     {}", report.serial);
            println!("Not after:  {}", report.not_after);
            println!("Chain:      {}", if report.chain_ok { "ok" } else { "FAILED" });
            println!("In window:  {}", if report.not_expired { "yes" } else { "no" });
            println!("Status:     {}", status);
            if report.valid {
                println!("✓ Certificate is valid");
            } else {
                println!("✗ Certificate is not valid");
                return Ok(false);
            }
        }
        Command::List => {
            let store = CaStore::open(store_path, lock_timeout)?;
            let now = Utc::now();
            for entry in store.ledger().entries()? {
                println!(
                    "{:>8}  {:<4}  {:<8}  {}  {}",
                    entry.serial,
                    entry.kind.to_string(),
                    entry.status_at(now).to_string(),
                    entry.expires_at.format("%Y-%m-%d"),
                    entry.subject.email
                );
            }
        }
    }
    Ok(true)
}

/// Password from the configured environment variable, or prompted on the terminal.
fn bundle_password(config: &AppConfig) -> Result<SecretString> {
    if let Ok(password) = std::env::var(&config.bundle.password_env) {
        return Ok(SecretString::from(password));
    }
    let password = rpassword::prompt_password("PKCS#12 bundle password: ")
        .context("Failed to read bundle password")?;
    Ok(SecretString::from(password))
}
