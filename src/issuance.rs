//! Issuance Pipeline
//!
//! ```text
//! check root ─► policy ─► key pair / CSR ─┬─ store lock ──────────────────────────────┐
//!                                          │ serial ─► sign ─► stage files ─► ledger   │
//!                                          │                      commit ─► publish   │
//!                                          └───────────────────────────────────────────┘
//! ```
//!
//! Validation happens before anything touches the store. Key generation runs outside the
//! lock; everything from serial allocation to publishing runs inside it, so ledger entries
//! are committed in serial order. Files are staged as 0600 temp files and only renamed to
//! their final names after the ledger append succeeded: an error at any earlier point
//! leaves no ledger entry and no certificate, key or bundle at a final path.

use std::path::PathBuf;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use openssl::bn::BigNum;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Req, X509};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::error::{CaError, Result};
use crate::generate_root_ca::RsaRootCABuilder;
use crate::generate_user_cert::RsaUserCertBuilder;
use crate::key_material::{generate_csr, generate_rsa, verify_csr, MIN_LEAF_KEY_BITS, ROOT_KEY_BITS};
use crate::ledger::{LedgerEntry, LedgerSubject, RecordedStatus};
use crate::pfx_key::{export_bundle, Bundle};
use crate::policy::{
    derive_identifier, validate_subject, CaIdentity, ProfileKind, SigningProfile, Subject,
    ROOT_IDENTIFIER,
};
use crate::store::{CaStore, CERT_FILE_MODE, KEY_FILE_MODE};

const MAX_ATTEMPTS: u32 = 3;

/// The committed root certificate.
pub struct RootCertificate {
    pub certificate: X509,
    pub entry: LedgerEntry,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// A committed leaf certificate.
pub struct IssuedCertificate {
    pub certificate: X509,
    pub entry: LedgerEntry,
    pub identifier: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub csr_path: PathBuf,
    pub bundle_path: PathBuf,
}

pub struct Issuer<'a> {
    store: &'a CaStore,
    leaf_key_bits: u32,
}

impl<'a> Issuer<'a> {
    pub fn new(store: &'a CaStore) -> Self {
        Self {
            store,
            leaf_key_bits: MIN_LEAF_KEY_BITS,
        }
    }

    pub fn leaf_key_bits(mut self, bits: u32) -> Self {
        self.leaf_key_bits = bits;
        self
    }

    /// Create the self-signed root. Fails with `AlreadyInitialized` if one exists.
    pub fn issue_root(&self, identity: &CaIdentity, validity_days: u32) -> Result<RootCertificate> {
        require_positive_validity(validity_days)?;
        if self.store.has_root() {
            return Err(root_exists(self.store));
        }
        let profile = validate_subject(&Subject::from(identity), identity, ProfileKind::Root)?;

        debug!(bits = ROOT_KEY_BITS, "Generating root key pair");
        let key = generate_rsa(ROOT_KEY_BITS)?;

        with_retries("issue root", || self.commit_root(&profile, &key, validity_days))
    }

    fn commit_root(
        &self,
        profile: &SigningProfile,
        key: &PKey<Private>,
        validity_days: u32,
    ) -> Result<RootCertificate> {
        let lock = self.store.lock()?;
        self.store.sweep_stale(&lock)?;
        // another process may have won the race since the unlocked check
        if self.store.has_root() {
            return Err(root_exists(self.store));
        }

        let serial = self.store.serial_allocator().allocate(&lock)?;
        let serial_hex = hex(&serial)?;
        let (issued_at, expires_at) = validity_window(validity_days);

        let certificate = RsaRootCABuilder::new(profile)
            .serial(serial)
            .validity(issued_at, expires_at)
            .build(key)?;

        let key_pem = key
            .private_key_to_pem_pkcs8()
            .map_err(|e| CaError::signing("encode root key", e))?;
        let cert_pem = certificate
            .to_pem()
            .map_err(|e| CaError::signing("encode root certificate", e))?;

        let staged_key = self.store.stage(&self.store.private_dir(), &key_pem)?;
        let staged_issued = self.store.stage(&self.store.newcerts_dir(), &cert_pem)?;
        let staged_cert = self.store.stage(&self.store.certs_dir(), &cert_pem)?;

        let entry = LedgerEntry {
            serial: serial_hex.clone(),
            kind: ProfileKind::Root,
            subject: LedgerSubject {
                common_name: profile.subject.common_name.clone(),
                email: profile.subject.email.clone(),
                identifier: ROOT_IDENTIFIER.to_string(),
            },
            issuer: profile.subject.common_name.clone(),
            issued_at,
            expires_at,
            status: RecordedStatus::Valid,
        };
        self.store.ledger().append(&entry, &lock)?;

        let key_path = staged_key.publish(&self.store.root_key_path(), KEY_FILE_MODE)?;
        staged_issued.publish(&self.store.issued_cert_path(&serial_hex), CERT_FILE_MODE)?;
        let cert_path = staged_cert.publish(&self.store.root_cert_path(), CERT_FILE_MODE)?;

        info!(
            serial = %serial_hex,
            subject = %entry.subject.common_name,
            expires_at = %expires_at,
            "Issued root CA certificate"
        );
        Ok(RootCertificate {
            certificate,
            entry,
            cert_path,
            key_path,
        })
    }

    /// Issue an S/MIME certificate for `candidate` and export it as a PKCS#12 bundle.
    pub fn issue_leaf(
        &self,
        candidate: &Subject,
        validity_days: u32,
        bundle_password: &SecretString,
    ) -> Result<(IssuedCertificate, Bundle)> {
        let root_cert = self.store.load_root_certificate()?;
        let identity = CaIdentity::from_certificate(&root_cert)?;
        let profile = validate_subject(candidate, &identity, ProfileKind::Leaf)?;
        let identifier = derive_identifier(&profile.subject.email)?;
        require_positive_validity(validity_days)?;
        if bundle_password.expose_secret().is_empty() {
            return Err(CaError::UsageError(
                "bundle password must not be empty".to_string(),
            ));
        }
        let root_key = self.store.load_root_key()?;

        debug!(bits = self.leaf_key_bits, email = %profile.subject.email, "Generating leaf key pair");
        let key = generate_rsa(self.leaf_key_bits)?;
        let csr = generate_csr(&key, &profile.subject)?;
        verify_csr(&csr)?;

        let request = LeafRequest {
            profile: &profile,
            identifier: &identifier,
            key: &key,
            csr: &csr,
            root_key: &root_key,
            root_cert: &root_cert,
            issuer: &identity.common_name,
        };
        with_retries("issue leaf", || {
            self.commit_leaf(&request, validity_days, bundle_password)
        })
    }

    fn commit_leaf(
        &self,
        request: &LeafRequest<'_>,
        validity_days: u32,
        bundle_password: &SecretString,
    ) -> Result<(IssuedCertificate, Bundle)> {
        let lock = self.store.lock()?;
        self.store.sweep_stale(&lock)?;

        let serial = self.store.serial_allocator().allocate(&lock)?;
        let serial_hex = hex(&serial)?;
        let (issued_at, expires_at) = validity_window(validity_days);

        let certificate = RsaUserCertBuilder::new(request.root_key, request.root_cert, request.profile)
            .serial(serial)
            .validity(issued_at, expires_at)
            .build(request.csr)?;

        let bundle = export_bundle(
            request.key,
            &certificate,
            request.root_cert,
            &request.profile.subject.email,
            bundle_password,
        )?;

        let key_pem = request
            .key
            .private_key_to_pem_pkcs8()
            .map_err(|e| CaError::signing("encode user key", e))?;
        let csr_pem = request
            .csr
            .to_pem()
            .map_err(|e| CaError::signing("encode certificate request", e))?;
        let cert_pem = certificate
            .to_pem()
            .map_err(|e| CaError::signing("encode user certificate", e))?;

        let staged_key = self.store.stage(&self.store.private_dir(), &key_pem)?;
        let staged_csr = self.store.stage(&self.store.csr_dir(), &csr_pem)?;
        let staged_issued = self.store.stage(&self.store.newcerts_dir(), &cert_pem)?;
        let staged_cert = self.store.stage(&self.store.certs_dir(), &cert_pem)?;
        let staged_bundle = self.store.stage(&self.store.bundles_dir(), &bundle.der)?;

        let entry = LedgerEntry {
            serial: serial_hex.clone(),
            kind: ProfileKind::Leaf,
            subject: LedgerSubject {
                common_name: request.profile.subject.common_name.clone(),
                email: request.profile.subject.email.clone(),
                identifier: request.identifier.to_string(),
            },
            issuer: request.issuer.to_string(),
            issued_at,
            expires_at,
            status: RecordedStatus::Valid,
        };
        self.store.ledger().append(&entry, &lock)?;

        let identifier = request.identifier;
        let key_path = staged_key.publish(&self.store.leaf_key_path(identifier), KEY_FILE_MODE)?;
        let csr_path = staged_csr.publish(&self.store.leaf_csr_path(identifier), CERT_FILE_MODE)?;
        staged_issued.publish(&self.store.issued_cert_path(&serial_hex), CERT_FILE_MODE)?;
        let cert_path = staged_cert.publish(&self.store.leaf_cert_path(identifier), CERT_FILE_MODE)?;
        let bundle_path = staged_bundle.publish(&self.store.bundle_path(identifier), KEY_FILE_MODE)?;

        info!(
            serial = %serial_hex,
            email = %entry.subject.email,
            expires_at = %expires_at,
            "Issued user certificate"
        );
        Ok((
            IssuedCertificate {
                certificate,
                entry,
                identifier: identifier.to_string(),
                cert_path,
                key_path,
                csr_path,
                bundle_path,
            },
            bundle,
        ))
    }
}

struct LeafRequest<'r> {
    profile: &'r SigningProfile,
    identifier: &'r str,
    key: &'r PKey<Private>,
    csr: &'r X509Req,
    root_key: &'r PKey<Private>,
    root_cert: &'r X509,
    issuer: &'r str,
}

/// Run `op`, retrying errors that clear up on a second attempt.
fn with_retries<T>(operation: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                warn!(operation, attempt, error = %e, "Retrying");
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Validity window starting now, truncated to whole seconds as X.509 stores it.
fn validity_window(validity_days: u32) -> (DateTime<Utc>, DateTime<Utc>) {
    let issued_at = Utc::now().trunc_subsecs(0);
    (issued_at, issued_at + Duration::days(i64::from(validity_days)))
}

fn require_positive_validity(validity_days: u32) -> Result<()> {
    if validity_days == 0 {
        return Err(CaError::UsageError(
            "validity must be at least one day".to_string(),
        ));
    }
    Ok(())
}

fn root_exists(store: &CaStore) -> CaError {
    CaError::AlreadyInitialized(format!(
        "root certificate already exists at {}",
        store.root_cert_path().display()
    ))
}

fn hex(serial: &BigNum) -> Result<String> {
    Ok(serial
        .to_hex_str()
        .map_err(|e| CaError::Ledger(e.to_string()))?
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration as StdDuration;

    #[test]
    fn retries_only_retryable_errors() {
        let calls = Cell::new(0);
        let result: Result<()> = with_retries("test", || {
            calls.set(calls.get() + 1);
            Err(CaError::LockTimeout(StdDuration::from_millis(1)))
        });
        assert!(matches!(result, Err(CaError::LockTimeout(_))));
        assert_eq!(calls.get(), MAX_ATTEMPTS);

        let calls = Cell::new(0);
        let result: Result<()> = with_retries("test", || {
            calls.set(calls.get() + 1);
            Err(CaError::InvalidEmail("a@b".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retry_recovers_after_collision() {
        let calls = Cell::new(0);
        let result = with_retries("test", || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err(CaError::SerialCollision("1000".into()))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn validity_window_is_whole_seconds() {
        let (issued_at, expires_at) = validity_window(1);
        assert_eq!(issued_at.timestamp_subsec_nanos(), 0);
        assert_eq!(expires_at - issued_at, Duration::days(1));
    }

    #[test]
    fn zero_validity_is_a_usage_error() {
        assert!(matches!(
            require_positive_validity(0),
            Err(CaError::UsageError(_))
        ));
    }
}
