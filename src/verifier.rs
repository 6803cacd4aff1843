//! Certificate Verifier
//!
//! Checks an issued certificate against the store's root and the ledger. Takes no lock:
//! certificates and the root are only ever replaced by rename, so a reader sees either the
//! old or the new file.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::nid::Nid;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509Ref, X509StoreContext, X509VerifyResult, X509};
use serde::Serialize;
use tracing::debug;

use crate::error::{CaError, Result};
use crate::ledger::CertificateStatus;
use crate::policy::name_text;
use crate::store::CaStore;

/// Which certificate to verify.
#[derive(Debug, Clone)]
pub enum CertificateRef {
    /// `certs/<identifier>.cert.pem`
    Identifier(String),
    /// Any PEM file
    Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub valid: bool,
    pub chain_ok: bool,
    pub not_expired: bool,
    pub recorded: bool,
    /// Ledger status at the time of the check; `None` when not recorded
    pub status: Option<CertificateStatus>,
    pub subject: String,
    pub serial: String,
    pub not_after: String,
}

/// Cryptographic part of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainCheck {
    pub chain_ok: bool,
    pub not_expired: bool,
}

pub struct Verifier<'a> {
    store: &'a CaStore,
}

impl<'a> Verifier<'a> {
    pub fn new(store: &'a CaStore) -> Self {
        Self { store }
    }

    pub fn verify(&self, certificate: &CertificateRef, now: DateTime<Utc>) -> Result<VerificationReport> {
        let path = match certificate {
            CertificateRef::Identifier(identifier) => self.store.leaf_cert_path(identifier),
            CertificateRef::Path(path) => path.clone(),
        };
        let cert = load_certificate(&path)?;
        let root = self.store.load_root_certificate().map_err(|e| match e {
            CaError::RootNotFound(path) => CaError::VerificationError(format!(
                "root certificate not found at {}",
                path.display()
            )),
            other => other,
        })?;

        let check = verify_against(&cert, &root, now)?;
        let serial = serial_hex(&cert)?;
        let entry = self.store.ledger().find_by_serial(&serial)?;
        let status = entry.as_ref().map(|e| e.status_at(now));
        let recorded = entry.is_some();

        let report = VerificationReport {
            valid: check.chain_ok
                && check.not_expired
                && recorded
                && status == Some(CertificateStatus::Valid),
            chain_ok: check.chain_ok,
            not_expired: check.not_expired,
            recorded,
            status,
            subject: common_name(&cert),
            serial,
            not_after: cert.not_after().to_string(),
        };
        debug!(path = %path.display(), valid = report.valid, "Verified certificate");
        Ok(report)
    }
}

/// Check `cert` was signed by `root` and is inside its validity window at `now`.
pub fn verify_against(cert: &X509Ref, root: &X509Ref, now: DateTime<Utc>) -> Result<ChainCheck> {
    let step = |e: openssl::error::ErrorStack| CaError::VerificationError(e.to_string());

    let issuer_matches = root.issued(cert) == X509VerifyResult::OK;
    let root_key = root.public_key().map_err(step)?;
    // a failed signature check surfaces as an error stack, which just means "not signed by root"
    let signature_ok = cert.verify(&root_key).unwrap_or(false);

    let mut store_builder = X509StoreBuilder::new().map_err(step)?;
    store_builder.add_cert(root.to_owned()).map_err(step)?;
    store_builder
        .set_flags(X509VerifyFlags::NO_CHECK_TIME)
        .map_err(step)?;
    let trust = store_builder.build();
    let untrusted = Stack::<X509>::new().map_err(step)?;
    let mut context = X509StoreContext::new().map_err(step)?;
    let path_ok = context
        .init(&trust, cert, &untrusted, |c| c.verify_cert())
        .map_err(step)?;

    let now = Asn1Time::from_unix(now.timestamp()).map_err(step)?;
    let not_expired = not_later(cert.not_before(), &now)? && not_later(&now, cert.not_after())?;

    Ok(ChainCheck {
        chain_ok: issuer_matches && signature_ok && path_ok,
        not_expired,
    })
}

fn not_later(a: &Asn1TimeRef, b: &Asn1TimeRef) -> Result<bool> {
    let ordering = a
        .compare(b)
        .map_err(|e| CaError::VerificationError(e.to_string()))?;
    Ok(ordering != Ordering::Greater)
}

fn load_certificate(path: &Path) -> Result<X509> {
    let pem = fs::read(path).map_err(|e| {
        CaError::VerificationError(format!("cannot read certificate {}: {}", path.display(), e))
    })?;
    X509::from_pem(&pem).map_err(|e| {
        CaError::VerificationError(format!("cannot parse certificate {}: {}", path.display(), e))
    })
}

fn serial_hex(cert: &X509Ref) -> Result<String> {
    let bn = cert
        .serial_number()
        .to_bn()
        .map_err(|e| CaError::VerificationError(e.to_string()))?;
    Ok(bn
        .to_hex_str()
        .map_err(|e| CaError::VerificationError(e.to_string()))?
        .to_string())
}

fn common_name(cert: &X509Ref) -> String {
    name_text(cert.subject_name(), Nid::COMMONNAME).unwrap_or_default()
}
