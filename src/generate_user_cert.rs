//! User Certificate Generation Module
//!
//! Signs end-entity S/MIME certificates with the root CA key. The public key comes from
//! the user's certificate request; subject and extensions come from the signing policy.
//!
//! # PKI Hierarchy Position
//! ```text
//! Root CA (self-signed)
//!   └── User Certificate (signed by Root) ← This module
//! ```
//!
//! # Certificate Properties
//! - **Key Usage**: nonRepudiation, digitalSignature, keyEncipherment
//! - **Extended Key Usage**: emailProtection
//! - **Subject Alternative Name**: the user's email
//! - **Basic Constraints**: CA=false (cannot sign other certificates)
//! - **Version**: X.509v3 with extensions

use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Ref, X509ReqRef, X509};

use crate::error::{CaError, Result};
use crate::generate_root_ca::X509_VERSION_3;
use crate::key_material::verify_csr;
use crate::policy::{ProfileKind, SigningProfile};

/// Builder for user certificates signed by the root CA
pub struct RsaUserCertBuilder<'a> {
    signing_key: &'a PKey<Private>,
    signing_cert: &'a X509Ref,
    profile: &'a SigningProfile,
    serial: Option<BigNum>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl<'a> RsaUserCertBuilder<'a> {
    /// Create a new user certificate builder
    ///
    /// # Arguments
    /// * `ca_key` - Root CA private key for signing
    /// * `ca_cert` - Root CA certificate (issuer information)
    /// * `profile` - Leaf profile produced by the signing policy
    pub fn new(ca_key: &'a PKey<Private>, ca_cert: &'a X509Ref, profile: &'a SigningProfile) -> Self {
        let now = Utc::now();
        Self {
            signing_key: ca_key,
            signing_cert: ca_cert,
            profile,
            serial: None,
            not_before: now,
            not_after: now,
        }
    }

    pub fn serial(mut self, serial: BigNum) -> Self {
        self.serial = Some(serial);
        self
    }

    pub fn validity(mut self, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    /// Sign a certificate for the key carried by `csr`
    ///
    /// The request's own signature is checked first. The subject of the issued certificate
    /// is the one the policy approved, not whatever the request claims.
    pub fn build(self, csr: &X509ReqRef) -> Result<X509> {
        let step = "sign user certificate";
        if self.profile.kind != ProfileKind::Leaf {
            return Err(CaError::signing(step, "profile is not a leaf profile"));
        }
        let serial = self
            .serial
            .ok_or_else(|| CaError::signing(step, "no serial number allocated"))?;
        verify_csr(csr)?;
        let public_key = csr.public_key().map_err(|e| CaError::signing(step, e))?;

        let mut builder = X509::builder().map_err(|e| CaError::signing(step, e))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| CaError::signing(step, e))?;

        let asn1_serial = serial
            .to_asn1_integer()
            .map_err(|e| CaError::signing(step, e))?;
        builder
            .set_serial_number(&asn1_serial)
            .map_err(|e| CaError::signing(step, e))?;

        let subject_name = self.profile.subject.to_x509_name()?;
        builder
            .set_subject_name(&subject_name)
            .map_err(|e| CaError::signing(step, e))?;
        // Set issuer to the root CA's subject
        builder
            .set_issuer_name(self.signing_cert.subject_name())
            .map_err(|e| CaError::signing(step, e))?;

        let not_before = Asn1Time::from_unix(self.not_before.timestamp())
            .map_err(|e| CaError::signing(step, e))?;
        builder
            .set_not_before(&not_before)
            .map_err(|e| CaError::signing(step, e))?;
        let not_after = Asn1Time::from_unix(self.not_after.timestamp())
            .map_err(|e| CaError::signing(step, e))?;
        builder
            .set_not_after(&not_after)
            .map_err(|e| CaError::signing(step, e))?;

        builder
            .set_pubkey(&public_key)
            .map_err(|e| CaError::signing(step, e))?;

        self.profile
            .extensions
            .apply(&mut builder, Some(self.signing_cert))?;

        // Sign with the root CA's private key
        builder
            .sign(self.signing_key, MessageDigest::sha256())
            .map_err(|e| CaError::signing(step, e))?;

        Ok(builder.build())
    }
}
