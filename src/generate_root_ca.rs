//! Root CA Certificate Generation Module
//!
//! Builds the self-signed root certificate that anchors every S/MIME certificate issued
//! by the store.
//!
//! # Certificate Properties
//! - **Self-signed**: Issuer and subject are the same
//! - **Subject**: Copied from the CA identity by the signing policy
//! - **Key Usage**: keyCertSign, cRLSign, digitalSignature
//! - **Basic Constraints**: CA=true, pathlen=0 (signs end-entity certificates only)
//! - **Key Size**: RSA 4096-bit
//! - **Serial Number**: Allocated from the store's serial counter
//! - **Version**: X.509v3 with extensions
//!
//! # Example
//! ```rust,no_run
//! # use smime_ca::generate_root_ca::RsaRootCABuilder;
//! # use smime_ca::key_material::{generate_rsa, ROOT_KEY_BITS};
//! # use smime_ca::policy::{validate_subject, CaIdentity, ProfileKind, Subject};
//! # use openssl::bn::BigNum;
//! # fn example(identity: CaIdentity) -> smime_ca::Result<()> {
//! let profile = validate_subject(&Subject::from(&identity), &identity, ProfileKind::Root)?;
//! let key = generate_rsa(ROOT_KEY_BITS)?;
//! let now = chrono::Utc::now();
//! let certificate = RsaRootCABuilder::new(&profile)
//!     .serial(BigNum::from_u32(0x1000).unwrap())
//!     .validity(now, now + chrono::Duration::days(3650))
//!     .build(&key)?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

use crate::error::{CaError, Result};
use crate::policy::{ProfileKind, SigningProfile};

pub(crate) const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2

// ================= RSA Root CA Builder =================

/// Builder for the self-signed root CA certificate
///
/// The subject and extension set come from a [`SigningProfile`] produced by the policy
/// engine for [`ProfileKind::Root`]; serial and validity window come from the issuance
/// pipeline so they match the ledger entry exactly.
pub struct RsaRootCABuilder<'a> {
    profile: &'a SigningProfile,
    serial: Option<BigNum>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl<'a> RsaRootCABuilder<'a> {
    pub fn new(profile: &'a SigningProfile) -> Self {
        let now = Utc::now();
        Self {
            profile,
            serial: None,
            not_before: now,
            not_after: now,
        }
    }

    /// Set the allocated serial number
    pub fn serial(mut self, serial: BigNum) -> Self {
        self.serial = Some(serial);
        self
    }

    /// Set the validity window
    pub fn validity(mut self, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    /// Build and self-sign the root certificate with `private_key`
    ///
    /// # Errors
    /// Returns `SigningFailure` naming the step if:
    /// - The profile is not a root profile or no serial was set
    /// - Any X.509 field or extension cannot be set
    /// - Certificate signing fails
    pub fn build(self, private_key: &PKey<Private>) -> Result<X509> {
        let step = "sign root certificate";
        if self.profile.kind != ProfileKind::Root {
            return Err(CaError::signing(step, "profile is not a root profile"));
        }
        let serial = self
            .serial
            .ok_or_else(|| CaError::signing(step, "no serial number allocated"))?;

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

        let name = self.profile.subject.to_x509_name()?;
        builder
            .set_subject_name(&name)
            .map_err(|e| CaError::signing(step, e))?;
        builder
            .set_issuer_name(&name)
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

        // Set public key (extracted from private_key automatically)
        builder
            .set_pubkey(private_key)
            .map_err(|e| CaError::signing(step, e))?;

        self.profile.extensions.apply(&mut builder, None)?;

        builder
            .sign(private_key, MessageDigest::sha256())
            .map_err(|e| CaError::signing(step, e))?;
        Ok(builder.build())
    }
}
