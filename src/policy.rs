//! Signing Policy Engine
//!
//! Decides which subject a certificate gets and which X.509v3 extensions are applied,
//! depending on the profile being issued:
//!
//! ```text
//! Root CA (self-signed, CA=true, pathlen=0)   ← subject copied from the CA identity
//!   └── S/MIME leaf (CA=false)                ← O, OU, C, ST must match the root
//! ```
//!
//! # Leaf Policy
//! The candidate's organization, organizational unit, country and state must equal the
//! CA identity recorded in the root certificate. Common name and email are free, but the
//! email must look like `localpart@domain.tld`.
//!
//! # Extension Sets
//! - **Root**: basicConstraints CA=true (critical), keyUsage keyCertSign, cRLSign,
//!   digitalSignature (critical), subjectKeyIdentifier
//! - **Leaf**: basicConstraints CA=false (critical), keyUsage nonRepudiation,
//!   digitalSignature, keyEncipherment (critical), extendedKeyUsage emailProtection,
//!   subjectAltName email, subject/authority key identifiers

use std::sync::LazyLock;

use openssl::nid::Nid;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509Name, X509NameRef, X509Ref};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CaError, Result};

const ROOT_CA_PATH_LENGTH: u32 = 0;

/// File identifier of the root; no leaf may derive it.
pub const ROOT_IDENTIFIER: &str = "ca";

/// Upper bound of an X.509 common name (ub-common-name). Leaf CNs are the email.
pub const MAX_COMMON_NAME_LEN: usize = 64;

// the local part may not start with a dot, so no identifier names a hidden file
static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_%+-][A-Za-z0-9._%+-]*@(?:[A-Za-z0-9-]+\.)+[A-Za-z]{2,}$")
        .expect("email pattern is a valid regex")
});

/// Identity of the certificate authority. Immutable once the root certificate exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaIdentity {
    pub common_name: String,
    pub organization: String,
    pub organizational_unit: String,
    pub country: String,
    pub state: String,
    pub locality: String,
    pub email: String,
}

impl CaIdentity {
    /// Read the identity back from a root certificate's subject.
    pub fn from_certificate(cert: &X509Ref) -> Result<Self> {
        let name = cert.subject_name();
        Ok(Self {
            common_name: name_entry(name, Nid::COMMONNAME, "common name")?,
            organization: name_entry(name, Nid::ORGANIZATIONNAME, "organization")?,
            organizational_unit: name_entry(
                name,
                Nid::ORGANIZATIONALUNITNAME,
                "organizational unit",
            )?,
            country: name_entry(name, Nid::COUNTRYNAME, "country")?,
            state: name_entry(name, Nid::STATEORPROVINCENAME, "state")?,
            locality: name_entry(name, Nid::LOCALITYNAME, "locality")?,
            email: name_entry(name, Nid::PKCS9_EMAILADDRESS, "email")?,
        })
    }
}

fn name_entry(name: &X509NameRef, nid: Nid, field: &str) -> Result<String> {
    name_text(name, nid).ok_or_else(|| {
        CaError::VerificationError(format!("root certificate subject has no {}", field))
    })
}

/// First `nid` entry of `name` as text. The raw bytes are used so an embedded NUL is
/// kept rather than cutting the value short.
pub fn name_text(name: &X509NameRef, nid: Nid) -> Option<String> {
    name.entries_by_nid(nid)
        .next()
        .and_then(|entry| std::str::from_utf8(entry.data().as_slice()).ok())
        .map(str::to_string)
}

/// Subject requested for a certificate (and, once validated, the subject it gets).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub common_name: String,
    pub email: String,
    pub organization: String,
    pub organizational_unit: String,
    pub country: String,
    pub state: String,
    pub locality: String,
}

impl Subject {
    /// Leaf candidate for `email` carrying the organizational fields of `identity`.
    pub fn for_email(email: &str, identity: &CaIdentity) -> Self {
        Self {
            common_name: email.to_string(),
            email: email.to_string(),
            organization: identity.organization.clone(),
            organizational_unit: identity.organizational_unit.clone(),
            country: identity.country.clone(),
            state: identity.state.clone(),
            locality: identity.locality.clone(),
        }
    }

    pub fn to_x509_name(&self) -> Result<X509Name> {
        let step = "build subject name";
        let mut name_builder = X509Name::builder().map_err(|e| CaError::signing(step, e))?;
        for (nid, value) in [
            (Nid::COMMONNAME, &self.common_name),
            (Nid::ORGANIZATIONNAME, &self.organization),
            (Nid::ORGANIZATIONALUNITNAME, &self.organizational_unit),
            (Nid::LOCALITYNAME, &self.locality),
            (Nid::STATEORPROVINCENAME, &self.state),
            (Nid::COUNTRYNAME, &self.country),
            (Nid::PKCS9_EMAILADDRESS, &self.email),
        ] {
            name_builder
                .append_entry_by_nid(nid, value)
                .map_err(|e| CaError::signing(step, format!("{:?}={:?}: {}", nid, value, e)))?;
        }
        Ok(name_builder.build())
    }
}

impl From<&CaIdentity> for Subject {
    fn from(identity: &CaIdentity) -> Self {
        Self {
            common_name: identity.common_name.clone(),
            email: identity.email.clone(),
            organization: identity.organization.clone(),
            organizational_unit: identity.organizational_unit.clone(),
            country: identity.country.clone(),
            state: identity.state.clone(),
            locality: identity.locality.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    Root,
    Leaf,
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProfileKind::Root => "root",
            ProfileKind::Leaf => "leaf",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsageFlag {
    DigitalSignature,
    NonRepudiation,
    KeyEncipherment,
    KeyCertSign,
    CrlSign,
}

/// X.509v3 extensions selected by the policy for one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSet {
    pub ca: bool,
    pub path_length: Option<u32>,
    pub key_usage: Vec<KeyUsageFlag>,
    pub email_protection: bool,
    pub subject_alt_email: Option<String>,
}

impl ExtensionSet {
    fn root() -> Self {
        Self {
            ca: true,
            path_length: Some(ROOT_CA_PATH_LENGTH),
            key_usage: vec![
                KeyUsageFlag::KeyCertSign,
                KeyUsageFlag::CrlSign,
                KeyUsageFlag::DigitalSignature,
            ],
            email_protection: false,
            subject_alt_email: None,
        }
    }

    fn leaf(email: &str) -> Self {
        Self {
            ca: false,
            path_length: None,
            key_usage: vec![
                KeyUsageFlag::NonRepudiation,
                KeyUsageFlag::DigitalSignature,
                KeyUsageFlag::KeyEncipherment,
            ],
            email_protection: true,
            subject_alt_email: Some(email.to_string()),
        }
    }

    /// Append the extensions to `builder`. The public key must already be set;
    /// `issuer` is `None` for self-signed certificates.
    pub fn apply(&self, builder: &mut X509Builder, issuer: Option<&X509Ref>) -> Result<()> {
        let step = "apply extensions";

        let mut bc = BasicConstraints::new();
        bc.critical();
        if self.ca {
            bc.ca();
            if let Some(path_length) = self.path_length {
                bc.pathlen(path_length);
            }
        }
        let extension = bc.build().map_err(|e| CaError::signing(step, e))?;
        builder
            .append_extension(extension)
            .map_err(|e| CaError::signing(step, e))?;

        let mut ku = KeyUsage::new();
        ku.critical();
        for flag in &self.key_usage {
            match flag {
                KeyUsageFlag::DigitalSignature => ku.digital_signature(),
                KeyUsageFlag::NonRepudiation => ku.non_repudiation(),
                KeyUsageFlag::KeyEncipherment => ku.key_encipherment(),
                KeyUsageFlag::KeyCertSign => ku.key_cert_sign(),
                KeyUsageFlag::CrlSign => ku.crl_sign(),
            };
        }
        let extension = ku.build().map_err(|e| CaError::signing(step, e))?;
        builder
            .append_extension(extension)
            .map_err(|e| CaError::signing(step, e))?;

        if self.email_protection {
            let extension = ExtendedKeyUsage::new()
                .email_protection()
                .build()
                .map_err(|e| CaError::signing(step, e))?;
            builder
                .append_extension(extension)
                .map_err(|e| CaError::signing(step, e))?;
        }

        let extension = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(issuer, None))
            .map_err(|e| CaError::signing(step, e))?;
        builder
            .append_extension(extension)
            .map_err(|e| CaError::signing(step, e))?;

        if issuer.is_some() {
            let extension = AuthorityKeyIdentifier::new()
                .keyid(false)
                .build(&builder.x509v3_context(issuer, None))
                .map_err(|e| CaError::signing(step, e))?;
            builder
                .append_extension(extension)
                .map_err(|e| CaError::signing(step, e))?;
        }

        if let Some(email) = &self.subject_alt_email {
            let extension = SubjectAlternativeName::new()
                .email(email)
                .build(&builder.x509v3_context(issuer, None))
                .map_err(|e| CaError::signing(step, e))?;
            builder
                .append_extension(extension)
                .map_err(|e| CaError::signing(step, e))?;
        }

        Ok(())
    }
}

/// Outcome of a successful policy check: the subject and extensions to sign with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningProfile {
    pub kind: ProfileKind,
    pub subject: Subject,
    pub extensions: ExtensionSet,
}

/// Validate `candidate` against the CA identity for the requested profile.
pub fn validate_subject(
    candidate: &Subject,
    identity: &CaIdentity,
    profile: ProfileKind,
) -> Result<SigningProfile> {
    match profile {
        ProfileKind::Root => {
            validate_identity(identity)?;
            Ok(SigningProfile {
                kind: ProfileKind::Root,
                subject: Subject::from(identity),
                extensions: ExtensionSet::root(),
            })
        }
        ProfileKind::Leaf => {
            validate_email(&candidate.email)?;
            if candidate.common_name.trim().is_empty() {
                return Err(CaError::UsageError("common name must not be empty".into()));
            }
            if candidate.common_name.len() > MAX_COMMON_NAME_LEN {
                return Err(CaError::UsageError(format!(
                    "common name must be at most {} bytes",
                    MAX_COMMON_NAME_LEN
                )));
            }
            require_match("organization", &identity.organization, &candidate.organization)?;
            require_match(
                "organizational unit",
                &identity.organizational_unit,
                &candidate.organizational_unit,
            )?;
            require_match("country", &identity.country, &candidate.country)?;
            require_match("state", &identity.state, &candidate.state)?;
            Ok(SigningProfile {
                kind: ProfileKind::Leaf,
                subject: candidate.clone(),
                extensions: ExtensionSet::leaf(&candidate.email),
            })
        }
    }
}

fn validate_identity(identity: &CaIdentity) -> Result<()> {
    validate_email(&identity.email)?;
    if identity.country.len() != 2 || !identity.country.chars().all(|c| c.is_ascii_alphabetic())
    {
        return Err(CaError::UsageError(format!(
            "country must be a 2-letter code, got {:?}",
            identity.country
        )));
    }
    if identity.common_name.len() > MAX_COMMON_NAME_LEN {
        return Err(CaError::UsageError(format!(
            "CA common name must be at most {} bytes",
            MAX_COMMON_NAME_LEN
        )));
    }
    for (field, value) in [
        ("common name", &identity.common_name),
        ("organization", &identity.organization),
        ("organizational unit", &identity.organizational_unit),
        ("state", &identity.state),
        ("locality", &identity.locality),
    ] {
        if value.trim().is_empty() {
            return Err(CaError::UsageError(format!("CA {} must not be empty", field)));
        }
    }
    Ok(())
}

fn require_match(field: &'static str, expected: &str, actual: &str) -> Result<()> {
    if expected != actual {
        return Err(CaError::PolicyMismatch {
            field,
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Check `email` against `localpart@domain.tld`, at most [`MAX_COMMON_NAME_LEN`] bytes.
pub fn validate_email(email: &str) -> Result<()> {
    if email.len() <= MAX_COMMON_NAME_LEN && EMAIL_PATTERN.is_match(email) {
        Ok(())
    } else {
        Err(CaError::InvalidEmail(email.to_string()))
    }
}

/// File-name identifier for a leaf: the local part of its email.
///
/// The root's identifier is reserved, so `ca@<domain>` cannot be issued a leaf.
pub fn derive_identifier(email: &str) -> Result<String> {
    validate_email(email)?;
    let (local, _) = email
        .split_once('@')
        .ok_or_else(|| CaError::InvalidEmail(email.to_string()))?;
    if local == ROOT_IDENTIFIER {
        return Err(CaError::UsageError(format!(
            "{:?} would take the root certificate's file names",
            email
        )));
    }
    Ok(local.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> CaIdentity {
        CaIdentity {
            common_name: "Test Root CA".to_string(),
            organization: "ACME Corp".to_string(),
            organizational_unit: "Security".to_string(),
            country: "US".to_string(),
            state: "California".to_string(),
            locality: "San Francisco".to_string(),
            email: "ca@acme.test".to_string(),
        }
    }

    #[test]
    fn accepts_well_formed_emails() {
        for email in [
            "alice@example.com",
            "first.last+tag@mail.example.co",
            "a_b%c-d@sub-domain.example.org",
        ] {
            assert!(validate_email(email).is_ok(), "{}", email);
        }
    }

    #[test]
    fn rejects_malformed_emails() {
        for email in [
            "bad@",
            "no-at-sign.com",
            "a@b",
            "",
            "@example.com",
            "alice@example.c",
            "alice@example.c0m",
            "al ice@example.com",
            "alice@@example.com",
            "alice@.com",
            ".staged-x@example.com",
            ".hidden@example.com",
        ] {
            assert!(
                matches!(validate_email(email), Err(CaError::InvalidEmail(_))),
                "{}",
                email
            );
        }
    }

    #[test]
    fn overlong_email_is_invalid() {
        // 60 + 12 bytes, over the common name bound
        let long = format!("{}@example.com", "a".repeat(60));
        assert!(matches!(validate_email(&long), Err(CaError::InvalidEmail(_))));

        let fits = format!("{}@example.com", "a".repeat(MAX_COMMON_NAME_LEN - 12));
        assert_eq!(fits.len(), MAX_COMMON_NAME_LEN);
        let ca = identity();
        let profile =
            validate_subject(&Subject::for_email(&fits, &ca), &ca, ProfileKind::Leaf).unwrap();
        assert!(profile.subject.to_x509_name().is_ok());
    }

    #[test]
    fn name_text_keeps_embedded_nul() {
        let mut builder = X509Name::builder().unwrap();
        builder.append_entry_by_nid(Nid::COMMONNAME, "evil\0.example.com").unwrap();
        let name = builder.build();
        assert_eq!(
            name_text(&name, Nid::COMMONNAME).unwrap(),
            "evil\0.example.com"
        );
        assert!(name_text(&name, Nid::ORGANIZATIONNAME).is_none());
    }

    #[test]
    fn root_identifier_is_reserved() {
        assert!(matches!(
            derive_identifier("ca@example.com"),
            Err(CaError::UsageError(_))
        ));
        assert_eq!(derive_identifier("cab@example.com").unwrap(), "cab");
    }

    #[test]
    fn identifier_is_local_part() {
        assert_eq!(derive_identifier("alice@example.com").unwrap(), "alice");
        assert_eq!(derive_identifier("j.doe+smime@acme.io").unwrap(), "j.doe+smime");
        assert!(derive_identifier("a@b").is_err());
    }

    #[test]
    fn root_profile_copies_identity() {
        let ca = identity();
        let candidate = Subject::for_email("someone@else.com", &ca);
        let profile = validate_subject(&candidate, &ca, ProfileKind::Root).unwrap();
        assert_eq!(profile.kind, ProfileKind::Root);
        assert_eq!(profile.subject.common_name, "Test Root CA");
        assert_eq!(profile.subject.email, "ca@acme.test");
        assert!(profile.extensions.ca);
        assert!(profile.extensions.key_usage.contains(&KeyUsageFlag::KeyCertSign));
        assert!(profile.extensions.key_usage.contains(&KeyUsageFlag::CrlSign));
        assert!(profile.extensions.subject_alt_email.is_none());
    }

    #[test]
    fn root_profile_rejects_bad_country() {
        let mut ca = identity();
        ca.country = "USA".to_string();
        let err = validate_subject(&Subject::from(&ca), &ca, ProfileKind::Root).unwrap_err();
        assert!(matches!(err, CaError::UsageError(_)));
    }

    #[test]
    fn leaf_profile_matching_subject() {
        let ca = identity();
        let candidate = Subject::for_email("alice@example.com", &ca);
        let profile = validate_subject(&candidate, &ca, ProfileKind::Leaf).unwrap();
        assert!(!profile.extensions.ca);
        assert!(profile.extensions.email_protection);
        assert_eq!(
            profile.extensions.subject_alt_email.as_deref(),
            Some("alice@example.com")
        );
        assert_eq!(
            profile.extensions.key_usage,
            vec![
                KeyUsageFlag::NonRepudiation,
                KeyUsageFlag::DigitalSignature,
                KeyUsageFlag::KeyEncipherment
            ]
        );
    }

    #[test]
    fn leaf_profile_any_mismatch_fails() {
        let ca = identity();
        let mutations: [(&str, fn(&mut Subject)); 4] = [
            ("organization", |s| s.organization = "Other Corp".into()),
            ("organizational unit", |s| s.organizational_unit = "Sales".into()),
            ("country", |s| s.country = "DE".into()),
            ("state", |s| s.state = "Nevada".into()),
        ];
        for (expected_field, mutate) in mutations {
            let mut candidate = Subject::for_email("alice@example.com", &ca);
            mutate(&mut candidate);
            match validate_subject(&candidate, &ca, ProfileKind::Leaf) {
                Err(CaError::PolicyMismatch { field, .. }) => assert_eq!(field, expected_field),
                other => panic!("expected PolicyMismatch on {}, got {:?}", expected_field, other),
            }
        }
    }

    #[test]
    fn leaf_locality_is_not_constrained() {
        let ca = identity();
        let mut candidate = Subject::for_email("alice@example.com", &ca);
        candidate.locality = "Oakland".to_string();
        assert!(validate_subject(&candidate, &ca, ProfileKind::Leaf).is_ok());
    }

    #[test]
    fn leaf_invalid_email_is_reported_before_policy() {
        let ca = identity();
        let mut candidate = Subject::for_email("a@b", &ca);
        candidate.organization = "Other Corp".to_string();
        assert!(matches!(
            validate_subject(&candidate, &ca, ProfileKind::Leaf),
            Err(CaError::InvalidEmail(_))
        ));
    }
}
