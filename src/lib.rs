//! smime-ca - Local S/MIME Certificate Authority Library
//!
//! Keeps the on-disk state of a small certificate authority, issues its self-signed root,
//! issues S/MIME certificates signed by that root, and verifies them.
//!
//! # Overview
//!
//! ```text
//! Root CA (self-signed, pathlen=0)
//!   └── S/MIME certificate (signed by Root, CA=false, emailProtection)
//! ```
//!
//! Every issued certificate gets a serial number from a counter guarded by a store-wide
//! lock and is recorded in an append-only ledger. Leaf subjects must carry the
//! organization, organizational unit, country and state of the root.
//!
//! # Store Layout
//!
//! ```text
//! ca/
//!   private/      ca.key.pem, alice.key.pem          (0700 dir, 0400 keys)
//!   certs/        ca.cert.pem, alice.cert.pem        (0444)
//!   newcerts/     1000.pem, 1001.pem                 (by serial)
//!   csr/          alice.csr.pem
//!   bundles/      alice.p12                          (0700 dir, 0400 bundles)
//!   index.jsonl   ledger
//!   serial        next serial (hex)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use smime_ca::issuance::Issuer;
//! use smime_ca::policy::{CaIdentity, Subject};
//! use smime_ca::store::CaStore;
//! use smime_ca::verifier::{CertificateRef, Verifier};
//! use secrecy::SecretString;
//! use std::time::Duration;
//!
//! fn setup(identity: CaIdentity) -> smime_ca::Result<()> {
//!     let store = CaStore::init("ca", Duration::from_secs(30))?;
//!     let issuer = Issuer::new(&store);
//!     issuer.issue_root(&identity, 3650)?;
//!
//!     let candidate = Subject::for_email("alice@example.com", &identity);
//!     let password = SecretString::from("change me".to_string());
//!     let (issued, _bundle) = issuer.issue_leaf(&candidate, 365, &password)?;
//!
//!     let report = Verifier::new(&store).verify(
//!         &CertificateRef::Identifier(issued.identifier),
//!         chrono::Utc::now(),
//!     )?;
//!     assert!(report.valid);
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! All library operations return [`Result<T>`] carrying a [`CaError`]. Subject validation
//! errors are raised before the store is modified; `SerialCollision` and `LockTimeout` are
//! retried by the issuance pipeline before they reach the caller.

pub mod configs;
pub mod error;
pub mod generate_root_ca;
pub mod generate_user_cert;
pub mod issuance;
pub mod key_material;
pub mod ledger;
pub mod logging;
pub mod pfx_key;
pub mod policy;
pub mod serial;
pub mod store;
pub mod verifier;

pub use error::{CaError, Result};
