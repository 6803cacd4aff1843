//! PKCS#12 export bundles for mail clients.

use openssl::pkcs12::{ParsedPkcs12_2, Pkcs12};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::{X509Ref, X509};
use secrecy::{ExposeSecret, SecretString};

use crate::error::{CaError, Result};

/// Password-protected archive holding a certificate, its private key and the root.
pub struct Bundle {
    pub der: Vec<u8>,
}

/// Build a PKCS#12 bundle named `friendly_name`.
pub fn export_bundle(
    private_key: &PKey<Private>,
    certificate: &X509Ref,
    root: &X509Ref,
    friendly_name: &str,
    password: &SecretString,
) -> Result<Bundle> {
    let step = "export bundle";
    if password.expose_secret().is_empty() {
        return Err(CaError::UsageError(
            "bundle password must not be empty".to_string(),
        ));
    }
    let mut ca_stack = Stack::<X509>::new().map_err(|e| CaError::signing(step, e))?;
    ca_stack
        .push(root.to_owned())
        .map_err(|e| CaError::signing(step, e))?;

    let pkcs12 = Pkcs12::builder()
        .name(friendly_name)
        .pkey(private_key)
        .cert(certificate)
        .ca(ca_stack)
        .build2(password.expose_secret())
        .map_err(|e| CaError::signing(step, e))?;
    let der = pkcs12.to_der().map_err(|e| CaError::signing(step, e))?;
    Ok(Bundle { der })
}

/// Open a bundle produced by [`export_bundle`].
pub fn load_bundle(der: &[u8], password: &SecretString) -> Result<ParsedPkcs12_2> {
    let pkcs12 = Pkcs12::from_der(der)
        .map_err(|e| CaError::VerificationError(format!("malformed bundle: {}", e)))?;
    pkcs12
        .parse2(password.expose_secret())
        .map_err(|e| CaError::VerificationError(format!("cannot open bundle: {}", e)))
}
