//! RSA key pairs and PKCS#10 certificate signing requests.

use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Req, X509ReqRef};

use crate::error::{CaError, Result};
use crate::policy::Subject;

pub const ROOT_KEY_BITS: u32 = 4096;
pub const MIN_LEAF_KEY_BITS: u32 = 2048;

/// Generate an RSA private key of `bits` size.
pub fn generate_rsa(bits: u32) -> Result<PKey<Private>> {
    if bits < MIN_LEAF_KEY_BITS {
        return Err(CaError::UsageError(format!(
            "RSA keys must be at least {} bits, got {}",
            MIN_LEAF_KEY_BITS, bits
        )));
    }
    let step = "generate key pair";
    let rsa = Rsa::generate(bits).map_err(|e| CaError::signing(step, e))?;
    PKey::from_rsa(rsa).map_err(|e| CaError::signing(step, e))
}

/// Build a CSR for `subject`, signed by `key`.
pub fn generate_csr(key: &PKey<Private>, subject: &Subject) -> Result<X509Req> {
    let step = "generate certificate request";
    let mut builder = X509Req::builder().map_err(|e| CaError::signing(step, e))?;
    builder.set_version(0).map_err(|e| CaError::signing(step, e))?;
    let name = subject.to_x509_name()?;
    builder
        .set_subject_name(&name)
        .map_err(|e| CaError::signing(step, e))?;
    builder.set_pubkey(key).map_err(|e| CaError::signing(step, e))?;
    builder
        .sign(key, MessageDigest::sha256())
        .map_err(|e| CaError::signing(step, e))?;
    Ok(builder.build())
}

/// Check that the request is signed by the key it carries.
pub fn verify_csr(csr: &X509ReqRef) -> Result<()> {
    let step = "verify certificate request";
    let public_key = csr.public_key().map_err(|e| CaError::signing(step, e))?;
    match csr.verify(&public_key) {
        Ok(true) => Ok(()),
        Ok(false) => Err(CaError::signing(step, "request signature does not match its key")),
        Err(e) => Err(CaError::signing(step, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{name_text, CaIdentity};
    use openssl::nid::Nid;

    fn subject() -> Subject {
        let identity = CaIdentity {
            common_name: "Root".to_string(),
            organization: "ACME Corp".to_string(),
            organizational_unit: "Security".to_string(),
            country: "US".to_string(),
            state: "California".to_string(),
            locality: "San Francisco".to_string(),
            email: "ca@acme.test".to_string(),
        };
        Subject::for_email("alice@example.com", &identity)
    }

    #[test]
    fn rejects_short_keys() {
        assert!(matches!(generate_rsa(1024), Err(CaError::UsageError(_))));
    }

    #[test]
    fn csr_carries_subject_and_verifies() {
        let key = generate_rsa(MIN_LEAF_KEY_BITS).unwrap();
        let csr = generate_csr(&key, &subject()).unwrap();
        verify_csr(&csr).unwrap();

        let cn = name_text(csr.subject_name(), Nid::COMMONNAME).unwrap();
        assert_eq!(cn, "alice@example.com");
        assert!(csr.public_key().unwrap().public_eq(&key));
    }

    #[test]
    fn csr_signed_by_other_key_fails() {
        let key = generate_rsa(MIN_LEAF_KEY_BITS).unwrap();
        let other = generate_rsa(MIN_LEAF_KEY_BITS).unwrap();
        let mut builder = X509Req::builder().unwrap();
        builder.set_subject_name(&subject().to_x509_name().unwrap()).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.sign(&other, MessageDigest::sha256()).unwrap();
        let csr = builder.build();
        assert!(matches!(
            verify_csr(&csr),
            Err(CaError::SigningFailure { .. })
        ));
    }
}
