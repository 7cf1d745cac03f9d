//! Push-channel credential material.
//!
//! Every push connection provisions itself from scratch: a fresh key
//! pair and certificate request generated locally, exchanged with the
//! cloud for a signed client certificate. Credentials are never assumed
//! durable across disconnects.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

use crate::error::Error;

/// Locally generated key pair + certificate request, ready for the
/// certificate exchange. Consumed by exactly one push connection.
pub struct PushCredential {
    /// PKCS#8 private key, PEM encoded.
    pub private_key_pem: String,
    /// PKCS#10 certificate request, PEM encoded.
    pub csr_pem: String,
}

impl std::fmt::Debug for PushCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("PushCredential").finish_non_exhaustive()
    }
}

/// Generate a fresh key pair and certificate request.
///
/// The subject mirrors what the broker's certificate authority expects
/// for provisioned IoT clients.
pub fn generate_credential() -> Result<PushCredential, Error> {
    let key_pair =
        KeyPair::generate().map_err(|e| Error::CredentialProvisioning(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "AWS IoT Certificate");
    dn.push(DnType::OrganizationName, "Amazon");

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| Error::CredentialProvisioning(e.to_string()))?;
    let csr_pem = csr
        .pem()
        .map_err(|e| Error::CredentialProvisioning(e.to_string()))?;

    Ok(PushCredential {
        private_key_pem: key_pair.serialize_pem(),
        csr_pem,
    })
}

/// Strip the PEM armor from a certificate request for transport.
///
/// The certificate-exchange endpoint wants the bare base64 body, no
/// `BEGIN`/`END` markers and no line breaks.
pub fn csr_body(csr_pem: &str) -> String {
    csr_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect()
}
