//! Trust configuration for outbound TLS clients.
//!
//! The identity provider is reached over HTTPS, often behind a deployment-local CA. This
//! module loads that CA bundle from PEM and applies it to a `reqwest` client builder.

use pki_types::CertificateDer;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::TokenError;

/// Reads every certificate in the PEM bundle at `path`.
pub fn read_pem_certificates<P: AsRef<Path>>(
    path: P,
) -> Result<Vec<CertificateDer<'static>>, TokenError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        TokenError::Setup(format!("failed to open CA bundle {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            TokenError::Setup(format!("failed to parse CA bundle {}: {e}", path.display()))
        })?;

    if certs.is_empty() {
        return Err(TokenError::Setup(format!(
            "CA bundle {} contains no certificates",
            path.display()
        )));
    }
    Ok(certs)
}

/// Applies the trust settings to a client builder.
///
/// With `skip_verification` the server certificate is not checked at all and the bundle
/// is ignored.
pub fn configure_trust(
    mut builder: reqwest::ClientBuilder,
    ca_bundle: Option<&Path>,
    skip_verification: bool,
) -> Result<reqwest::ClientBuilder, TokenError> {
    if skip_verification {
        tracing::warn!("TLS verification of the token endpoint is disabled");
        return Ok(builder.danger_accept_invalid_certs(true));
    }

    if let Some(path) = ca_bundle {
        for cert in read_pem_certificates(path)? {
            builder = builder.add_root_certificate(reqwest::Certificate::from_der(cert.as_ref())?);
        }
        tracing::debug!(ca_bundle = %path.display(), "loaded CA bundle");
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Base64 payloads are not validated as X.509 when reading PEM sections.
    const BUNDLE: &str = "-----BEGIN CERTIFICATE-----\nAAECAwQF\n-----END CERTIFICATE-----\n\
                          -----BEGIN CERTIFICATE-----\nBgcICQoL\n-----END CERTIFICATE-----\n";

    #[test]
    fn test_reads_every_certificate_in_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, BUNDLE).unwrap();

        let certs = read_pem_certificates(&path).unwrap();
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0].as_ref(), &[0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_bundle_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, "not a pem file\n").unwrap();

        assert!(matches!(
            read_pem_certificates(&path),
            Err(TokenError::Setup(_))
        ));
    }

    #[test]
    fn test_missing_bundle_is_rejected() {
        assert!(matches!(
            read_pem_certificates("/nonexistent/ca.pem"),
            Err(TokenError::Setup(_))
        ));
    }

    #[test]
    fn test_skip_verification_ignores_bundle() {
        let builder = configure_trust(
            reqwest::Client::builder(),
            Some(Path::new("/nonexistent/ca.pem")),
            true,
        );
        assert!(builder.is_ok());
    }
}
