//! Certificate authority for the intercepting proxy.
//!
//! Generates a local Root CA and a single leaf certificate covering the
//! configured intercept hostnames, persists both as PEM, and builds the
//! rustls server configuration the HTTPS listener presents. Certificates are
//! generated once and reloaded on every subsequent start; rotation requires
//! deleting the files and restarting.

mod authority;

#[cfg(test)]
mod tests_authority_persistence;

pub use authority::{CertAuthority, CertAuthorityConfig};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid certificate material: {0}")]
    InvalidMaterial(String),
    #[error("invalid certificate authority configuration: {0}")]
    InvalidConfiguration(String),
}

/// Coarse classification of upstream TLS failures, used to log
/// certificate-flavored errors distinctly from plain transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsFailureClass {
    UnknownCa,
    CertValidation,
    Handshake,
    Timeout,
    Other,
}

impl TlsFailureClass {
    pub fn code(self) -> &'static str {
        match self {
            Self::UnknownCa => "unknown_ca",
            Self::CertValidation => "cert_validation",
            Self::Handshake => "handshake",
            Self::Timeout => "timeout",
            Self::Other => "other",
        }
    }

    /// Whether this class should be surfaced as a TLS/certificate problem.
    pub fn is_tls_related(self) -> bool {
        !matches!(self, Self::Timeout | Self::Other)
    }
}

pub fn classify_tls_error(error_text: &str) -> TlsFailureClass {
    let lower = error_text.to_ascii_lowercase();

    if contains_any(
        &lower,
        &[
            "unknown ca",
            "unknown issuer",
            "unknownissuer",
            "self signed",
            "self-signed",
            "unknown authority",
        ],
    ) {
        return TlsFailureClass::UnknownCa;
    }
    if contains_any(&lower, &["timed out", "timeout", "deadline has elapsed"]) {
        return TlsFailureClass::Timeout;
    }
    if contains_any(
        &lower,
        &[
            "invalid peer certificate",
            "certificate",
            "cert",
            "x509",
            "hostname mismatch",
            "name mismatch",
            "expired",
        ],
    ) {
        return TlsFailureClass::CertValidation;
    }
    if contains_any(&lower, &["handshake", "alert", "protocol version", "tls"]) {
        return TlsFailureClass::Handshake;
    }

    TlsFailureClass::Other
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

#[cfg(test)]
mod classify_tests {
    use super::{classify_tls_error, TlsFailureClass};

    #[test]
    fn cert_flavored_errors_are_tls_related() {
        let class = classify_tls_error("invalid peer certificate: UnknownIssuer");
        assert_eq!(class, TlsFailureClass::UnknownCa);
        assert!(class.is_tls_related());

        let class = classify_tls_error("x509: certificate has expired or is not yet valid");
        assert!(class.is_tls_related());
    }

    #[test]
    fn transport_errors_are_not_tls_related() {
        assert_eq!(
            classify_tls_error("connection refused"),
            TlsFailureClass::Other
        );
        assert_eq!(
            classify_tls_error("operation timed out"),
            TlsFailureClass::Timeout
        );
    }
}
