use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

use crate::TlsSetupError;

const CA_SERIAL: u8 = 1;
const LEAF_SERIAL: u8 = 2;
const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 1825;
const BACKDATE: Duration = Duration::hours(1);

#[derive(Debug, Clone)]
pub struct CertAuthorityConfig {
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    pub leaf_cert_path: PathBuf,
    pub leaf_key_path: PathBuf,
    /// Hostnames the leaf must cover; the first entry becomes its CN.
    pub intercept_hosts: Vec<String>,
    /// Server addresses added as IP SANs so direct-IP clients validate.
    pub server_ips: Vec<IpAddr>,
    pub ca_common_name: String,
    pub ca_organization: String,
}

impl CertAuthorityConfig {
    fn validate(&self) -> Result<(), TlsSetupError> {
        if self.leaf_dns_names().is_empty() {
            return Err(TlsSetupError::InvalidConfiguration(
                "at least one intercept hostname is required for the leaf certificate".to_string(),
            ));
        }
        if self.ca_common_name.trim().is_empty() {
            return Err(TlsSetupError::InvalidConfiguration(
                "ca_common_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Intercept hosts as certificate DNS names (no trailing dot).
    fn leaf_dns_names(&self) -> Vec<String> {
        self.intercept_hosts
            .iter()
            .map(|host| host.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|host| !host.is_empty())
            .collect()
    }
}

/// Root CA plus the single leaf the HTTPS listener presents.
///
/// State is immutable after construction; the listener holds the
/// `Arc<ServerConfig>` handle, not ownership of the material.
#[derive(Debug)]
pub struct CertAuthority {
    ca_cert_pem: String,
    server_config: Arc<ServerConfig>,
}

impl CertAuthority {
    /// Load certificates from disk, generating any that are missing.
    ///
    /// Every filesystem or cryptographic failure here is fatal: the proxy
    /// must not start serving with partial TLS material.
    pub fn load_or_generate(config: &CertAuthorityConfig) -> Result<Self, TlsSetupError> {
        config.validate()?;

        for path in [
            &config.ca_cert_path,
            &config.ca_key_path,
            &config.leaf_cert_path,
            &config.leaf_key_path,
        ] {
            ensure_parent_exists(path)?;
        }

        if !config.ca_cert_path.exists() {
            tracing::info!(path = %config.ca_cert_path.display(), "root CA not found, generating");
            generate_root_ca(config)?;
        }
        let (issuer, ca_cert_pem, ca_cert_der) = load_root_ca(config)?;

        if !config.leaf_cert_path.exists() {
            tracing::info!(
                path = %config.leaf_cert_path.display(),
                "leaf certificate not found, generating"
            );
            generate_leaf(config, &issuer)?;
        }

        let server_config = build_server_config(config, ca_cert_der)?;

        Ok(Self {
            ca_cert_pem,
            server_config,
        })
    }

    /// TLS configuration for the HTTPS listener (TLS >= 1.2, ALPN http/1.1).
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// PEM of the Root CA certificate, for the device-install endpoint.
    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca_cert_pem
    }
}

fn generate_root_ca(config: &CertAuthorityConfig) -> Result<(), TlsSetupError> {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.serial_number = Some(SerialNumber::from(vec![CA_SERIAL]));
    params.not_before = OffsetDateTime::now_utc() - BACKDATE;
    params.not_after = OffsetDateTime::now_utc() + Duration::days(CA_VALIDITY_DAYS);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, config.ca_common_name.clone());
    distinguished_name.push(DnType::OrganizationName, config.ca_organization.clone());
    params.distinguished_name = distinguished_name;

    let cert = params.self_signed(&key)?;
    fs::write(&config.ca_cert_path, cert.pem())?;
    fs::write(&config.ca_key_path, key.serialize_pem())?;
    Ok(())
}

fn load_root_ca(
    config: &CertAuthorityConfig,
) -> Result<(Issuer<'static, KeyPair>, String, CertificateDer<'static>), TlsSetupError> {
    let cert_pem = fs::read_to_string(&config.ca_cert_path)?;
    let key_pem = fs::read_to_string(&config.ca_key_path)?;

    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        TlsSetupError::InvalidMaterial(format!(
            "failed to parse CA certificate PEM from {}: {error}",
            config.ca_cert_path.display()
        ))
    })?;
    let key = KeyPair::from_pem(&key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, key)?;

    Ok((issuer, cert_pem, cert_der))
}

fn generate_leaf(
    config: &CertAuthorityConfig,
    issuer: &Issuer<'static, KeyPair>,
) -> Result<(), TlsSetupError> {
    let dns_names = config.leaf_dns_names();
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

    let mut params = CertificateParams::new(dns_names.clone())?;
    params.is_ca = IsCa::NoCa;
    params.serial_number = Some(SerialNumber::from(vec![LEAF_SERIAL]));
    params.not_before = OffsetDateTime::now_utc() - BACKDATE;
    params.not_after = OffsetDateTime::now_utc() + Duration::days(LEAF_VALIDITY_DAYS);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, dns_names[0].clone());
    params.distinguished_name = distinguished_name;

    for ip in &config.server_ips {
        params.subject_alt_names.push(SanType::IpAddress(*ip));
    }

    let cert = params.signed_by(&key, issuer)?;
    fs::write(&config.leaf_cert_path, cert.pem())?;
    fs::write(&config.leaf_key_path, key.serialize_pem())?;
    Ok(())
}

fn build_server_config(
    config: &CertAuthorityConfig,
    ca_cert_der: CertificateDer<'static>,
) -> Result<Arc<ServerConfig>, TlsSetupError> {
    let mut chain = CertificateDer::pem_file_iter(&config.leaf_cert_path)
        .map_err(|error| {
            TlsSetupError::InvalidMaterial(format!(
                "failed to read leaf certificate from {}: {error}",
                config.leaf_cert_path.display()
            ))
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| {
            TlsSetupError::InvalidMaterial(format!(
                "failed to parse leaf certificate from {}: {error}",
                config.leaf_cert_path.display()
            ))
        })?;
    chain.push(ca_cert_der);

    let key = PrivateKeyDer::from_pem_file(&config.leaf_key_path).map_err(|error| {
        TlsSetupError::InvalidMaterial(format!(
            "failed to parse leaf key from {}: {error}",
            config.leaf_key_path.display()
        ))
    })?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(server_config))
}

fn ensure_parent_exists(path: &Path) -> Result<(), TlsSetupError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
