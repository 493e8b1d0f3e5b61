use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use crate::{CertAuthority, CertAuthorityConfig, TlsSetupError};

fn config_in(dir: &Path) -> CertAuthorityConfig {
    CertAuthorityConfig {
        ca_cert_path: dir.join("certs/ca.crt"),
        ca_key_path: dir.join("certs/ca.key"),
        leaf_cert_path: dir.join("certs/server.crt"),
        leaf_key_path: dir.join("certs/server.key"),
        intercept_hosts: vec![
            "api.videoservice.example.".to_string(),
            "*.videoservice.example".to_string(),
        ],
        server_ips: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))],
        ca_common_name: "adtrim Root CA".to_string(),
        ca_organization: "adtrim".to_string(),
    }
}

#[test]
fn first_run_generates_all_four_pem_files() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = config_in(dir.path());

    let authority = CertAuthority::load_or_generate(&config).expect("load or generate");

    assert!(config.ca_cert_path.exists());
    assert!(config.ca_key_path.exists());
    assert!(config.leaf_cert_path.exists());
    assert!(config.leaf_key_path.exists());
    assert!(authority
        .ca_certificate_pem()
        .starts_with("-----BEGIN CERTIFICATE-----"));
}

#[test]
fn restart_reuses_existing_ca_instead_of_regenerating() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = config_in(dir.path());

    let first = CertAuthority::load_or_generate(&config).expect("first start");
    let first_ca = first.ca_certificate_pem().to_string();
    drop(first);

    let second = CertAuthority::load_or_generate(&config).expect("second start");
    assert_eq!(second.ca_certificate_pem(), first_ca);
}

#[test]
fn missing_leaf_is_regenerated_under_the_existing_ca() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = config_in(dir.path());

    let first = CertAuthority::load_or_generate(&config).expect("first start");
    let ca_pem = first.ca_certificate_pem().to_string();
    drop(first);

    std::fs::remove_file(&config.leaf_cert_path).expect("remove leaf cert");
    std::fs::remove_file(&config.leaf_key_path).expect("remove leaf key");

    let second = CertAuthority::load_or_generate(&config).expect("restart");
    assert_eq!(second.ca_certificate_pem(), ca_pem);
    assert!(config.leaf_cert_path.exists());
    assert!(config.leaf_key_path.exists());
}

#[test]
fn listener_config_advertises_http1_only() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = config_in(dir.path());

    let authority = CertAuthority::load_or_generate(&config).expect("load or generate");
    let server_config = authority.server_config();
    assert_eq!(server_config.alpn_protocols, vec![b"http/1.1".to_vec()]);
}

#[test]
fn empty_intercept_set_is_rejected() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut config = config_in(dir.path());
    config.intercept_hosts = vec![" . ".to_string()];

    match CertAuthority::load_or_generate(&config) {
        Err(TlsSetupError::InvalidConfiguration(detail)) => {
            assert!(detail.contains("intercept hostname"));
        }
        other => panic!("expected configuration error, got {other:?}"),
    }
}

#[test]
fn corrupt_ca_material_fails_startup() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = config_in(dir.path());

    std::fs::create_dir_all(config.ca_cert_path.parent().unwrap()).expect("mkdir");
    std::fs::write(&config.ca_cert_path, "not a certificate").expect("write junk");
    std::fs::write(&config.ca_key_path, "not a key").expect("write junk");

    assert!(CertAuthority::load_or_generate(&config).is_err());
}
