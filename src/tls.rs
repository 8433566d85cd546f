//! Listener TLS material

use crate::config::TlsConfig;
use crate::error::{Error, Result};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// Build the listener's TLS acceptor, or `None` when TLS is disabled.
///
/// Uses the configured cert/key pair when both are given, otherwise a
/// self-signed certificate covering `hostnames` and localhost.
pub fn acceptor(config: &TlsConfig, hostnames: &[String]) -> Result<Option<TlsAcceptor>> {
    if !config.enabled {
        return Ok(None);
    }

    let (certs, key) = match (&config.cert, &config.key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
            (certs, key)
        }
        _ => {
            let pair = self_signed(hostnames)?;
            warn!(
                hostnames = ?hostnames,
                "TLS enabled with auto-generated self-signed certificate"
            );
            pair
        }
    };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut server_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .and_then(|builder| builder.with_no_client_auth().with_single_cert(certs, key))
        .map_err(|e| Error::config(format!("TLS configuration error: {}", e)))?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::config(format!("failed to open certificate file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::config(format!("failed to parse certificates from {}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(Error::config(format!("no certificates found in {}", path)));
    }

    Ok(certs)
}

pub fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::config(format!("failed to open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| Error::config(format!("failed to parse key from {}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(Error::config(format!("no private key found in {}", path)))
}

/// Self-signed certificate for the given hostnames plus localhost
pub fn self_signed(hostnames: &[String]) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    for hostname in hostnames {
        if !subject_alt_names.contains(hostname) {
            subject_alt_names.push(hostname.clone());
        }
    }

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| Error::config(format!("failed to generate self-signed certificate: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    Ok((vec![cert_der], key_der))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_disabled_has_no_acceptor() {
        let config = TlsConfig::default();
        assert!(acceptor(&config, &[]).unwrap().is_none());
    }

    #[test]
    fn test_self_signed_acceptor() {
        let config = TlsConfig {
            enabled: true,
            cert: None,
            key: None,
        };
        let acceptor = acceptor(&config, &["api.local".to_string()]).unwrap();
        assert!(acceptor.is_some());
    }

    #[test]
    fn test_load_from_pem_files() {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["api.local".to_string()]).unwrap();

        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(cert.pem().as_bytes()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file.write_all(key_pair.serialize_pem().as_bytes()).unwrap();

        let cert_path = cert_file.path().to_str().unwrap().to_string();
        let key_path = key_file.path().to_str().unwrap().to_string();

        assert_eq!(load_certs(&cert_path).unwrap().len(), 1);
        assert!(load_key(&key_path).is_ok());

        let config = TlsConfig {
            enabled: true,
            cert: Some(cert_path),
            key: Some(key_path),
        };
        assert!(acceptor(&config, &[]).unwrap().is_some());
    }

    #[test]
    fn test_missing_files_are_config_errors() {
        let err = load_certs("/nonexistent/cert.pem").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let empty = tempfile::NamedTempFile::new().unwrap();
        let err = load_key(empty.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("no private key"));
    }
}
