//! TLS configuration and connector for client.

use crate::connection::TlsClientConfig;
use crate::error::ClientError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName, UnixTime,
};
use rustls::{DigitallySignedStruct, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Creates a TLS connector from client configuration.
///
/// Falls back to an unverified connector when `reject_unauthorized` is off.
pub fn create_tls_connector(
    config: &TlsClientConfig,
    server_host: &str,
) -> Result<(TlsConnector, ServerName<'static>), ClientError> {
    if config.passphrase.is_some() {
        return Err(ClientError::TlsConfig(
            "encrypted private keys are not supported; provide an unencrypted key".to_string(),
        ));
    }

    if !config.reject_unauthorized {
        return create_insecure_tls_connector(config, server_host);
    }

    // Build root cert store
    let mut root_store = RootCertStore::empty();
    if let Some(ref ca_path) = config.ca_cert_path {
        for cert in load_certs(ca_path)? {
            root_store
                .add(cert)
                .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert: {}", e)))?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let crls = match config.crl_path {
        Some(ref crl_path) => load_crls(crl_path)?,
        None => Vec::new(),
    };

    let verifier = WebPkiServerVerifier::builder(Arc::new(root_store))
        .with_crls(crls)
        .build()
        .map_err(|e| ClientError::TlsConfig(format!("cannot build verifier: {}", e)))?;

    let builder = if config.check_server_identity {
        rustls::ClientConfig::builder().with_webpki_verifier(verifier)
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoHostnameVerifier { inner: verifier }))
    };

    let mut client_config = if let (Some(cert_path), Some(key_path)) =
        (&config.client_cert_path, &config.client_key_path)
    {
        // mTLS: provide client certificate
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ClientError::TlsConfig(format!("invalid client cert/key: {}", e)))?
    } else {
        builder.with_no_client_auth()
    };
    client_config.alpn_protocols = alpn(config);

    let connector = TlsConnector::from(Arc::new(client_config));
    Ok((connector, server_name(config, server_host)?))
}

/// Creates an insecure TLS connector that skips certificate verification.
/// WARNING: Only use for development/testing.
pub fn create_insecure_tls_connector(
    config: &TlsClientConfig,
    server_host: &str,
) -> Result<(TlsConnector, ServerName<'static>), ClientError> {
    let builder = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier));

    let mut client_config = if let (Some(cert_path), Some(key_path)) =
        (&config.client_cert_path, &config.client_key_path)
    {
        builder
            .with_client_auth_cert(load_certs(cert_path)?, load_private_key(key_path)?)
            .map_err(|e| ClientError::TlsConfig(format!("invalid client cert/key: {}", e)))?
    } else {
        builder.with_no_client_auth()
    };
    client_config.alpn_protocols = alpn(config);

    let connector = TlsConnector::from(Arc::new(client_config));
    Ok((connector, server_name(config, server_host)?))
}

/// SNI server name, defaulting to the connection host.
fn server_name(
    config: &TlsClientConfig,
    server_host: &str,
) -> Result<ServerName<'static>, ClientError> {
    let name = config.server_name.as_deref().unwrap_or(server_host);
    ServerName::try_from(name.to_string())
        .map_err(|_| ClientError::TlsConfig(format!("invalid server name: {}", name)))
}

fn alpn(config: &TlsClientConfig) -> Vec<Vec<u8>> {
    config
        .alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect()
}

/// Full chain verification without the hostname check.
#[derive(Debug)]
struct NoHostnameVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for NoHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(ref e))
                if format!("{:?}", e).starts_with("NotValidForName") =>
            {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

fn open(path: &Path, kind: &str) -> Result<BufReader<File>, ClientError> {
    let file = File::open(path).map_err(|e| {
        ClientError::TlsConfig(format!("cannot open {} file {:?}: {}", kind, path, e))
    })?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let mut reader = open(path, "cert")?;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>, ClientError> {
    let mut reader = open(path, "CRL")?;
    rustls_pemfile::crls(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid CRL file {:?}: {}", path, e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    let mut reader = open(path, "key")?;

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| ClientError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => {
                return Err(ClientError::TlsConfig(format!(
                    "no private key found in {:?}",
                    path
                )))
            }
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_invalid_cert_path() {
        let result = load_certs(Path::new("/nonexistent/cert.pem"));
        assert!(result.unwrap_err().to_string().contains("cannot open cert"));
    }

    #[test]
    fn test_load_invalid_crl_path() {
        let result = load_crls(Path::new("/nonexistent/crl.pem"));
        assert!(result.unwrap_err().to_string().contains("cannot open CRL"));
    }

    #[test]
    fn test_key_file_without_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a pem file").unwrap();
        let result = load_private_key(file.path());
        assert!(result.unwrap_err().to_string().contains("no private key"));
    }

    #[test]
    fn test_passphrase_rejected() {
        let config = TlsClientConfig::new().with_passphrase("secret");
        let result = create_tls_connector(&config, "localhost");
        assert!(matches!(result, Err(ClientError::TlsConfig(_))));
    }

    #[test]
    fn test_server_name_defaults_to_host() {
        let config = TlsClientConfig::new();
        let name = server_name(&config, "db.example.com").unwrap();
        assert_eq!(name.to_str(), "db.example.com");

        let config = TlsClientConfig::new().with_server_name("sni.example.com");
        let name = server_name(&config, "10.0.0.1").unwrap();
        assert_eq!(name.to_str(), "sni.example.com");
    }

    #[test]
    fn test_alpn_protocols() {
        let config = TlsClientConfig::new().with_alpn_protocols(vec!["docwire".to_string()]);
        assert_eq!(alpn(&config), vec![b"docwire".to_vec()]);
    }
}
