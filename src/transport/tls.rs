use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::plug::plug_config::TlsOptions;

/// The client side of TLS: a connector plus the name it presents to the server
#[derive(Clone)]
pub struct TlsClient {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

pub fn acceptor(options: &TlsOptions) -> anyhow::Result<TlsAcceptor> {
    let cert_chain = options.cert_chain.as_ref()
        .ok_or_else(|| anyhow!("a TLS server needs a certificate chain"))?;
    let private_key = options.private_key.as_ref()
        .ok_or_else(|| anyhow!("a TLS server needs a private key"))?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(load_certs(cert_chain)?, load_key(private_key)?)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// A connector for a client connecting to `target`. Without CA certificates, the server's
///  certificate is accepted without verification.
pub fn client(options: &TlsOptions, target: SocketAddr) -> anyhow::Result<TlsClient> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = match &options.ca_certs {
        Some(ca_certs) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_certs)? {
                roots.add(cert)?;
            }
            builder
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        None => {
            debug!("server certificates are not verified");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
                .with_no_client_auth()
        }
    };

    let server_name = match &options.server_name {
        Some(name) => ServerName::try_from(name.clone())
            .map_err(|e| anyhow!("invalid TLS server name {:?}: {}", name, e))?,
        None => ServerName::from(target.ip()),
    };

    Ok(TlsClient {
        connector: TlsConnector::from(Arc::new(config)),
        server_name,
    })
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| anyhow!("cannot read {:?}: {}", path, e))?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("invalid certificate in {:?}: {:?}", path, e))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificate in {:?}", path));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| anyhow!("cannot read {:?}: {}", path, e))?;
    PrivateKeyDer::from_pem_slice(&pem)
        .map_err(|e| anyhow!("invalid private key in {:?}: {:?}", path, e))
}

/// Checks the handshake signatures but trusts whatever certificate the server presents
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::path::PathBuf;

    use super::*;
    use crate::test_util::test_addr;

    pub(crate) fn test_cert_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("testdata").join("tls")
    }

    /// a self-signed certificate for `localhost` and 127.0.0.1
    pub(crate) fn server_options() -> TlsOptions {
        TlsOptions {
            cert_chain: Some(test_cert_dir().join("localhost.crt")),
            private_key: Some(test_cert_dir().join("localhost.key")),
            ..TlsOptions::default()
        }
    }

    /// a client that trusts the self-signed test certificate
    pub(crate) fn verifying_client_options() -> TlsOptions {
        TlsOptions {
            ca_certs: Some(test_cert_dir().join("localhost.crt")),
            server_name: Some("localhost".to_string()),
            ..TlsOptions::default()
        }
    }

    #[test]
    fn test_acceptor_from_pem_files() {
        assert!(acceptor(&server_options()).is_ok());
    }

    #[test]
    fn test_acceptor_needs_cert_and_key() {
        assert!(acceptor(&TlsOptions::default()).is_err());
        assert!(acceptor(&TlsOptions { private_key: None, ..server_options() }).is_err());
        assert!(acceptor(&TlsOptions { cert_chain: Some(test_cert_dir().join("missing.crt")), ..server_options() }).is_err());
    }

    #[test]
    fn test_client_server_name() {
        let unverified = client(&TlsOptions::default(), test_addr(443)).unwrap();
        assert_eq!(unverified.server_name, ServerName::from(test_addr(443).ip()));

        let verifying = client(&verifying_client_options(), test_addr(443)).unwrap();
        assert_eq!(verifying.server_name, ServerName::try_from("localhost").unwrap());

        assert!(client(&TlsOptions { server_name: Some("not a name!".to_string()), ..TlsOptions::default() }, test_addr(443)).is_err());
    }
}
