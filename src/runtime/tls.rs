use std::sync::Arc;

use rustls::{
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        WebPkiServerVerifier,
    },
    pki_types::{CertificateDer, ServerName, UnixTime},
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::{
    error::{ErrorKind, Result},
    options::TlsOptions,
};

/// Cached configuration needed to create TLS sessions. Building this is
/// expensive, so one instance is shared by all connections of a pool.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: TlsConnector,
    sni_host: Option<String>,
}

impl TlsConfig {
    /// Create a new `TlsConfig` from the provided options.
    pub(crate) fn new(options: TlsOptions) -> Result<TlsConfig> {
        let sni_host = options.sni_host.clone();
        let tls_config = make_rustls_config(options)?;

        let connector: TlsConnector = Arc::new(tls_config).into();
        Ok(TlsConfig {
            connector,
            sni_host,
        })
    }

    pub(crate) fn sni_host(&self) -> Option<&str> {
        self.sni_host.as_deref()
    }

    /// Run the TLS handshake over the given TCP stream. Invoked exactly once
    /// per stream, during `AsyncStream::connect`.
    pub(crate) async fn begin_handshake(
        &self,
        host: &str,
        tcp_stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let name = ServerName::try_from(host.to_string()).map_err(|e| {
            ErrorKind::InvalidTlsConfig {
                message: format!("disallowed SNI name {:?}: {}", host, e),
            }
        })?;

        let session = self.connector.connect(name, tcp_stream).await?;
        Ok(session)
    }
}

fn root_store(options: &TlsOptions) -> Result<RootCertStore> {
    let mut store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    if let Some(ref certificates) = options.extra_root_certificates {
        for der in certificates {
            store
                .add(CertificateDer::from(der.clone()))
                .map_err(|e| ErrorKind::InvalidTlsConfig {
                    message: format!("invalid additional root certificate: {}", e),
                })?;
        }
    }
    Ok(store)
}

/// Converts `TlsOptions` into a `rustls::ClientConfig`.
fn make_rustls_config(options: TlsOptions) -> Result<ClientConfig> {
    let store = root_store(&options)?;

    let mut config = ClientConfig::builder()
        .with_root_certificates(store.clone())
        .with_no_client_auth();

    if options.allow_invalid_hostnames == Some(true) {
        let inner = WebPkiServerVerifier::builder(Arc::new(store))
            .build()
            .map_err(|e| ErrorKind::InvalidTlsConfig {
                message: format!("could not build certificate verifier: {}", e),
            })?;
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoHostnameVerifier { inner }));
    }

    Ok(config)
}

/// A certificate verifier that performs full chain validation but tolerates a
/// certificate that is not valid for the connected hostname.
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
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
