//! Transport establishment: TCP, optional HTTP CONNECT proxy tunnel, TLS.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader as AsyncBufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::{ProxyConfig, Result, SessionConfig, StompError, TlsTrust};

/// Byte stream a session can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens a fresh transport to the broker for each connect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream>;
}

/// TCP + TLS connector used in production.
pub struct TcpTlsConnector {
    host: String,
    port: u16,
    proxy: Option<ProxyConfig>,
    tls: TlsConnector,
}

impl TcpTlsConnector {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let tls = TlsConnector::from(Arc::new(client_config(&config.tls)?));
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            proxy: config.proxy.clone(),
            tls,
        })
    }
}

#[async_trait]
impl Connector for TcpTlsConnector {
    async fn connect(&self) -> Result<BoxedStream> {
        let tcp = match &self.proxy {
            Some(proxy) => tunnel(proxy, &self.host, self.port).await?,
            None => TcpStream::connect((self.host.as_str(), self.port)).await?,
        };
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| StompError::Tls(format!("invalid server name {}: {e}", self.host)))?;
        let stream = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| StompError::Tls(e.to_string()))?;
        debug!(host = %self.host, port = self.port, "TLS established");
        Ok(Box::new(stream))
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn client_config(trust: &TlsTrust) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| StompError::Tls(e.to_string()))?;

    let config = match trust {
        TlsTrust::NoVerification => {
            warn!("Unverified STOMP TLS certificate (cafile=false)");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider())))
                .with_no_client_auth()
        }
        TlsTrust::WebPki => {
            let roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TlsTrust::CaFile(path) => {
            let mut reader = BufReader::new(File::open(path)?);
            let mut roots = RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut reader) {
                roots
                    .add(cert?)
                    .map_err(|e| StompError::Tls(format!("{}: {e}", path.display())))?;
            }
            if roots.is_empty() {
                return Err(StompError::Tls(format!(
                    "no certificates found in {}",
                    path.display()
                )));
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };
    Ok(config)
}

/// Open a TCP tunnel through an HTTP proxy.
async fn tunnel(proxy: &ProxyConfig, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;

    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(user) = &proxy.user {
        let password = proxy.password.as_deref().unwrap_or_default();
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut reader = AsyncBufReader::new(&mut stream);
    let mut status = String::new();
    reader.read_line(&mut status).await?;
    if !is_tunnel_established(&status) {
        return Err(StompError::Proxy(format!(
            "proxy {}:{} refused tunnel: {}",
            proxy.host,
            proxy.port,
            status.trim()
        )));
    }
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    debug!(proxy = %proxy.host, %host, port, "Proxy tunnel established");
    Ok(stream)
}

fn is_tunnel_established(status_line: &str) -> bool {
    let mut parts = status_line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some(version), Some("200")) if version.starts_with("HTTP/")
    )
}

#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
