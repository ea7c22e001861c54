//! CONNECT/MITM bridge
//!
//! Terminates the client's TLS with a leaf minted for the ClientHello SNI
//! (falling back to the CONNECT authority), then relays HTTP/1.x requests
//! from the decrypted stream to an independent TLS session with the origin,
//! reusing the origin connection until it signals close.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::bus::EventBus;
use crate::ca::CertificateAuthority;
use crate::record::Scheme;
use crate::store::TranscriptStore;

use super::exchange::{self, Exchange};
use super::http1::{header_value, read_request_head};

/// Mints per-host leaves inside the TLS handshake. SNI, when the client
/// sends one, supersedes the CONNECT authority for leaf selection.
pub struct LeafResolver {
    ca: Arc<CertificateAuthority>,
    fallback: String,
}

impl LeafResolver {
    pub fn new(ca: Arc<CertificateAuthority>, fallback: String) -> Self {
        Self { ca, fallback }
    }
}

impl fmt::Debug for LeafResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafResolver")
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl ResolvesServerCert for LeafResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let host = client_hello
            .server_name()
            .unwrap_or(self.fallback.as_str())
            .to_string();
        match self.ca.issue_leaf(&host) {
            Ok(leaf) => Some(leaf.certified.clone()),
            Err(e) => {
                tracing::warn!("leaf issuance for {} failed: {}", host, e);
                None
            }
        }
    }
}

type OriginHalves = (
    BufReader<ReadHalf<TlsStream<TcpStream>>>,
    WriteHalf<TlsStream<TcpStream>>,
);

/// Run the bridge over an accepted CONNECT stream until either peer closes.
pub async fn run<S>(
    io: S,
    ca: Arc<CertificateAuthority>,
    origin_tls: Arc<rustls::ClientConfig>,
    store: Arc<TranscriptStore>,
    bus: Arc<EventBus>,
    authority_host: String,
    port: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(LeafResolver::new(
            ca.clone(),
            authority_host.clone(),
        )));
    // HTTP/2 is not bridged; pin the decrypted leg to HTTP/1.1.
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let tls_stream = acceptor
        .accept(io)
        .await
        .context("client TLS handshake failed")?;

    let sni_host = tls_stream
        .get_ref()
        .1
        .server_name()
        .map(str::to_string)
        .unwrap_or_else(|| authority_host.clone());

    let (read_half, write_half) = tokio::io::split(tls_stream);
    let mut client_reader = BufReader::new(read_half);
    let mut client_writer = write_half;

    let mut origin: Option<OriginHalves> = None;

    loop {
        let head = match read_request_head(&mut client_reader).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                exchange::write_bad_request(&mut client_writer).await.ok();
                return Ok(());
            }
            Err(_) => return Ok(()),
        };

        // The Host header names the virtual host; SNI covers hosts that
        // omit it.
        let host = header_value(&head.headers, "Host")
            .unwrap_or(sni_host.as_str())
            .to_string();
        let url = if port == 443 {
            format!("https://{}{}", host, head.target)
        } else {
            format!("https://{}:{}{}", host, port, head.target)
        };
        let target = head.target.clone();

        let exchange = match Exchange::new(head, target, url, host, Scheme::Https, true) {
            Ok(exchange) => exchange,
            Err(e) => {
                tracing::debug!("bridge: malformed request: {}", e);
                exchange::write_bad_request(&mut client_writer).await.ok();
                return Ok(());
            }
        };

        if origin.is_none() {
            match connect_origin(&authority_host, port, &origin_tls).await {
                Ok(stream) => {
                    let (read_half, write_half) = tokio::io::split(stream);
                    origin = Some((BufReader::new(read_half), write_half));
                }
                Err(e) => {
                    let close = exchange.request_has_body();
                    exchange::write_bad_gateway(&mut client_writer, close)
                        .await
                        .ok();
                    let record = exchange.failure_record(format!("dial origin: {e:#}"));
                    exchange::commit(&store, &bus, record).await;
                    if close {
                        return Ok(());
                    }
                    continue;
                }
            }
        }

        let (origin_reader, origin_writer) = origin.as_mut().expect("origin connected");
        let result = exchange
            .run(
                &mut client_reader,
                &mut client_writer,
                origin_reader,
                origin_writer,
            )
            .await;
        exchange::commit(&store, &bus, result.record).await;

        if !result.origin_reusable {
            origin = None;
        }
        if result.client_closed {
            return Ok(());
        }
    }
}

/// TLS session to the origin, verified against the engine's origin roots.
async fn connect_origin(
    host: &str,
    port: u16,
    origin_tls: &Arc<rustls::ClientConfig>,
) -> Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connect {host}:{port}"))?;

    let connector = TlsConnector::from(origin_tls.clone());
    let server_name = rustls_pki_types::ServerName::try_from(host.to_string())
        .with_context(|| format!("invalid origin name {host:?}"))?;

    let tls = connector
        .connect(server_name, tcp)
        .await
        .with_context(|| format!("TLS handshake with {host}:{port}"))?;
    Ok(tls)
}
