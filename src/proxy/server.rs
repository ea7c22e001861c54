//! Proxy listener and request dispatch
//!
//! Each accepted client connection runs in its own task; exchanges within a
//! connection are serialized. Absolute-URI requests take the plain forward
//! path; CONNECT upgrades to the MITM bridge when a root CA is available and
//! degrades to a raw byte splice otherwise (spliced bytes are unobservable
//! and produce no records).

use std::io;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::bus::EventBus;
use crate::ca::CertificateAuthority;
use crate::record::Scheme;
use crate::store::TranscriptStore;

use super::bridge;
use super::exchange::{self, Exchange};
use super::http1::{read_request_head, RequestHead};

/// Shared state for all proxy connections.
pub struct ProxyServer {
    ca: Option<Arc<CertificateAuthority>>,
    store: Arc<TranscriptStore>,
    bus: Arc<EventBus>,
    origin_tls: Arc<rustls::ClientConfig>,
}

impl ProxyServer {
    /// Build the engine. The CA is injected explicitly; `None` disables MITM
    /// and CONNECT falls back to splicing.
    pub fn new(
        ca: Option<Arc<CertificateAuthority>>,
        store: Arc<TranscriptStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_origin_roots(ca, store, bus, roots)
    }

    /// Like `new`, but with an explicit origin trust store, for origins
    /// behind a private CA.
    pub fn with_origin_roots(
        ca: Option<Arc<CertificateAuthority>>,
        store: Arc<TranscriptStore>,
        bus: Arc<EventBus>,
        roots: rustls::RootCertStore,
    ) -> Self {
        let origin_tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            ca,
            store,
            bus,
            origin_tls: Arc::new(origin_tls),
        }
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    tracing::debug!("proxy: new connection from {}", peer_addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            tracing::debug!("proxy connection from {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("proxy accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        loop {
            let head = match read_request_head(&mut reader).await {
                Ok(Some(head)) => head,
                Ok(None) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    exchange::write_bad_request(&mut writer).await.ok();
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            if head.method.eq_ignore_ascii_case("CONNECT") {
                return self.handle_connect(reader, writer, head).await;
            }

            let keep_going = self.forward_plain(&mut reader, &mut writer, head).await?;
            if !keep_going {
                return Ok(());
            }
        }
    }

    /// Plain forward of one absolute-URI exchange. Returns whether the
    /// client connection should serve another request.
    async fn forward_plain(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        head: RequestHead,
    ) -> Result<bool> {
        let url = match url::Url::parse(&head.target) {
            Ok(url) if url.scheme() == "http" && url.host_str().is_some() => url,
            _ => {
                tracing::debug!("proxy: rejecting non-absolute target {:?}", head.target);
                exchange::write_bad_request(writer).await.ok();
                return Ok(false);
            }
        };
        let host = url.host_str().unwrap_or_default().to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let authority = if port == 80 {
            host.clone()
        } else {
            format!("{host}:{port}")
        };
        let mut origin_form = url.path().to_string();
        if let Some(query) = url.query() {
            origin_form.push('?');
            origin_form.push_str(query);
        }

        let exchange = match Exchange::new(
            head,
            origin_form,
            url.to_string(),
            authority,
            Scheme::Http,
            false,
        ) {
            Ok(exchange) => exchange,
            Err(e) => {
                tracing::debug!("proxy: malformed request: {}", e);
                exchange::write_bad_request(writer).await.ok();
                return Ok(false);
            }
        };

        let origin = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => stream,
            Err(e) => {
                // The request body, if any, was never drained, so the client
                // connection cannot be reused after the 502.
                let close = exchange.request_has_body();
                exchange::write_bad_gateway(writer, close).await.ok();
                let record = exchange.failure_record(format!("dial origin: {e}"));
                exchange::commit(&self.store, &self.bus, record).await;
                return Ok(!close);
            }
        };

        let (origin_read, mut origin_write) = origin.into_split();
        let mut origin_reader = BufReader::new(origin_read);

        let result = exchange
            .run(reader, writer, &mut origin_reader, &mut origin_write)
            .await;
        exchange::commit(&self.store, &self.bus, result.record).await;
        Ok(!result.client_closed)
    }

    async fn handle_connect(
        &self,
        reader: BufReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
        head: RequestHead,
    ) -> Result<()> {
        let (host, port) = match parse_authority(&head.target) {
            Some(pair) => pair,
            None => {
                exchange::write_bad_request(&mut writer).await.ok();
                return Ok(());
            }
        };

        writer
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;

        // Re-join the halves; the buffered reader keeps any bytes the client
        // pipelined behind the CONNECT head.
        let io = tokio::io::join(reader, writer);

        match &self.ca {
            Some(ca) => {
                tracing::debug!("proxy: MITM bridge to {}:{}", host, port);
                bridge::run(
                    io,
                    ca.clone(),
                    self.origin_tls.clone(),
                    self.store.clone(),
                    self.bus.clone(),
                    host,
                    port,
                )
                .await
            }
            None => {
                tracing::debug!("proxy: splicing tunnel to {}:{}", host, port);
                splice(io, &host, port).await
            }
        }
    }
}

/// Raw bidirectional tunnel. Nothing on this path is observable.
async fn splice<S>(io: S, host: &str, port: u16) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let origin = TcpStream::connect((host, port)).await?;

    let (mut client_read, mut client_write) = tokio::io::split(io);
    let (mut origin_read, mut origin_write) = origin.into_split();

    let client_to_origin = tokio::io::copy(&mut client_read, &mut origin_write);
    let origin_to_client = tokio::io::copy(&mut origin_read, &mut client_write);

    tokio::select! {
        _ = client_to_origin => {}
        _ = origin_to_client => {}
    }

    Ok(())
}

fn parse_authority(target: &str) -> Option<(String, u16)> {
    match target.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().ok()?;
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port))
        }
        None if !target.is_empty() => Some((target.to_string(), 443)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MAX_BODY_CAPTURE;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn authority_parsing() {
        assert_eq!(
            parse_authority("example.test:443"),
            Some(("example.test".into(), 443))
        );
        assert_eq!(
            parse_authority("example.test"),
            Some(("example.test".into(), 443))
        );
        assert_eq!(parse_authority(":443"), None);
        assert_eq!(parse_authority(""), None);
    }

    struct TestProxy {
        addr: std::net::SocketAddr,
        store: Arc<TranscriptStore>,
        bus: Arc<EventBus>,
    }

    async fn spawn_proxy(ca: Option<Arc<CertificateAuthority>>) -> TestProxy {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let store = Arc::new(TranscriptStore::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let server = Arc::new(ProxyServer::new(ca, store.clone(), bus.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));
        TestProxy { addr, store, bus }
    }

    /// Plain-HTTP origin answering every connection with a canned response
    /// once the request head is in.
    async fn spawn_origin(response: Vec<u8>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let response = response.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let mut consumed = Vec::new();
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) => return,
                            Ok(n) => {
                                consumed.extend_from_slice(&buf[..n]);
                                if consumed.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                    let _ = stream.write_all(&response).await;
                });
            }
        });
        addr
    }

    async fn read_response(stream: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
                Ok(Err(_)) => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn plain_get_round_trips_and_records() {
        let origin = spawn_origin(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello".to_vec(),
        )
        .await;
        let proxy = spawn_proxy(None).await;
        let mut events = proxy.bus.subscribe();

        let mut client = TcpStream::connect(proxy.addr).await.unwrap();
        let request = format!(
            "GET http://{origin}/a HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let response = read_response(&mut client).await;
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.ends_with("hello"), "{text}");

        let record = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.method, "GET");
        assert_eq!(record.scheme, Scheme::Http);
        assert_eq!(record.status, 200);
        assert_eq!(record.resp_body, b"hello");
        assert!(!record.resp_body_trunc);
        assert!(record.error.is_empty());

        // Commit happens before publication: the store already has it.
        let stored = proxy.store.get(&record.id).unwrap();
        assert_eq!(stored.resp_body, b"hello");
    }

    #[tokio::test]
    async fn oversize_body_is_delivered_whole_but_captured_truncated() {
        let body = vec![0x5au8; 600 * 1024];
        let mut response =
            format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        response.extend_from_slice(&body);
        let origin = spawn_origin(response).await;
        let proxy = spawn_proxy(None).await;
        let mut events = proxy.bus.subscribe();

        let mut client = TcpStream::connect(proxy.addr).await.unwrap();
        let request = format!(
            "GET http://{origin}/big HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let response = read_response(&mut client).await;
        let split = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert_eq!(&response[split..], &body[..]);

        let record = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.resp_body.len(), MAX_BODY_CAPTURE);
        assert!(record.resp_body_trunc);
        assert_eq!(&record.resp_body[..], &body[..MAX_BODY_CAPTURE]);
    }

    #[tokio::test]
    async fn unreachable_origin_maps_to_502_with_failure_record() {
        // Bind then drop to obtain a port that refuses connections.
        let refused = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let proxy = spawn_proxy(None).await;
        let mut events = proxy.bus.subscribe();

        let mut client = TcpStream::connect(proxy.addr).await.unwrap();
        let request = format!(
            "GET http://{refused}/ HTTP/1.1\r\nHost: {refused}\r\nConnection: close\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let response = read_response(&mut client).await;
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 502"));

        let record = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, 0);
        assert!(!record.error.is_empty());
    }

    #[tokio::test]
    async fn malformed_request_gets_400_and_no_record() {
        let proxy = spawn_proxy(None).await;
        let mut client = TcpStream::connect(proxy.addr).await.unwrap();
        client.write_all(b"NONSENSE\r\n\r\n").await.unwrap();

        let response = read_response(&mut client).await;
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400"));
        assert_eq!(proxy.store.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn connect_without_ca_splices_and_records_nothing() {
        let origin = spawn_origin(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok".to_vec(),
        )
        .await;
        let proxy = spawn_proxy(None).await;

        let mut client = TcpStream::connect(proxy.addr).await.unwrap();
        client
            .write_all(format!("CONNECT {origin} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();

        let mut established = vec![0u8; 39];
        client.read_exact(&mut established).await.unwrap();
        assert!(String::from_utf8_lossy(&established).starts_with("HTTP/1.1 200"));

        // Speak plain HTTP through the opaque tunnel.
        client
            .write_all(
                format!("GET / HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n").as_bytes(),
            )
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert!(String::from_utf8_lossy(&response).ends_with("ok"));

        assert_eq!(proxy.store.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn mitm_bridge_observes_https_exchange() {
        let _ = rustls::crypto::ring::default_provider().install_default();

        // Origin: a TLS server with a leaf minted by its own private CA.
        let origin_dir = tempfile::tempdir().unwrap();
        let origin_ca = Arc::new(CertificateAuthority::load_or_create(origin_dir.path()).unwrap());
        let mut origin_cfg = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(bridge::LeafResolver::new(
                origin_ca.clone(),
                "127.0.0.1".into(),
            )));
        origin_cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
        let origin_acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(origin_cfg));
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = origin_listener.accept().await.unwrap();
            let mut tls = origin_acceptor.accept(stream).await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut consumed = Vec::new();
            loop {
                let n = tls.read(&mut buf).await.unwrap();
                consumed.extend_from_slice(&buf[..n]);
                if consumed.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            tls.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
            tls.flush().await.unwrap();
            // Hold the session open until the peer hangs up.
            let _ = tls.read(&mut buf).await;
        });

        // Proxy: MITM CA plus trust for the origin's private CA.
        let proxy_dir = tempfile::tempdir().unwrap();
        let proxy_ca = Arc::new(CertificateAuthority::load_or_create(proxy_dir.path()).unwrap());
        let mut origin_roots = rustls::RootCertStore::empty();
        origin_roots.add(origin_ca.ca_cert_der().clone()).unwrap();

        let store = Arc::new(TranscriptStore::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let server = Arc::new(ProxyServer::with_origin_roots(
            Some(proxy_ca.clone()),
            store.clone(),
            bus.clone(),
            origin_roots,
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));
        let mut events = bus.subscribe();

        // Client: CONNECT, then TLS with the proxy's root installed.
        let mut tcp = TcpStream::connect(proxy_addr).await.unwrap();
        tcp.write_all(format!("CONNECT {origin_addr} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut established = vec![0u8; 39];
        tcp.read_exact(&mut established).await.unwrap();
        assert!(String::from_utf8_lossy(&established).starts_with("HTTP/1.1 200"));

        let mut client_roots = rustls::RootCertStore::empty();
        client_roots.add(proxy_ca.ca_cert_der().clone()).unwrap();
        let client_cfg = rustls::ClientConfig::builder()
            .with_root_certificates(client_roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_cfg));
        let server_name = rustls_pki_types::ServerName::try_from("127.0.0.1".to_string()).unwrap();
        let mut tls = connector.connect(server_name, tcp).await.unwrap();

        tls.write_all(b"GET /x HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
            .await
            .unwrap();
        let mut status = vec![0u8; 12];
        tls.read_exact(&mut status).await.unwrap();
        assert_eq!(&status, b"HTTP/1.1 204");

        let record = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.scheme, Scheme::Https);
        assert_eq!(record.status, 204);
        assert!(record.resp_body.is_empty());
        assert!(record.req_body.is_empty());

        // The leaf for the bridged host is now cached.
        let leaf_a = proxy_ca.issue_leaf("127.0.0.1").unwrap();
        let leaf_b = proxy_ca.issue_leaf("127.0.0.1").unwrap();
        assert_eq!(leaf_a.serial, leaf_b.serial);
    }
}
