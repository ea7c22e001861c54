//! One proxied exchange end to end
//!
//! An `Exchange` relays a single request/response pair between an accepted
//! client stream and an origin stream, teeing both bodies through capture
//! buffers, and always materializes exactly one `TranscriptRecord`,
//! success or failure. Committing writes the record to the store and then
//! publishes it on the event bus; a failed store write is logged and never
//! affects the proxied traffic.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use crate::bus::EventBus;
use crate::capture::BodyCapture;
use crate::record::{HeaderPair, Scheme, TranscriptRecord};
use crate::store::TranscriptStore;

use super::http1::{
    header_value, is_hop_by_hop, read_response_head, relay_body, request_framing, response_framing,
    BodyFraming, RequestHead,
};

const CLIENT_ABORTED: &str = "client aborted";

/// Outcome of one exchange.
pub struct ExchangeResult {
    pub record: TranscriptRecord,
    /// The client connection must not serve further exchanges.
    pub client_closed: bool,
    /// The origin connection may be reused for the next exchange.
    pub origin_reusable: bool,
}

/// A dispatched exchange: classified request plus timing state.
pub struct Exchange {
    started_at: DateTime<Utc>,
    timer: Instant,
    method: String,
    target: String,
    url: String,
    host: String,
    scheme: Scheme,
    version: String,
    req_headers: Vec<HeaderPair>,
    req_framing: BodyFraming,
    origin_keep_alive: bool,
}

impl Exchange {
    /// Classify a parsed request head. Fails on malformed framing headers,
    /// which the caller maps to a `400` without emitting a record.
    pub fn new(
        head: RequestHead,
        target: String,
        url: String,
        host: String,
        scheme: Scheme,
        origin_keep_alive: bool,
    ) -> io::Result<Self> {
        let req_framing = request_framing(&head.headers)?;
        Ok(Self {
            started_at: Utc::now(),
            timer: Instant::now(),
            method: head.method,
            target,
            url,
            host,
            scheme,
            version: head.version,
            req_headers: head.headers,
            req_framing,
            origin_keep_alive,
        })
    }

    /// Whether the client declared a request body that must be drained
    /// before this connection can serve another exchange.
    pub fn request_has_body(&self) -> bool {
        self.req_framing != BodyFraming::None
    }

    /// Record for an exchange that failed before or during the origin leg.
    pub fn failure_record(&self, error: impl Into<String>) -> TranscriptRecord {
        self.record(
            Vec::new(),
            false,
            0,
            Vec::new(),
            Vec::new(),
            false,
            error.into(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        req_body: Vec<u8>,
        req_trunc: bool,
        status: u16,
        resp_headers: Vec<HeaderPair>,
        resp_body: Vec<u8>,
        resp_trunc: bool,
        error: String,
    ) -> TranscriptRecord {
        TranscriptRecord {
            id: String::new(),
            started_at: self.started_at,
            duration_ms: self.timer.elapsed().as_millis() as u64,
            method: self.method.clone(),
            url: self.url.clone(),
            http_version: self.version.clone(),
            host: self.host.clone(),
            scheme: self.scheme,
            req_headers: self.req_headers.clone(),
            req_body,
            req_body_trunc: req_trunc,
            status,
            resp_headers,
            resp_body,
            resp_body_trunc: resp_trunc,
            error,
        }
    }

    /// Relay the exchange. The request head has already been consumed from
    /// `client_reader`; the request body (if any) has not.
    pub async fn run<CR, CW, OR, OW>(
        self,
        client_reader: &mut CR,
        client_writer: &mut CW,
        origin_reader: &mut OR,
        origin_writer: &mut OW,
    ) -> ExchangeResult
    where
        CR: AsyncBufRead + Unpin,
        CW: AsyncWrite + Unpin,
        OR: AsyncBufRead + Unpin,
        OW: AsyncWrite + Unpin,
    {
        let client_wants_close = wants_close(&self.req_headers, &self.version);

        // Outbound request head: hop-by-hop stripped, framing re-emitted by
        // this hop, connection policy ours.
        let request_drained = self.req_framing == BodyFraming::None;
        let head_bytes = self.outbound_head();
        if let Err(e) = origin_writer.write_all(head_bytes.as_bytes()).await {
            return self
                .bad_gateway(
                    client_writer,
                    format!("send request: {e}"),
                    client_wants_close || !request_drained,
                )
                .await;
        }

        let (req_body, req_trunc) = match relay_body(
            client_reader,
            origin_writer,
            self.req_framing,
            BodyCapture::new(),
        )
        .await
        {
            Ok(parts) => parts,
            // Reader-side failures mean the client went away mid-request.
            Err(e) if reader_side(&e) => {
                return ExchangeResult {
                    record: self.failure_record(CLIENT_ABORTED),
                    client_closed: true,
                    origin_reusable: false,
                };
            }
            // Writer-side failure: the origin went away while the client
            // body was only partially drained, so this client connection
            // cannot be reused either.
            Err(e) => {
                return self
                    .bad_gateway(client_writer, format!("send body: {e}"), true)
                    .await;
            }
        };

        let resp_head = match read_response_head(origin_reader).await {
            Ok(head) => head,
            Err(e) => {
                return self
                    .bad_gateway(client_writer, format!("read response: {e}"), client_wants_close)
                    .await;
            }
        };
        // Duration is measured to the moment response headers are in.
        let duration_ms = self.timer.elapsed().as_millis() as u64;

        let resp_framing = match response_framing(&self.method, resp_head.status, &resp_head.headers)
        {
            Ok(framing) => framing,
            Err(e) => {
                return self
                    .bad_gateway(client_writer, format!("response framing: {e}"), client_wants_close)
                    .await;
            }
        };

        let close_client = client_wants_close || resp_framing == BodyFraming::Close;
        let client_head = downstream_head(&resp_head, resp_framing, close_client);
        if let Err(_e) = client_writer.write_all(client_head.as_bytes()).await {
            return ExchangeResult {
                record: self.failure_record(CLIENT_ABORTED),
                client_closed: true,
                origin_reusable: false,
            };
        }

        let relayed = relay_body(
            origin_reader,
            client_writer,
            resp_framing,
            BodyCapture::new(),
        )
        .await;

        let origin_says_close = resp_framing == BodyFraming::Close
            || header_value(&resp_head.headers, "Connection")
                .map(|v| v.to_ascii_lowercase().contains("close"))
                .unwrap_or(resp_head.version == "HTTP/1.0");

        match relayed {
            Ok((resp_body, resp_trunc)) => {
                let mut record = self.record(
                    req_body,
                    req_trunc,
                    resp_head.status,
                    resp_head.headers,
                    resp_body,
                    resp_trunc,
                    String::new(),
                );
                record.duration_ms = duration_ms;
                ExchangeResult {
                    record,
                    client_closed: close_client,
                    origin_reusable: self.origin_keep_alive && !origin_says_close,
                }
            }
            Err(e) => {
                // Response already started; nothing can be sent to the
                // client beyond closing the connection.
                let cause = if reader_side(&e) {
                    format!("read body: {e}")
                } else {
                    CLIENT_ABORTED.to_string()
                };
                ExchangeResult {
                    record: self.record(
                        req_body,
                        req_trunc,
                        0,
                        resp_head.headers,
                        Vec::new(),
                        false,
                        cause,
                    ),
                    client_closed: true,
                    origin_reusable: false,
                }
            }
        }
    }

    fn outbound_head(&self) -> String {
        let mut head = format!("{} {} HTTP/1.1\r\n", self.method, self.target);
        let mut saw_host = false;
        for pair in &self.req_headers {
            if is_hop_by_hop(&pair.name) || pair.name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            if pair.name.eq_ignore_ascii_case("host") {
                saw_host = true;
            }
            head.push_str(&pair.name);
            head.push_str(": ");
            head.push_str(&pair.value);
            head.push_str("\r\n");
        }
        if !saw_host {
            head.push_str("Host: ");
            head.push_str(&self.host);
            head.push_str("\r\n");
        }
        match self.req_framing {
            BodyFraming::Length(n) => head.push_str(&format!("Content-Length: {n}\r\n")),
            BodyFraming::Chunked => head.push_str("Transfer-Encoding: chunked\r\n"),
            _ => {}
        }
        head.push_str(if self.origin_keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        head.push_str("\r\n");
        head
    }

    /// Reply `502`, keep the client connection when it asked to stay open,
    /// and produce the failure record.
    async fn bad_gateway<W: AsyncWrite + Unpin>(
        self,
        client_writer: &mut W,
        cause: String,
        close_client: bool,
    ) -> ExchangeResult {
        let delivered = write_bad_gateway(client_writer, close_client).await.is_ok();
        ExchangeResult {
            record: self.failure_record(cause),
            client_closed: close_client || !delivered,
            origin_reusable: false,
        }
    }
}

/// Plain-text `502` for origin-leg failures. Internal details never reach
/// the client beyond the mapped status.
pub async fn write_bad_gateway<W: AsyncWrite + Unpin>(
    writer: &mut W,
    close: bool,
) -> io::Result<()> {
    let body = "Bad Gateway";
    let head = format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n{}",
        body.len(),
        if close { "close" } else { "keep-alive" },
        body,
    );
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

/// Plain-text `400` for malformed client requests. No record is emitted.
pub async fn write_bad_request<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    let body = "Bad Request";
    let head = format!(
        "HTTP/1.1 400 Bad Request\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body,
    );
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

/// Commit a record: store write first, then event-bus publication.
pub async fn commit(store: &Arc<TranscriptStore>, bus: &Arc<EventBus>, record: TranscriptRecord) {
    let store = store.clone();
    let committed = tokio::task::spawn_blocking(move || {
        let mut record = record;
        if let Err(e) = store.put(&mut record) {
            tracing::warn!("store put failed: {}", e);
        }
        record
    })
    .await;

    match committed {
        Ok(record) => bus.publish(Arc::new(record)),
        Err(e) => tracing::warn!("store task failed: {}", e),
    }
}

fn reader_side(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData
    )
}

fn wants_close(headers: &[HeaderPair], version: &str) -> bool {
    let connection =
        header_value(headers, "Proxy-Connection").or_else(|| header_value(headers, "Connection"));
    match connection.map(|v| v.to_ascii_lowercase()) {
        Some(v) if v.contains("close") => true,
        Some(v) if v.contains("keep-alive") => false,
        _ => version == "HTTP/1.0",
    }
}

/// Response head forwarded to the client: origin status line and headers,
/// hop-by-hop and framing headers replaced by this hop's own.
fn downstream_head(
    head: &super::http1::ResponseHead,
    framing: BodyFraming,
    close: bool,
) -> String {
    let mut out = if head.reason.is_empty() {
        format!("{} {}\r\n", head.version, head.status)
    } else {
        format!("{} {} {}\r\n", head.version, head.status, head.reason)
    };
    for pair in &head.headers {
        if is_hop_by_hop(&pair.name) || pair.name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        out.push_str(&pair.name);
        out.push_str(": ");
        out.push_str(&pair.value);
        out.push_str("\r\n");
    }
    match framing {
        BodyFraming::Length(n) => out.push_str(&format!("Content-Length: {n}\r\n")),
        BodyFraming::Chunked => out.push_str("Transfer-Encoding: chunked\r\n"),
        BodyFraming::None if !status_forbids_body(head.status) => {
            out.push_str("Content-Length: 0\r\n")
        }
        _ => {}
    }
    out.push_str(if close {
        "Connection: close\r\n"
    } else {
        "Connection: keep-alive\r\n"
    });
    out.push_str("\r\n");
    out
}

fn status_forbids_body(status: u16) -> bool {
    status / 100 == 1 || status == 204 || status == 304
}
