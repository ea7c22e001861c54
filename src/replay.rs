//! Replay of stored requests
//!
//! Re-issues a captured request against its origin. Hop-by-hop headers and
//! `Host` are stripped so the replayed request matches what the forwarding
//! path would send; the HTTP client supplies its own framing. The caller's
//! deadline bounds the outbound call, and dropping the future (the UI
//! request went away) cancels it.

use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;

use crate::proxy::is_hop_by_hop;
use crate::record::{base64_bytes, HeaderPair, TranscriptRecord};

/// Outcome of a replayed request. `status` is 0 when the origin could not
/// be reached; the elapsed time is reported either way.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    pub status: u16,
    pub duration_ms: u64,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    pub headers: Vec<HeaderPair>,
}

pub struct Replayer {
    client: reqwest::Client,
}

impl Replayer {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build replay client")?;
        Ok(Self { client })
    }

    pub async fn replay(&self, record: &TranscriptRecord) -> Result<ReplayResult> {
        let method = reqwest::Method::from_str(&record.method)
            .with_context(|| format!("invalid method {:?}", record.method))?;

        let mut headers = HeaderMap::new();
        for pair in replayable_headers(&record.req_headers) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_str(&pair.name),
                HeaderValue::from_str(&pair.value),
            ) {
                headers.append(name, value);
            }
        }

        let request = self
            .client
            .request(method, &record.url)
            .headers(headers)
            .body(record.req_body.clone());

        let start = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("replay of {} failed: {}", record.url, e);
                return Ok(ReplayResult {
                    status: 0,
                    duration_ms: start.elapsed().as_millis() as u64,
                    body: Vec::new(),
                    headers: Vec::new(),
                });
            }
        };

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                HeaderPair::new(name.as_str(), String::from_utf8_lossy(value.as_bytes()))
            })
            .collect();
        let duration_ms = start.elapsed().as_millis() as u64;
        let body = response.bytes().await.unwrap_or_default().to_vec();

        Ok(ReplayResult {
            status,
            duration_ms,
            body,
            headers,
        })
    }
}

/// Captured request headers minus hop-by-hop, `Host` and framing headers.
fn replayable_headers(headers: &[HeaderPair]) -> impl Iterator<Item = &HeaderPair> {
    headers.iter().filter(|pair| {
        !is_hop_by_hop(&pair.name)
            && !pair.name.eq_ignore_ascii_case("host")
            && !pair.name.eq_ignore_ascii_case("content-length")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_host_and_framing() {
        let headers = vec![
            HeaderPair::new("Host", "example.test"),
            HeaderPair::new("Connection", "keep-alive"),
            HeaderPair::new("Proxy-Authorization", "Basic xxx"),
            HeaderPair::new("Content-Length", "4"),
            HeaderPair::new("Accept", "*/*"),
            HeaderPair::new("X-Request-Id", "42"),
        ];
        let kept: Vec<&str> = replayable_headers(&headers)
            .map(|pair| pair.name.as_str())
            .collect();
        assert_eq!(kept, vec!["Accept", "X-Request-Id"]);
    }

    #[test]
    fn replay_result_serializes_body_as_base64() {
        let result = ReplayResult {
            status: 200,
            duration_ms: 5,
            body: b"hello".to_vec(),
            headers: vec![HeaderPair::new("Content-Type", "text/plain")],
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], 200);
        assert_eq!(json["body"], "aGVsbG8=");
        assert_eq!(json["durationMs"], 5);
    }
}
