//! HAR 1.1 export
//!
//! Serializes stored transcript records into an HTTP Archive document.
//! Bodies are emitted in `text` with `encoding: "base64"`; `content.size`
//! is the captured length, not the origin length.

use serde::Serialize;

use crate::record::TranscriptRecord;

const HAR_VERSION: &str = "1.1";
const CREATOR_NAME: &str = "HTTPeek";

#[derive(Debug, Serialize)]
pub struct Document {
    pub log: Log,
}

#[derive(Debug, Serialize)]
pub struct Log {
    pub version: String,
    pub creator: Creator,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Serialize)]
pub struct Creator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// RFC3339 start instant.
    pub started_date_time: String,
    /// Total elapsed time in milliseconds.
    pub time: u64,
    pub request: Request,
    pub response: Response,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub headers: Vec<Header>,
    pub post_data: PostData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status: u16,
    pub http_version: String,
    pub headers: Vec<Header>,
    pub content: Content,
}

#[derive(Debug, Serialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    pub mime_type: String,
    pub text: String,
    pub encoding: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub size: usize,
    pub mime_type: String,
    pub text: String,
    pub encoding: String,
}

/// Build a HAR document from stored records.
pub fn from_records(records: &[TranscriptRecord]) -> Document {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let entries = records
        .iter()
        .map(|record| Entry {
            started_date_time: record.started_at.to_rfc3339(),
            time: record.duration_ms,
            request: Request {
                method: record.method.clone(),
                url: record.url.clone(),
                http_version: record.http_version.clone(),
                headers: headers(&record.req_headers),
                post_data: PostData {
                    mime_type: String::new(),
                    text: STANDARD.encode(&record.req_body),
                    encoding: "base64".into(),
                },
            },
            response: Response {
                status: record.status,
                http_version: record.http_version.clone(),
                headers: headers(&record.resp_headers),
                content: Content {
                    size: record.resp_body.len(),
                    mime_type: String::new(),
                    text: STANDARD.encode(&record.resp_body),
                    encoding: "base64".into(),
                },
            },
        })
        .collect();

    Document {
        log: Log {
            version: HAR_VERSION.into(),
            creator: Creator {
                name: CREATOR_NAME.into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
            entries,
        },
    }
}

fn headers(pairs: &[crate::record::HeaderPair]) -> Vec<Header> {
    pairs
        .iter()
        .map(|pair| Header {
            name: pair.name.clone(),
            value: pair.value.clone(),
        })
        .collect()
}
