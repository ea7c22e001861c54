//! Durable transcript store
//!
//! SQLite-backed key→record storage. A monotonically increasing `seq` column
//! orders entries so listing returns newest first regardless of identifier
//! shape. The connection is wrapped in a mutex; callers on async paths go
//! through `spawn_blocking`.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::record::{HeaderPair, Scheme, TranscriptRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entries (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    id            TEXT NOT NULL UNIQUE,
    started_at    TEXT NOT NULL,
    duration_ms   INTEGER NOT NULL,
    method        TEXT NOT NULL,
    url           TEXT NOT NULL,
    http_version  TEXT NOT NULL,
    host          TEXT NOT NULL,
    scheme        TEXT NOT NULL,
    req_headers   TEXT NOT NULL,
    req_body      BLOB NOT NULL,
    req_trunc     INTEGER NOT NULL,
    status        INTEGER NOT NULL,
    resp_headers  TEXT NOT NULL,
    resp_body     BLOB NOT NULL,
    resp_trunc    INTEGER NOT NULL,
    error         TEXT NOT NULL
);
";

/// Transcript store over a single SQLite file.
pub struct TranscriptStore {
    conn: Mutex<Connection>,
}

impl TranscriptStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: ":memory:".into(),
            source,
        })?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Commit a record. Assigns the identifier when it is empty; the record
    /// is immutable afterwards. Returns the identifier.
    pub fn put(&self, record: &mut TranscriptRecord) -> Result<String, StoreError> {
        if record.id.is_empty() {
            record.id = uuid::Uuid::new_v4().to_string();
        }
        let req_headers = headers_json(&record.req_headers)?;
        let resp_headers = headers_json(&record.resp_headers)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO entries (id, started_at, duration_ms, method, url, http_version,
                 host, scheme, req_headers, req_body, req_trunc,
                 status, resp_headers, resp_body, resp_trunc, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                record.id,
                record.started_at.to_rfc3339(),
                record.duration_ms as i64,
                record.method,
                record.url,
                record.http_version,
                record.host,
                record.scheme.as_str(),
                req_headers,
                record.req_body,
                record.req_body_trunc,
                record.status,
                resp_headers,
                record.resp_body,
                record.resp_body_trunc,
                record.error,
            ],
        )?;
        Ok(record.id.clone())
    }

    pub fn get(&self, id: &str) -> Result<TranscriptRecord, StoreError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT id, started_at, duration_ms, method, url, http_version,
                        host, scheme, req_headers, req_body, req_trunc,
                        status, resp_headers, resp_body, resp_trunc, error
                 FROM entries WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()?;
        record.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Newest `limit` records, newest first.
    pub fn list(&self, limit: usize) -> Result<Vec<TranscriptRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, started_at, duration_ms, method, url, http_version,
                    host, scheme, req_headers, req_body, req_trunc,
                    status, resp_headers, resp_body, resp_trunc, error
             FROM entries ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_record)?;
        let mut out = Vec::with_capacity(limit.min(256));
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Purge every record.
    pub fn clear(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM entries", [])?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn headers_json(headers: &[HeaderPair]) -> Result<String, StoreError> {
    serde_json::to_string(headers).map_err(|e| {
        StoreError::Query(rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TranscriptRecord> {
    let started_at: String = row.get(1)?;
    let scheme: String = row.get(7)?;
    let req_headers: String = row.get(8)?;
    let resp_headers: String = row.get(12)?;

    let parse_err =
        |e: Box<dyn std::error::Error + Send + Sync>| rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e,
        );

    Ok(TranscriptRecord {
        id: row.get(0)?,
        started_at: chrono::DateTime::parse_from_rfc3339(&started_at)
            .map_err(|e| parse_err(Box::new(e)))?
            .with_timezone(&chrono::Utc),
        duration_ms: row.get::<_, i64>(2)? as u64,
        method: row.get(3)?,
        url: row.get(4)?,
        http_version: row.get(5)?,
        host: row.get(6)?,
        scheme: scheme
            .parse::<Scheme>()
            .map_err(|e| parse_err(e.into()))?,
        req_headers: serde_json::from_str(&req_headers).map_err(|e| parse_err(Box::new(e)))?,
        req_body: row.get(9)?,
        req_body_trunc: row.get(10)?,
        status: row.get::<_, i64>(11)? as u16,
        resp_headers: serde_json::from_str(&resp_headers).map_err(|e| parse_err(Box::new(e)))?,
        resp_body: row.get(13)?,
        resp_body_trunc: row.get(14)?,
        error: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(url: &str) -> TranscriptRecord {
        TranscriptRecord {
            id: String::new(),
            started_at: Utc::now(),
            duration_ms: 42,
            method: "GET".into(),
            url: url.into(),
            http_version: "HTTP/1.1".into(),
            host: "example.test".into(),
            scheme: Scheme::Http,
            req_headers: vec![HeaderPair::new("Accept", "*/*")],
            req_body: b"ping".to_vec(),
            req_body_trunc: false,
            status: 200,
            resp_headers: vec![
                HeaderPair::new("Set-Cookie", "a=1"),
                HeaderPair::new("Set-Cookie", "b=2"),
            ],
            resp_body: b"pong".to_vec(),
            resp_body_trunc: true,
            error: String::new(),
        }
    }

    #[test]
    fn put_assigns_id_and_round_trips() {
        let store = TranscriptStore::open_in_memory().unwrap();
        let mut rec = record("http://example.test/a");
        let id = store.put(&mut rec).unwrap();
        assert!(!id.is_empty());
        assert_eq!(rec.id, id);

        let got = store.get(&id).unwrap();
        // Timestamps survive at second/subsecond precision via RFC3339.
        assert_eq!(got.url, rec.url);
        assert_eq!(got.resp_body, rec.resp_body);
        assert_eq!(got.resp_headers, rec.resp_headers);
        assert!(got.resp_body_trunc);
        assert_eq!(got.scheme, Scheme::Http);
    }

    #[test]
    fn list_returns_newest_first() {
        let store = TranscriptStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.put(&mut record(&format!("http://example.test/{i}"))).unwrap();
        }
        let listed = store.list(3).unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].url, "http://example.test/4");
        assert_eq!(listed[2].url, "http://example.test/2");
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = TranscriptStore::open_in_memory().unwrap();
        let err = store.get("nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn clear_purges_everything() {
        let store = TranscriptStore::open_in_memory().unwrap();
        let mut rec = record("http://example.test/a");
        let id = store.put(&mut rec).unwrap();
        store.clear().unwrap();

        assert_eq!(store.len().unwrap(), 0);
        assert!(store.list(10).unwrap().is_empty());
        assert!(store.get(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("httpeek.db");
        let id = {
            let store = TranscriptStore::open(&path).unwrap();
            store.put(&mut record("http://example.test/persist")).unwrap()
        };
        let store = TranscriptStore::open(&path).unwrap();
        assert_eq!(store.get(&id).unwrap().url, "http://example.test/persist");
    }
}
