//! Durable capture of completed exchanges and WebSocket frames.
//!
//! SQLite-backed, newest-first reads, FIFO retention beyond a configurable
//! cap. All mutation is serialized behind one connection lock; a watch
//! channel publishes a coalesced "new record" signal after every insert.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, ToSql};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub const DEFAULT_MAX_RECORDS: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("traffic database operation failed: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("record serialization failed: {0}")]
    Serialization(String),
    #[error("traffic store lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Ws,
    Wss,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            _ => None,
        }
    }
}

/// Immutable once inserted. `status` and `error` are both optional but a
/// completed exchange always carries at least one of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub id: String,
    pub connection_id: String,
    pub timestamp: f64,
    pub protocol: Protocol,
    pub method: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub status: Option<u16>,
    pub request_headers: Vec<(String, String)>,
    pub request_body: Vec<u8>,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Vec<u8>,
    pub response_content_type: Option<String>,
    pub duration: f64,
    pub error: Option<String>,
}

impl TrafficRecord {
    pub fn url(&self) -> String {
        let default_port = match self.protocol {
            Protocol::Http | Protocol::Ws => 80,
            Protocol::Https | Protocol::Wss => 443,
        };
        if self.port == default_port {
            format!("{}://{}{}", self.protocol.as_str(), self.host, self.path)
        } else {
            format!(
                "{}://{}:{}{}",
                self.protocol.as_str(),
                self.host,
                self.port,
                self.path
            )
        }
    }
}

/// One decoded WebSocket frame, payload already unmasked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsFrameRecord {
    pub id: String,
    pub connection_id: String,
    pub timestamp: f64,
    pub direction: String,
    pub opcode: u8,
    pub fin: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub protocol: Option<Protocol>,
    pub host: Option<String>,
}

pub struct TrafficStore {
    conn: Arc<Mutex<Connection>>,
    max_records: usize,
    change_tx: watch::Sender<u64>,
}

impl TrafficStore {
    pub fn open(path: impl AsRef<Path>, max_records: usize) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?, max_records)
    }

    pub fn in_memory(max_records: usize) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, max_records)
    }

    fn from_connection(connection: Connection, max_records: usize) -> Result<Self, StoreError> {
        let (change_tx, _) = watch::channel(0);
        let store = Self {
            conn: Arc::new(Mutex::new(connection)),
            max_records: max_records.max(1),
            change_tx,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS traffic_records (
                id TEXT PRIMARY KEY,
                timestamp REAL NOT NULL,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                host TEXT NOT NULL,
                path TEXT NOT NULL,
                scheme TEXT NOT NULL,
                port INTEGER NOT NULL,
                status_code INTEGER,
                request_headers TEXT NOT NULL,
                request_body BLOB NOT NULL,
                response_headers TEXT NOT NULL,
                response_body BLOB NOT NULL,
                response_content_type TEXT,
                duration REAL NOT NULL,
                error TEXT,
                connection_id TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_traffic_records_timestamp
                ON traffic_records(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_traffic_records_host
                ON traffic_records(host);

            CREATE TABLE IF NOT EXISTS ws_frames (
                id TEXT PRIMARY KEY,
                connection_id TEXT NOT NULL,
                timestamp REAL NOT NULL,
                direction TEXT NOT NULL,
                opcode INTEGER NOT NULL,
                fin INTEGER NOT NULL,
                payload BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ws_frames_connection
                ON ws_frames(connection_id, timestamp);
            "#,
        )?;
        Ok(())
    }

    /// Insert one record, evict past the retention cap, publish the change
    /// signal. The whole step runs under the connection lock.
    pub fn insert(&self, record: &TrafficRecord) -> Result<(), StoreError> {
        {
            let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            conn.execute(
                "INSERT INTO traffic_records (
                    id, timestamp, method, url, host, path, scheme, port, status_code,
                    request_headers, request_body, response_headers, response_body,
                    response_content_type, duration, error, connection_id
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    record.id,
                    record.timestamp,
                    record.method,
                    record.url(),
                    record.host,
                    record.path,
                    record.protocol.as_str(),
                    record.port,
                    record.status,
                    headers_to_json(&record.request_headers),
                    record.request_body,
                    headers_to_json(&record.response_headers),
                    record.response_body,
                    record.response_content_type,
                    record.duration,
                    record.error,
                    record.connection_id,
                ],
            )?;
            self.evict_beyond_cap(&conn, "traffic_records")?;
        }
        self.change_tx.send_modify(|tick| *tick = tick.wrapping_add(1));
        Ok(())
    }

    pub fn insert_frame(&self, frame: &WsFrameRecord) -> Result<(), StoreError> {
        {
            let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            conn.execute(
                "INSERT INTO ws_frames (id, connection_id, timestamp, direction, opcode, fin, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    frame.id,
                    frame.connection_id,
                    frame.timestamp,
                    frame.direction,
                    frame.opcode,
                    frame.fin,
                    frame.payload,
                ],
            )?;
            self.evict_beyond_cap(&conn, "ws_frames")?;
        }
        self.change_tx.send_modify(|tick| *tick = tick.wrapping_add(1));
        Ok(())
    }

    fn evict_beyond_cap(&self, conn: &Connection, table: &str) -> Result<(), StoreError> {
        conn.execute(
            &format!(
                "DELETE FROM {table} WHERE id NOT IN (
                    SELECT id FROM {table} ORDER BY timestamp DESC LIMIT ?1
                 )"
            ),
            params![self.max_records as i64],
        )?;
        Ok(())
    }

    /// Newest-first listing with optional structured filter and free-text
    /// search over method, host, and path.
    pub fn list(
        &self,
        filter: &RecordFilter,
        search: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TrafficRecord>, StoreError> {
        let mut clauses = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(protocol) = filter.protocol {
            clauses.push(format!("scheme = ?{}", args.len() + 1));
            args.push(Box::new(protocol.as_str().to_string()));
        }
        if let Some(host) = &filter.host {
            clauses.push(format!("host = ?{}", args.len() + 1));
            args.push(Box::new(host.clone()));
        }
        if let Some(needle) = search {
            let pattern = format!("%{needle}%");
            let base = args.len();
            clauses.push(format!(
                "(method LIKE ?{} OR host LIKE ?{} OR path LIKE ?{})",
                base + 1,
                base + 2,
                base + 3
            ));
            args.push(Box::new(pattern.clone()));
            args.push(Box::new(pattern.clone()));
            args.push(Box::new(pattern));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {} ", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT id, timestamp, method, host, path, scheme, port, status_code,
                    request_headers, request_body, response_headers, response_body,
                    response_content_type, duration, error, connection_id
             FROM traffic_records {where_clause}ORDER BY timestamp DESC LIMIT ?{}",
            args.len() + 1
        );
        args.push(Box::new(limit as i64));

        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|arg| arg.as_ref())),
            record_from_row,
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn get(&self, id: &str) -> Result<Option<TrafficRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, method, host, path, scheme, port, status_code,
                    request_headers, request_body, response_headers, response_body,
                    response_content_type, duration, error, connection_id
             FROM traffic_records WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], record_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn frames_for_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<WsFrameRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, connection_id, timestamp, direction, opcode, fin, payload
             FROM ws_frames WHERE connection_id = ?1 ORDER BY timestamp",
        )?;
        let rows = stmt.query_map(params![connection_id], |row| {
            Ok(WsFrameRecord {
                id: row.get(0)?,
                connection_id: row.get(1)?,
                timestamp: row.get(2)?,
                direction: row.get(3)?,
                opcode: row.get(4)?,
                fin: row.get::<_, i64>(5)? != 0,
                payload: row.get(6)?,
            })
        })?;

        let mut frames = Vec::new();
        for row in rows {
            frames.push(row?);
        }
        Ok(frames)
    }

    pub fn record_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM traffic_records", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// Coalesced change signal: the value only says "something new exists".
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.change_tx.subscribe()
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrafficRecord> {
    let scheme: String = row.get(5)?;
    let protocol = Protocol::from_str(&scheme).unwrap_or(Protocol::Http);
    Ok(TrafficRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        method: row.get(2)?,
        host: row.get(3)?,
        path: row.get(4)?,
        protocol,
        port: row.get::<_, i64>(6)?.clamp(0, u16::MAX as i64) as u16,
        status: row.get::<_, Option<i64>>(7)?.map(|code| code as u16),
        request_headers: headers_from_json(&row.get::<_, String>(8)?),
        request_body: row.get(9)?,
        response_headers: headers_from_json(&row.get::<_, String>(10)?),
        response_body: row.get(11)?,
        response_content_type: row.get(12)?,
        duration: row.get(13)?,
        error: row.get(14)?,
        connection_id: row.get(15)?,
    })
}

fn headers_to_json(headers: &[(String, String)]) -> String {
    let mut object = serde_json::Map::new();
    for (name, value) in headers {
        object.insert(name.clone(), serde_json::Value::String(value.clone()));
    }
    serde_json::Value::Object(object).to_string()
}

fn headers_from_json(text: &str) -> Vec<(String, String)> {
    match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(text) {
        Ok(object) => object
            .into_iter()
            .filter_map(|(name, value)| match value {
                serde_json::Value::String(value) => Some((name, value)),
                _ => None,
            })
            .collect(),
        Err(error) => {
            tracing::warn!(%error, "discarding unparsable header JSON");
            Vec::new()
        }
    }
}
