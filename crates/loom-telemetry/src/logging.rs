use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub worldline_id: Option<String>,
    pub thread_id: Option<String>,
}

/// Query parameters for searching persisted logs.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub worldline_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ logs.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 worldline_id TEXT,
                 thread_id TEXT,
                 created_at TEXT NOT NULL DEFAULT (datetime('now'))
             );
             CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
             CREATE INDEX IF NOT EXISTS idx_logs_worldline ON logs(worldline_id);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, worldline_id, thread_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.worldline_id,
                record.thread_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, worldline_id, thread_id
             FROM logs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            sql.push_str(&format!(" AND level = ?{}", params.len() + 1));
            params.push(Box::new(level.clone()));
        }
        if let Some(target) = &q.target {
            sql.push_str(&format!(" AND target LIKE ?{}", params.len() + 1));
            params.push(Box::new(format!("%{target}%")));
        }
        if let Some(worldline_id) = &q.worldline_id {
            sql.push_str(&format!(" AND worldline_id = ?{}", params.len() + 1));
            params.push(Box::new(worldline_id.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }

        sql.push_str(" ORDER BY id DESC");

        let limit = q.limit.unwrap_or(100);
        sql.push_str(&format!(" LIMIT {limit}"));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                worldline_id: row.get(6)?,
                thread_id: row.get(7)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    worldline_id: Option<String>,
    thread_id: Option<String>,
}

/// tracing Layer that writes warn+ events to SQLite.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Visitor that extracts fields from a tracing event.
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    worldline_id: Option<String>,
    thread_id: Option<String>,
}

impl FieldVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: serde_json::Map::new(),
            worldline_id: None,
            thread_id: None,
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{:?}", value);
        match field.name() {
            "message" => self.message = Some(val),
            "worldline_id" => self.worldline_id = Some(val.trim_matches('"').to_string()),
            "thread_id" => self.thread_id = Some(val.trim_matches('"').to_string()),
            name => {
                self.fields.insert(name.to_string(), serde_json::Value::String(val));
            }
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "worldline_id" => self.worldline_id = Some(value.to_string()),
            "thread_id" => self.thread_id = Some(value.to_string()),
            name => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(value.to_string()));
            }
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields.insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        // Only persist WARN and above
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        // Inherit worldline_id/thread_id from span context if not on the event
        if visitor.worldline_id.is_none() || visitor.thread_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(fields) = extensions.get::<SpanFields>() {
                        if visitor.worldline_id.is_none() {
                            visitor.worldline_id.clone_from(&fields.worldline_id);
                        }
                        if visitor.thread_id.is_none() {
                            visitor.thread_id.clone_from(&fields.thread_id);
                        }
                    }
                }
            }
        }

        let fields_json = if visitor.fields.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&visitor.fields).unwrap_or_default())
        };

        let record = LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: fields_json,
            worldline_id: visitor.worldline_id,
            thread_id: visitor.thread_id,
        };

        self.sink.insert(&record);
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::new();
        attrs.record(&mut visitor);

        if visitor.worldline_id.is_some() || visitor.thread_id.is_some() {
            if let Some(span) = ctx.span(id) {
                let mut extensions = span.extensions_mut();
                extensions.insert(SpanFields {
                    worldline_id: visitor.worldline_id,
                    thread_id: visitor.thread_id,
                });
            }
        }
    }
}

/// Stored on spans to propagate worldline_id / thread_id to child events.
struct SpanFields {
    worldline_id: Option<String>,
    thread_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("loom-test-logs-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("test-logs.db")
    }

    fn warn(message: &str, worldline_id: Option<&str>) -> LogInsert {
        LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: "WARN".into(),
            target: "test".into(),
            message: message.into(),
            fields: None,
            worldline_id: worldline_id.map(String::from),
            thread_id: None,
        }
    }

    #[test]
    fn sink_create_and_insert() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        sink.insert(&warn("stream interrupted", Some("wl_123")));
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn query_by_level() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        sink.insert(&warn("warning msg", None));
        sink.insert(&LogInsert {
            level: "ERROR".into(),
            message: "error msg".into(),
            ..warn("", None)
        });

        let results = sink
            .query(&LogQuery { level: Some("ERROR".into()), ..Default::default() })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "error msg");
    }

    #[test]
    fn query_by_worldline() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        sink.insert(&warn("on a", Some("wl_aaa")));
        sink.insert(&warn("on b", Some("wl_bbb")));

        let results = sink
            .query(&LogQuery { worldline_id: Some("wl_aaa".into()), ..Default::default() })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "on a");
    }

    #[test]
    fn query_by_target() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        sink.insert(&LogInsert {
            target: "loom_session::orchestrator".into(),
            message: "turn failed".into(),
            ..warn("", None)
        });
        sink.insert(&LogInsert {
            target: "loom_store::cache".into(),
            message: "db error".into(),
            ..warn("", None)
        });

        let results = sink
            .query(&LogQuery { target: Some("orchestrator".into()), ..Default::default() })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "turn failed");
    }

    #[test]
    fn query_limit_returns_most_recent_first() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        for i in 0..10 {
            sink.insert(&warn(&format!("msg {i}"), None));
        }

        let results =
            sink.query(&LogQuery { limit: Some(3), ..Default::default() }).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].message, "msg 9");
    }

    #[test]
    fn query_since() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        sink.insert(&LogInsert {
            timestamp: "2026-08-29T11:00:00Z".into(),
            message: "old".into(),
            ..warn("", None)
        });
        sink.insert(&LogInsert {
            timestamp: "2026-08-29T13:00:00Z".into(),
            message: "new".into(),
            ..warn("", None)
        });

        let results = sink
            .query(&LogQuery { since: Some("2026-08-29T12:00:00Z".into()), ..Default::default() })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "new");
    }

    #[test]
    fn log_record_serde_roundtrip() {
        let record = LogRecord {
            id: 1,
            timestamp: "2026-08-29T12:00:00Z".into(),
            level: "WARN".into(),
            target: "loom_session".into(),
            message: "stream idle".into(),
            fields: Some(r#"{"seq":42}"#.into()),
            worldline_id: Some("wl_123".into()),
            thread_id: Some("thr_456".into()),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: LogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 1);
        assert_eq!(parsed.worldline_id.as_deref(), Some("wl_123"));
    }
}
