use chrono::Utc;
use rusqlite::params;
use tracing::instrument;

use loom_core::events::TimelineEvent;
use loom_core::ids::{ThreadId, WorldlineId};
use loom_core::worldlines::Worldline;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Cached copies of server state, replaced wholesale per key. Only used as a
/// hydration hint before the first fetch completes.
#[derive(Clone)]
pub struct CacheRepo {
    db: Database,
}

impl CacheRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, worldlines), fields(count = worldlines.len()))]
    pub fn put_worldlines(
        &self,
        thread_id: &ThreadId,
        worldlines: &[Worldline],
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(worldlines)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO worldline_cache (thread_id, worldlines, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(thread_id) DO UPDATE SET
                     worldlines = excluded.worldlines,
                     updated_at = excluded.updated_at",
                params![thread_id.as_str(), json, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    pub fn get_worldlines(&self, thread_id: &ThreadId) -> Result<Vec<Worldline>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT worldlines FROM worldline_cache WHERE thread_id = ?1")?;
            let mut rows = stmt.query(params![thread_id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String =
                        row_helpers::get(row, 0, "worldline_cache", "worldlines")?;
                    row_helpers::parse_json(&raw, "worldline_cache", "worldlines")
                }
                None => Ok(Vec::new()),
            }
        })
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    pub fn put_events(
        &self,
        worldline_id: &WorldlineId,
        events: &[TimelineEvent],
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(events)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO event_cache (worldline_id, events, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(worldline_id) DO UPDATE SET
                     events = excluded.events,
                     updated_at = excluded.updated_at",
                params![worldline_id.as_str(), json, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    pub fn get_events(
        &self,
        worldline_id: &WorldlineId,
    ) -> Result<Vec<TimelineEvent>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT events FROM event_cache WHERE worldline_id = ?1")?;
            let mut rows = stmt.query(params![worldline_id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row_helpers::get(row, 0, "event_cache", "events")?;
                    row_helpers::parse_json(&raw, "event_cache", "events")
                }
                None => Ok(Vec::new()),
            }
        })
    }
}
