use chrono::Utc;
use rusqlite::params;
use tracing::instrument;

use loom_core::ids::{ThreadId, WorldlineId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Per-thread UI preferences. Currently a single key: the worldline the user
/// last had active, read back on hydration.
#[derive(Clone)]
pub struct PrefsRepo {
    db: Database,
}

impl PrefsRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn set_active_worldline(
        &self,
        thread_id: &ThreadId,
        worldline_id: &WorldlineId,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO prefs (thread_id, active_worldline_id, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(thread_id) DO UPDATE SET
                     active_worldline_id = excluded.active_worldline_id,
                     updated_at = excluded.updated_at",
                params![thread_id.as_str(), worldline_id.as_str(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    pub fn get_active_worldline(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<WorldlineId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT active_worldline_id FROM prefs WHERE thread_id = ?1")?;
            let mut rows = stmt.query(params![thread_id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String =
                        row_helpers::get(row, 0, "prefs", "active_worldline_id")?;
                    Ok(Some(WorldlineId::from_raw(raw)))
                }
                None => Ok(None),
            }
        })
    }
}
