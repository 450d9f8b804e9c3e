use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EventId, WorldlineId};

/// How many characters of the raw id a synthetic placeholder name keeps.
const SYNTHETIC_NAME_LEN: usize = 12;

/// A named, forkable timeline of events within a thread.
///
/// A worldline may be referenced (by a fan-out delta) before its authoritative
/// record is fetched; in that case a synthetic placeholder stands in until
/// either a refresh replaces it or hints enrich it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Worldline {
    pub id: WorldlineId,
    pub parent_worldline_id: Option<WorldlineId>,
    pub forked_from_event_id: Option<EventId>,
    pub head_event_id: Option<EventId>,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Derived naming fields discovered from fan-out progress before the
/// authoritative worldline record has been fetched.
#[derive(Clone, Debug, Default)]
pub struct WorldlineHint {
    pub name: Option<String>,
    pub parent_worldline_id: Option<WorldlineId>,
    pub created_at: Option<DateTime<Utc>>,
}

pub fn synthetic_name(id: &WorldlineId) -> String {
    let raw = id.as_str();
    raw.chars().take(SYNTHETIC_NAME_LEN).collect()
}

impl Worldline {
    /// A synthetic entry for a worldline known only by id.
    pub fn placeholder(id: WorldlineId) -> Self {
        let name = synthetic_name(&id);
        Self {
            id,
            parent_worldline_id: None,
            forked_from_event_id: None,
            head_event_id: None,
            name,
            created_at: None,
        }
    }

    /// A worldline is synthetic while its name is still the truncated-id
    /// default (or the raw id itself). Once a human- or server-assigned name
    /// is present, hints no longer overwrite it.
    pub fn is_synthetic(&self) -> bool {
        self.name == synthetic_name(&self.id) || self.name == self.id.as_str()
    }

    /// Apply a hint to a placeholder. Each field applies only while still at
    /// its synthetic default; returns whether anything changed.
    pub fn apply_hint(&mut self, hint: &WorldlineHint) -> bool {
        let mut changed = false;

        if self.is_synthetic() {
            if let Some(name) = hint.name.as_deref() {
                if !name.is_empty() && name != self.name {
                    self.name = name.to_string();
                    changed = true;
                }
            }
        }
        if self.parent_worldline_id.is_none() {
            if let Some(parent) = &hint.parent_worldline_id {
                self.parent_worldline_id = Some(parent.clone());
                changed = true;
            }
        }
        if self.created_at.is_none() {
            if let Some(at) = hint.created_at {
                self.created_at = Some(at);
                changed = true;
            }
        }

        changed
    }
}
