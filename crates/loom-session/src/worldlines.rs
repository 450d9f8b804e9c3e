use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{instrument, warn};

use loom_core::errors::StreamError;
use loom_core::events::TimelineEvent;
use loom_core::ids::{EventId, ThreadId, WorldlineId};
use loom_core::worldlines::{Worldline, WorldlineHint};
use loom_store::{CacheRepo, PrefsRepo};
use loom_timeline::{dedupe_events, merge_events};

use crate::api::{ApiError, WorkspaceApi};

pub const DEFAULT_WORLDLINE_NAME: &str = "main";
const BRANCH_NAME_PREFIX: &str = "branch-";

struct WorldlineState {
    worldlines: Vec<Worldline>,
    events: HashMap<WorldlineId, Arc<Vec<TimelineEvent>>>,
    active: Option<WorldlineId>,
}

/// Client-side bookkeeping for one thread's worldlines. The server is
/// authoritative; local state is a display copy plus the optimistic tail.
pub struct WorldlineManager {
    api: Arc<dyn WorkspaceApi>,
    thread_id: ThreadId,
    prefs: Option<PrefsRepo>,
    cache: Option<CacheRepo>,
    state: Mutex<WorldlineState>,
}

impl WorldlineManager {
    pub fn new(
        api: Arc<dyn WorkspaceApi>,
        thread_id: ThreadId,
        prefs: Option<PrefsRepo>,
        cache: Option<CacheRepo>,
    ) -> Self {
        Self {
            api,
            thread_id,
            prefs,
            cache,
            state: Mutex::new(WorldlineState {
                worldlines: Vec::new(),
                events: HashMap::new(),
                active: None,
            }),
        }
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    pub fn worldlines(&self) -> Vec<Worldline> {
        self.state.lock().worldlines.clone()
    }

    pub fn active(&self) -> Option<WorldlineId> {
        self.state.lock().active.clone()
    }

    pub fn events(&self, worldline_id: &WorldlineId) -> Arc<Vec<TimelineEvent>> {
        self.state
            .lock()
            .events
            .get(worldline_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(Vec::new()))
    }

    /// Snapshot of every cached event list, for snapshot publication.
    pub fn all_events(&self) -> HashMap<WorldlineId, Arc<Vec<TimelineEvent>>> {
        self.state.lock().events.clone()
    }

    /// Replace a worldline's event list wholesale.
    pub fn store_events(&self, worldline_id: &WorldlineId, events: Arc<Vec<TimelineEvent>>) {
        self.state.lock().events.insert(worldline_id.clone(), events);
    }

    /// Fetch and wholesale-replace the worldline list. Placeholders we know
    /// about that the server has not reported yet are retained.
    #[instrument(skip(self), fields(thread_id = %self.thread_id))]
    pub async fn refresh(&self) -> Result<(), ApiError> {
        let fetched = self.api.list_worldlines(&self.thread_id).await?;

        let replaced = {
            let mut state = self.state.lock();
            let fetched_ids: HashSet<&WorldlineId> = fetched.iter().map(|w| &w.id).collect();
            let retained: Vec<Worldline> = state
                .worldlines
                .iter()
                .filter(|w| !fetched_ids.contains(&w.id))
                .cloned()
                .collect();
            let mut next = fetched;
            next.extend(retained);
            state.worldlines = next;
            state.worldlines.clone()
        };

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put_worldlines(&self.thread_id, &replaced) {
                warn!(error = %e, "failed to cache worldlines");
            }
        }
        Ok(())
    }

    /// Fetch a worldline's events and merge with the local optimistic tail.
    #[instrument(skip(self))]
    pub async fn load(&self, worldline_id: &WorldlineId) -> Result<(), ApiError> {
        let fetched = self.api.fetch_events(worldline_id).await?;

        let merged = {
            let mut state = self.state.lock();
            let local = state.events.get(worldline_id).cloned().unwrap_or_default();
            let merged = Arc::new(dedupe_events(&merge_events(&fetched, &local)));
            state.events.insert(worldline_id.clone(), merged.clone());
            merged
        };

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put_events(worldline_id, &merged) {
                warn!(error = %e, "failed to cache events");
            }
        }
        Ok(())
    }

    /// Make a worldline active. Returns whether the displayed context changed
    /// (the caller signals a refresh when it did).
    #[instrument(skip(self))]
    pub async fn select(&self, worldline_id: &WorldlineId) -> Result<bool, ApiError> {
        let (changed, needs_load) = {
            let mut state = self.state.lock();
            let changed = state.active.as_ref() != Some(worldline_id);
            state.active = Some(worldline_id.clone());
            (changed, !state.events.contains_key(worldline_id))
        };

        if let Some(prefs) = &self.prefs {
            if let Err(e) = prefs.set_active_worldline(&self.thread_id, worldline_id) {
                warn!(error = %e, "failed to persist worldline choice");
            }
        }

        if needs_load {
            self.load(worldline_id).await?;
        }
        Ok(changed)
    }

    /// Fork the active worldline at an event. The new worldline is named
    /// `branch-<n>` by sequence, then selected and loaded. On failure no
    /// local state changes.
    #[instrument(skip(self))]
    pub async fn branch_from_event(&self, event_id: &EventId) -> Result<Worldline, ApiError> {
        let (active, name) = {
            let state = self.state.lock();
            let active = state.active.clone().ok_or_else(|| {
                ApiError::Stream(StreamError::BranchOp("no active worldline".into()))
            })?;
            (active, next_branch_name(&state.worldlines))
        };

        let worldline = self
            .api
            .branch_from_event(&self.thread_id, &active, event_id, &name)
            .await?;

        self.state.lock().worldlines.push(worldline.clone());
        self.select(&worldline.id).await?;
        Ok(worldline)
    }

    /// Guarantee an active worldline, creating the default one on a fresh
    /// thread. Idempotent: an existing default is reused, never duplicated.
    #[instrument(skip(self), fields(thread_id = %self.thread_id))]
    pub async fn ensure(&self) -> Result<WorldlineId, ApiError> {
        if let Some(active) = self.active() {
            return Ok(active);
        }

        self.refresh().await?;

        let existing = {
            let state = self.state.lock();
            state
                .worldlines
                .iter()
                .find(|w| w.name == DEFAULT_WORLDLINE_NAME)
                .or_else(|| state.worldlines.first())
                .map(|w| w.id.clone())
        };

        let id = match existing {
            Some(id) => id,
            None => {
                let created = self
                    .api
                    .create_worldline(&self.thread_id, DEFAULT_WORLDLINE_NAME)
                    .await?;
                let id = created.id.clone();
                self.state.lock().worldlines.push(created);
                id
            }
        };

        self.select(&id).await?;
        Ok(id)
    }

    /// Make sure a worldline referenced by a stream exists locally: unknown
    /// ids get a placeholder, synthetic entries absorb the hint, confirmed
    /// entries are left alone. Returns whether anything changed.
    pub fn ensure_visible(&self, worldline_id: &WorldlineId, hint: Option<&WorldlineHint>) -> bool {
        let mut state = self.state.lock();
        match state.worldlines.iter_mut().find(|w| &w.id == worldline_id) {
            Some(existing) => match hint {
                Some(hint) => existing.apply_hint(hint),
                None => false,
            },
            None => {
                let mut placeholder = Worldline::placeholder(worldline_id.clone());
                if let Some(hint) = hint {
                    placeholder.apply_hint(hint);
                }
                state.worldlines.push(placeholder);
                true
            }
        }
    }

    /// Restore session state: cached lists first for instant display, then a
    /// fetch, then the remembered worldline choice when it still exists.
    #[instrument(skip(self), fields(thread_id = %self.thread_id))]
    pub async fn hydrate(&self) -> Result<(), ApiError> {
        if let Some(cache) = &self.cache {
            if let Ok(cached) = cache.get_worldlines(&self.thread_id) {
                if !cached.is_empty() {
                    let mut state = self.state.lock();
                    if state.worldlines.is_empty() {
                        for worldline in &cached {
                            if let Ok(events) = cache.get_events(&worldline.id) {
                                if !events.is_empty() {
                                    state.events.insert(worldline.id.clone(), Arc::new(events));
                                }
                            }
                        }
                        state.worldlines = cached;
                    }
                }
            }
        }

        self.refresh().await?;

        let remembered = self
            .prefs
            .as_ref()
            .and_then(|p| p.get_active_worldline(&self.thread_id).ok().flatten());

        let target = {
            let state = self.state.lock();
            remembered
                .filter(|id| state.worldlines.iter().any(|w| &w.id == id))
                .or_else(|| {
                    state
                        .worldlines
                        .iter()
                        .find(|w| w.name == DEFAULT_WORLDLINE_NAME)
                        .map(|w| w.id.clone())
                })
        };

        if let Some(id) = target {
            self.select(&id).await?;
        }
        Ok(())
    }
}

/// Next free `branch-<n>` name, by the highest existing sequence number.
fn next_branch_name(worldlines: &[Worldline]) -> String {
    let max = worldlines
        .iter()
        .filter_map(|w| w.name.strip_prefix(BRANCH_NAME_PREFIX))
        .filter_map(|suffix| suffix.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("{BRANCH_NAME_PREFIX}{}", max + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockApi;
    use loom_core::events::TimelineEventType;
    use loom_timeline::OptimisticIds;
    use serde_json::json;

    fn manager(api: Arc<MockApi>) -> WorldlineManager {
        WorldlineManager::new(api, ThreadId::from_raw("thr_1"), None, None)
    }

    fn named(id: &str, name: &str) -> Worldline {
        let mut w = Worldline::placeholder(WorldlineId::from_raw(id));
        w.name = name.to_string();
        w
    }

    #[tokio::test]
    async fn ensure_creates_default_worldline_once() {
        let api = Arc::new(MockApi::new());
        let mgr = manager(api.clone());

        let first = mgr.ensure().await.unwrap();
        let second = mgr.ensure().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(api.created_count(), 1);
        assert_eq!(mgr.worldlines()[0].name, DEFAULT_WORLDLINE_NAME);
    }

    #[tokio::test]
    async fn ensure_reuses_existing_default() {
        let api = Arc::new(MockApi::new());
        api.set_worldlines(vec![named("wl_other", "scratch"), named("wl_main", "main")]);
        let mgr = manager(api.clone());

        let id = mgr.ensure().await.unwrap();
        assert_eq!(id.as_str(), "wl_main");
        assert_eq!(api.created_count(), 0);
    }

    #[tokio::test]
    async fn refresh_retains_unreported_placeholders() {
        let api = Arc::new(MockApi::new());
        api.set_worldlines(vec![named("wl_a", "main")]);
        let mgr = manager(api.clone());

        // A fan-out delta referenced a worldline the server list lacks.
        mgr.ensure_visible(&WorldlineId::from_raw("wl_child"), None);
        mgr.refresh().await.unwrap();

        let names: Vec<String> = mgr.worldlines().iter().map(|w| w.id.to_string()).collect();
        assert!(names.contains(&"wl_a".to_string()));
        assert!(names.contains(&"wl_child".to_string()));
    }

    #[tokio::test]
    async fn load_preserves_optimistic_tail() {
        let api = Arc::new(MockApi::new());
        let wl = WorldlineId::from_raw("wl_1");
        let persisted =
            TimelineEvent::new(TimelineEventType::UserMessage, json!({"text": "persisted"}));
        api.set_events(wl.clone(), vec![persisted.clone()]);

        let mgr = manager(api.clone());
        let ids = OptimisticIds::new();
        let optimistic = ids.create_optimistic("pending");
        let opt_id = optimistic.id.clone();
        mgr.store_events(&wl, Arc::new(vec![optimistic]));

        mgr.load(&wl).await.unwrap();

        let events = mgr.events(&wl);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, persisted.id);
        assert_eq!(events[1].id, opt_id);
    }

    #[tokio::test]
    async fn select_reports_context_change() {
        let api = Arc::new(MockApi::new());
        api.set_worldlines(vec![named("wl_a", "main")]);
        let mgr = manager(api.clone());

        let wl = WorldlineId::from_raw("wl_a");
        assert!(mgr.select(&wl).await.unwrap());
        assert!(!mgr.select(&wl).await.unwrap()); // already active
        assert_eq!(mgr.active(), Some(wl));
    }

    #[tokio::test]
    async fn branch_names_follow_sequence() {
        let api = Arc::new(MockApi::new());
        api.set_worldlines(vec![named("wl_main", "main"), named("wl_b", "branch-3")]);
        let mgr = manager(api.clone());
        mgr.ensure().await.unwrap();

        let branched = mgr.branch_from_event(&EventId::from_raw("evt_1")).await.unwrap();
        assert_eq!(branched.name, "branch-4");
        assert_eq!(mgr.active(), Some(branched.id));
    }

    #[tokio::test]
    async fn failed_branch_leaves_state_unchanged() {
        let api = Arc::new(MockApi::new());
        api.set_worldlines(vec![named("wl_main", "main")]);
        let mgr = manager(api.clone());
        mgr.ensure().await.unwrap();
        let before_active = mgr.active();
        let before_count = mgr.worldlines().len();

        api.fail_next_branch();
        let result = mgr.branch_from_event(&EventId::from_raw("evt_1")).await;

        assert!(result.is_err());
        assert_eq!(mgr.active(), before_active);
        assert_eq!(mgr.worldlines().len(), before_count);
    }

    #[tokio::test]
    async fn ensure_visible_inserts_and_hints() {
        let api = Arc::new(MockApi::new());
        let mgr = manager(api);

        let wl = WorldlineId::from_raw("wl_0123456789abcdef");
        assert!(mgr.ensure_visible(&wl, None));
        assert!(mgr.worldlines()[0].is_synthetic());

        let hint = WorldlineHint {
            name: Some("task: revenue".into()),
            ..Default::default()
        };
        assert!(mgr.ensure_visible(&wl, Some(&hint)));
        assert_eq!(mgr.worldlines()[0].name, "task: revenue");

        // Confirmed name never overwritten by later hints
        let other = WorldlineHint { name: Some("task: other".into()), ..Default::default() };
        assert!(!mgr.ensure_visible(&wl, Some(&other)));
        assert_eq!(mgr.worldlines()[0].name, "task: revenue");
    }

    #[tokio::test]
    async fn hydrate_restores_remembered_choice() {
        let db = loom_store::Database::in_memory().unwrap();
        let prefs = PrefsRepo::new(db.clone());
        let thread = ThreadId::from_raw("thr_1");
        prefs.set_active_worldline(&thread, &WorldlineId::from_raw("wl_b")).unwrap();

        let api = Arc::new(MockApi::new());
        api.set_worldlines(vec![named("wl_a", "main"), named("wl_b", "branch-1")]);
        let mgr = WorldlineManager::new(api, thread, Some(prefs), Some(CacheRepo::new(db)));

        mgr.hydrate().await.unwrap();
        assert_eq!(mgr.active(), Some(WorldlineId::from_raw("wl_b")));
    }

    #[tokio::test]
    async fn hydrate_primes_events_from_cache() {
        let db = loom_store::Database::in_memory().unwrap();
        let cache = CacheRepo::new(db);
        let thread = ThreadId::from_raw("thr_1");
        let main = named("wl_a", "main");

        let cached =
            TimelineEvent::new(TimelineEventType::UserMessage, json!({"text": "from cache"}));
        cache.put_worldlines(&thread, &[main.clone()]).unwrap();
        cache.put_events(&main.id, &[cached.clone()]).unwrap();

        let api = Arc::new(MockApi::new());
        api.set_worldlines(vec![main.clone()]);
        let mgr = WorldlineManager::new(api.clone(), thread, None, Some(cache));

        mgr.hydrate().await.unwrap();

        let events = mgr.events(&main.id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, cached.id);
        // Cached events satisfy selection; no fetch happens until load().
        assert!(!api.calls().iter().any(|c| c.starts_with("fetch_events")));
    }

    #[tokio::test]
    async fn hydrate_falls_back_to_default_when_choice_gone() {
        let db = loom_store::Database::in_memory().unwrap();
        let prefs = PrefsRepo::new(db);
        let thread = ThreadId::from_raw("thr_1");
        prefs.set_active_worldline(&thread, &WorldlineId::from_raw("wl_deleted")).unwrap();

        let api = Arc::new(MockApi::new());
        api.set_worldlines(vec![named("wl_a", "main")]);
        let mgr = WorldlineManager::new(api, thread, Some(prefs), None);

        mgr.hydrate().await.unwrap();
        assert_eq!(mgr.active(), Some(WorldlineId::from_raw("wl_a")));
    }

    #[test]
    fn branch_name_sequence() {
        assert_eq!(next_branch_name(&[]), "branch-1");
        assert_eq!(
            next_branch_name(&[named("a", "branch-1"), named("b", "branch-7"), named("c", "main")]),
            "branch-8"
        );
        // Non-numeric suffixes are ignored
        assert_eq!(next_branch_name(&[named("a", "branch-x")]), "branch-1");
    }
}
