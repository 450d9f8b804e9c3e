use serde::{Deserialize, Serialize};

/// Maximum retained transitions per worldline.
pub const MAX_TRACE: usize = 24;

/// An opaque server-reported label change (e.g. "planning" -> "analyzing").
/// Informational only; never gates correctness of the event log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStateTransition {
    pub from_state: String,
    pub to_state: String,
    #[serde(default)]
    pub reason: String,
}

/// A capped ordered trace of state transitions for one worldline.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransitionTrace {
    entries: Vec<RuntimeStateTransition>,
}

impl TransitionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append, evicting the oldest entry past the cap.
    pub fn push(&mut self, transition: RuntimeStateTransition) {
        self.entries.push(transition);
        if self.entries.len() > MAX_TRACE {
            let excess = self.entries.len() - MAX_TRACE;
            self.entries.drain(..excess);
        }
    }

    /// A persisted trace embedded in an assistant message is authoritative
    /// and replaces whatever was built from live deltas.
    pub fn replace_with(&mut self, persisted: Vec<RuntimeStateTransition>) {
        self.entries = persisted;
        if self.entries.len() > MAX_TRACE {
            let excess = self.entries.len() - MAX_TRACE;
            self.entries.drain(..excess);
        }
    }

    pub fn entries(&self) -> &[RuntimeStateTransition] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&RuntimeStateTransition> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
