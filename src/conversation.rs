//! Conversation state: the append-only turn log and its usage counters.

use crate::id::new_id;
use crate::message::Turn;
use crate::provider::ProviderId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cumulative token usage reported by backends. Best-effort: when a backend
/// stays silent the controller folds in estimated values instead.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The aggregate one controller owns: an insertion-ordered turn log plus
/// bookkeeping. Mutated only through `append`, `clear`, `restore`, and the
/// compactor's commit; existing turns are never edited or reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Active backend for this conversation
    pub provider: ProviderId,
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub usage: UsageTotals,
}

impl Conversation {
    pub fn new(provider: ProviderId) -> Self {
        let now = Utc::now();
        Self {
            id: new_id("conv"),
            display_name: None,
            created_at: now,
            updated_at: now,
            provider,
            turns: Vec::new(),
            usage: UsageTotals::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Add a turn to the ordered log. Pure data append; context accounting
    /// is recomputed by the monitor, not here.
    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.updated_at = Utc::now();
    }

    pub fn add_usage(&mut self, input_tokens: u64, output_tokens: u64) {
        self.usage.input_tokens += input_tokens;
        self.usage.output_tokens += output_tokens;
    }

    /// Read-only copy for persistence.
    pub fn snapshot(&self) -> Conversation {
        self.clone()
    }

    /// Replace the log wholesale (used when loading a saved conversation).
    pub fn restore(&mut self, state: Conversation) {
        *self = state;
    }

    /// Empty the log and reset usage counters.
    pub fn clear(&mut self) {
        self.turns.clear();
        self.usage = UsageTotals::default();
        self.updated_at = Utc::now();
    }
}
