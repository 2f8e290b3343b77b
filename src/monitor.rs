//! Context budget monitoring.
//!
//! Usage is derived, never stored: callers recompute after every turn
//! append, after every provider switch (the ceiling changes), and after
//! every compaction.

use crate::config;
use crate::conversation::Conversation;
use crate::estimator;

/// Suggest compaction at this fraction of the context window
pub const COMPACTION_THRESHOLD: f32 = 0.75;

/// Consumed context against the active provider's ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    pub used_tokens: usize,
    pub max_tokens: usize,
    pub percentage: f32,
}

impl ContextUsage {
    pub fn display(&self) -> String {
        format!(
            "{} / {} tokens ({:.0}%)",
            self.used_tokens,
            self.max_tokens,
            self.percentage * 100.0
        )
    }
}

/// Sum the estimate over the system prompt (if any) plus every turn, divided
/// by the active provider's ceiling.
pub fn recompute(conversation: &Conversation, system_prompt: Option<&str>) -> ContextUsage {
    let mut used = system_prompt.map(estimator::estimate).unwrap_or(0);
    for turn in &conversation.turns {
        used += estimator::estimate_turn(turn);
    }
    let max = estimator::ceiling_for(conversation.provider);
    ContextUsage {
        used_tokens: used,
        max_tokens: max,
        percentage: used as f32 / max as f32,
    }
}

/// Inclusive threshold: a log sitting exactly on the boundary already needs
/// compaction. Compared in f64 so the boundary is exact.
pub fn needs_compaction(usage: &ContextUsage) -> bool {
    let threshold = f64::from(config::config().compaction.threshold);
    usage.used_tokens as f64 >= threshold * usage.max_tokens as f64
}
