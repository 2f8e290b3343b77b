//! Token estimation and per-provider context ceilings.
//!
//! The estimate is a budget heuristic, not a billing-accurate count. It must
//! round up so the budget math never under-reports; byte length over-counts
//! multibyte text, which errs in the same safe direction.

use crate::config;
use crate::message::Turn;
use crate::provider::ProviderId;

/// Approximate bytes per token
const BYTES_PER_TOKEN: usize = 4;

/// Ceiling used for a provider with no table row
const DEFAULT_CONTEXT_CEILING: usize = 128_000;

/// Context window ceilings, one row per provider identity.
const CONTEXT_CEILINGS: &[(ProviderId, usize)] = &[
    (ProviderId::Anthropic, 200_000),
    (ProviderId::OpenAI, 128_000),
    (ProviderId::Gemini, 1_048_576),
];

/// Conservative token estimate for a text blob: ceil(len / 4).
pub fn estimate(text: &str) -> usize {
    text.len().div_ceil(BYTES_PER_TOKEN)
}

/// Estimated tokens for one turn, including any recorded tool calls.
pub fn estimate_turn(turn: &Turn) -> usize {
    let mut total = estimate(&turn.content);
    for call in &turn.tool_calls {
        total += estimate(&call.name) + estimate(&call.input.to_string());
    }
    total
}

/// Context window ceiling for a provider. Config can override any table row.
pub fn ceiling_for(provider: ProviderId) -> usize {
    if let Some(ceiling) = config::config().context.ceiling_override(provider) {
        return ceiling;
    }
    CONTEXT_CEILINGS
        .iter()
        .find(|(id, _)| *id == provider)
        .map(|(_, ceiling)| *ceiling)
        .unwrap_or(DEFAULT_CONTEXT_CEILING)
}
