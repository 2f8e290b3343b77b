//! Summarize-and-reset compaction.
//!
//! Compaction is all-or-nothing: the turn log is only truncated after the
//! summary has been generated *and* persisted. Any failure along the way
//! leaves the conversation exactly as it was.

use crate::conversation::Conversation;
use crate::error::EngineError;
use crate::id::new_id;
use crate::message::{ChatRequest, Role, Turn};
use crate::monitor;
use crate::provider::Provider;
use crate::storage::SummaryStore;
use crate::util::truncate_str;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tool results rendered into the summarization prompt are clipped to this
const TOOL_INPUT_SNIPPET_BYTES: usize = 500;

const SUMMARY_PROMPT: &str = r#"Summarize the conversation above so a future session can pick up where this one left off.

Respond in exactly these Markdown sections:

## Summary
A short narrative of what was worked on and why.

## Key Decisions
- One bullet per decision that was made.

## Files Touched
- One bullet per file path that was created or modified.

## Next Steps
- One bullet per open follow-up.

Keep it concise but preserve anything needed to continue the work."#;

/// Durable artifact produced by compaction. Appended to the summary store,
/// never mutated; the most recent one seeds the next session's context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub narrative: String,
    pub key_decisions: Vec<String>,
    pub files_touched: Vec<String>,
    pub next_steps: Vec<String>,
    pub tokens_at_compaction: usize,
}

impl SessionSummary {
    /// Render the summary back into prompt context for a later session.
    pub fn as_context(&self) -> String {
        let mut out = String::new();
        out.push_str("## Previous session summary\n\n");
        out.push_str(&self.narrative);
        if !self.key_decisions.is_empty() {
            out.push_str("\n\nKey decisions:\n");
            for decision in &self.key_decisions {
                out.push_str(&format!("- {}\n", decision));
            }
        }
        if !self.files_touched.is_empty() {
            out.push_str("\nFiles touched:\n");
            for path in &self.files_touched {
                out.push_str(&format!("- {}\n", path));
            }
        }
        if !self.next_steps.is_empty() {
            out.push_str("\nNext steps:\n");
            for step in &self.next_steps {
                out.push_str(&format!("- {}\n", step));
            }
        }
        out
    }

    #[cfg(test)]
    pub fn stub(narrative: &str) -> Self {
        Self {
            id: new_id("summary"),
            created_at: Utc::now(),
            title: None,
            narrative: narrative.to_string(),
            key_decisions: Vec::new(),
            files_touched: Vec::new(),
            next_steps: Vec::new(),
            tokens_at_compaction: 0,
        }
    }
}

/// Drive a summarization request through the provider, persist the result,
/// and only then replace the turn log. Idle → Summarizing → Committed, or
/// back to Idle with `conversation` untouched on failure.
pub async fn compact(
    conversation: &mut Conversation,
    provider: &dyn Provider,
    store: &dyn SummaryStore,
) -> Result<SessionSummary, EngineError> {
    if conversation.is_empty() {
        return Err(EngineError::Compaction("nothing to compact".to_string()));
    }

    let tokens_before = monitor::recompute(conversation, None).used_tokens;

    let prompt = format!(
        "{}\n\n---\n\n{}",
        render_transcript(&conversation.turns),
        SUMMARY_PROMPT
    );
    let request = ChatRequest {
        messages: vec![Turn::user(&prompt)],
        system: Some("You summarize pair-programming conversations for later resumption.".to_string()),
        max_tokens: Some(crate::config::config().compaction.max_summary_tokens),
        ..Default::default()
    };

    let completion = provider
        .complete(&request)
        .await
        .map_err(|e| EngineError::Compaction(e.to_string()))?;

    let parsed = parse_summary(&completion.content).ok_or_else(|| {
        EngineError::Compaction("summary response missing required sections".to_string())
    })?;

    let summary = SessionSummary {
        id: new_id("summary"),
        created_at: Utc::now(),
        title: conversation.display_name.clone(),
        narrative: parsed.narrative,
        key_decisions: parsed.key_decisions,
        files_touched: parsed.files_touched,
        next_steps: parsed.next_steps,
        tokens_at_compaction: tokens_before,
    };

    store
        .append(&summary)
        .map_err(|e| EngineError::Compaction(format!("could not persist summary: {e:#}")))?;

    // Commit point: everything that can fail has succeeded.
    conversation.turns.clear();
    conversation.updated_at = Utc::now();

    crate::logging::info(&format!(
        "compacted {} tokens into summary {}",
        tokens_before, summary.id
    ));

    Ok(summary)
}

/// Render the full turn log, role-prefixed, for the summarization prompt.
fn render_transcript(turns: &[Turn]) -> String {
    let mut out = String::new();
    for turn in turns {
        let role = match turn.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        out.push_str(&format!("**{}:**\n", role));
        if !turn.content.is_empty() {
            out.push_str(&turn.content);
            out.push('\n');
        }
        for call in &turn.tool_calls {
            let input = call.input.to_string();
            out.push_str(&format!(
                "[Tool: {} - {}]\n",
                call.name,
                truncate_str(&input, TOOL_INPUT_SNIPPET_BYTES)
            ));
        }
        out.push('\n');
    }
    out
}

struct ParsedSummary {
    narrative: String,
    key_decisions: Vec<String>,
    files_touched: Vec<String>,
    next_steps: Vec<String>,
}

/// Split the model's Markdown reply into the four required categories.
/// Returns None when no usable narrative can be found.
fn parse_summary(text: &str) -> Option<ParsedSummary> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let mut narrative = String::new();
    let mut key_decisions = Vec::new();
    let mut files_touched = Vec::new();
    let mut next_steps = Vec::new();

    #[derive(PartialEq)]
    enum Section {
        Preamble,
        Narrative,
        Decisions,
        Files,
        NextSteps,
        Other,
    }

    let mut section = Section::Preamble;
    for line in text.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            section = match heading.trim().to_lowercase().as_str() {
                "summary" => Section::Narrative,
                "key decisions" => Section::Decisions,
                "files touched" => Section::Files,
                "next steps" => Section::NextSteps,
                _ => Section::Other,
            };
            continue;
        }

        match section {
            Section::Narrative | Section::Preamble => {
                if !line.trim().is_empty() || !narrative.is_empty() {
                    narrative.push_str(line);
                    narrative.push('\n');
                }
            }
            Section::Decisions => push_bullet(&mut key_decisions, line),
            Section::Files => push_bullet(&mut files_touched, line),
            Section::NextSteps => push_bullet(&mut next_steps, line),
            Section::Other => {}
        }
    }

    let narrative = narrative.trim().to_string();
    if narrative.is_empty() {
        return None;
    }

    Some(ParsedSummary {
        narrative,
        key_decisions,
        files_touched,
        next_steps,
    })
}

fn push_bullet(bucket: &mut Vec<String>, line: &str) {
    let trimmed = line.trim();
    let item = trimmed
        .strip_prefix("- ")
        .or_else(|| trimmed.strip_prefix("* "))
        .unwrap_or(trimmed);
    if !item.is_empty() && item.to_lowercase() != "none" {
        bucket.push(item.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderId;

    const SAMPLE_REPLY: &str = "## Summary\nWe refactored the parser module.\n\n## Key Decisions\n- Keep the recursive descent approach\n- Drop the regex tokenizer\n\n## Files Touched\n- src/parser.rs\n- src/lexer.rs\n\n## Next Steps\n- Add error recovery\n";

    #[test]
    fn test_parse_summary_sections() {
        let parsed = parse_summary(SAMPLE_REPLY).unwrap();
        assert_eq!(parsed.narrative, "We refactored the parser module.");
        assert_eq!(parsed.key_decisions.len(), 2);
        assert_eq!(parsed.files_touched, ["src/parser.rs", "src/lexer.rs"]);
        assert_eq!(parsed.next_steps, ["Add error recovery"]);
    }

    #[test]
    fn test_parse_summary_tolerates_missing_lists() {
        let parsed = parse_summary("## Summary\nShort session.\n\n## Key Decisions\n- None\n")
            .unwrap();
        assert_eq!(parsed.narrative, "Short session.");
        assert!(parsed.key_decisions.is_empty());
        assert!(parsed.files_touched.is_empty());
    }

    #[test]
    fn test_parse_summary_plain_text_is_narrative() {
        // A reply that ignored the section format still yields a usable record
        let parsed = parse_summary("We fixed the login bug and shipped it.").unwrap();
        assert_eq!(parsed.narrative, "We fixed the login bug and shipped it.");
    }

    #[test]
    fn test_parse_summary_rejects_empty() {
        assert!(parse_summary("").is_none());
        assert!(parse_summary("   \n  ").is_none());
    }

    #[test]
    fn test_render_transcript_prefixes_roles() {
        let turns = vec![
            Turn::user("fix the tests"),
            Turn::assistant("on it", ProviderId::Anthropic),
        ];
        let transcript = render_transcript(&turns);
        assert!(transcript.contains("**User:**\nfix the tests"));
        assert!(transcript.contains("**Assistant:**\non it"));
    }

    #[test]
    fn test_summary_as_context_lists_sections() {
        let summary = SessionSummary {
            key_decisions: vec!["use sqlite".to_string()],
            files_touched: vec!["src/db.rs".to_string()],
            next_steps: vec!["add migrations".to_string()],
            ..SessionSummary::stub("Built the storage layer.")
        };
        let context = summary.as_context();
        assert!(context.contains("Built the storage layer."));
        assert!(context.contains("- use sqlite"));
        assert!(context.contains("- src/db.rs"));
        assert!(context.contains("- add migrations"));
    }
}
