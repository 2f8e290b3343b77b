//! Slash-command dispatch.
//!
//! The `COMMANDS` table is the single integration point: adding a command
//! means a new row here plus its arm in `execute`. Unrecognized `/`-input
//! comes back `handled: false` so the caller decides what to do with it.

use crate::controller::Controller;
use crate::error::EngineError;
use crate::provider::ProviderId;

/// Result of routing one raw input line.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub handled: bool,
    pub response: Option<String>,
}

impl CommandOutcome {
    fn unhandled() -> Self {
        Self {
            handled: false,
            response: None,
        }
    }
}

pub struct CommandSpec {
    pub name: &'static str,
    pub usage: &'static str,
    pub summary: &'static str,
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "switch",
        usage: "/switch <provider>",
        summary: "Switch the active provider (compacts first when over budget)",
    },
    CommandSpec {
        name: "save",
        usage: "/save [name]",
        summary: "Persist the conversation",
    },
    CommandSpec {
        name: "load",
        usage: "/load [id]",
        summary: "List saved conversations, or restore one",
    },
    CommandSpec {
        name: "compact",
        usage: "/compact",
        summary: "Summarize the log and reclaim context budget",
    },
    CommandSpec {
        name: "clear",
        usage: "/clear",
        summary: "Empty the conversation",
    },
    CommandSpec {
        name: "status",
        usage: "/status",
        summary: "Check provider health",
    },
    CommandSpec {
        name: "context",
        usage: "/context",
        summary: "Show context window usage",
    },
    CommandSpec {
        name: "help",
        usage: "/help",
        summary: "List available commands",
    },
];

/// Comma-separated command names, for unknown-command messages.
pub fn command_list() -> String {
    COMMANDS
        .iter()
        .map(|c| format!("/{}", c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

pub async fn dispatch(
    controller: &mut Controller,
    raw: &str,
) -> Result<CommandOutcome, EngineError> {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Ok(CommandOutcome::unhandled());
    };

    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or("");
    let args = parts.next().unwrap_or("").trim().to_string();

    if !COMMANDS.iter().any(|spec| spec.name == name) {
        return Ok(CommandOutcome::unhandled());
    }

    let response = execute(controller, name, &args).await?;
    Ok(CommandOutcome {
        handled: true,
        response: Some(response),
    })
}

async fn execute(
    controller: &mut Controller,
    name: &str,
    args: &str,
) -> Result<String, EngineError> {
    match name {
        "switch" => {
            let target = ProviderId::parse(args)
                .ok_or_else(|| EngineError::UnknownProvider(args.to_string()))?;
            let compact_first =
                !controller.conversation().is_empty() && controller.needs_compaction();
            let summary = controller.switch_provider(target, compact_first).await?;
            let usage = controller.context_usage();
            let mut response = format!("Switched to {} ({})", target, usage.display());
            if summary.is_some() {
                response.push_str(" (compacted previous context first)");
            }
            Ok(response)
        }
        "save" => {
            let display_name = if args.is_empty() { None } else { Some(args) };
            let id = controller.save(display_name)?;
            Ok(format!("Saved conversation {}", id))
        }
        "load" => {
            if args.is_empty() {
                let entries = controller.list_saved()?;
                if entries.is_empty() {
                    return Ok("No saved conversations.".to_string());
                }
                let mut out = String::from("Saved conversations (most recent first):\n");
                for entry in entries {
                    out.push_str(&format!(
                        "  {}  {}  {}\n",
                        entry.id,
                        entry.display_name,
                        entry.updated_at.format("%Y-%m-%d %H:%M")
                    ));
                }
                out.push_str("Use /load <id> to restore one.");
                Ok(out)
            } else {
                controller.load(args)?;
                let usage = controller.context_usage();
                Ok(format!(
                    "Loaded {} ({} turns, {})",
                    args,
                    controller.conversation().turns.len(),
                    usage.display()
                ))
            }
        }
        "compact" => {
            if controller.conversation().is_empty() {
                return Ok("Nothing to compact.".to_string());
            }
            let summary = controller.compact().await?;
            let after = controller.context_usage();
            Ok(format!(
                "Compacted {} tokens into summary {} ({} now in use)",
                summary.tokens_at_compaction,
                summary.id,
                after.display()
            ))
        }
        "clear" => {
            controller.clear();
            Ok("Conversation cleared.".to_string())
        }
        "status" => {
            let reports = controller.health().await;
            let mut out = String::new();
            for (id, report) in reports {
                let latency = report
                    .latency_ms
                    .map(|ms| format!(", {}ms", ms))
                    .unwrap_or_default();
                out.push_str(&format!(
                    "{}: {}{} - {}\n",
                    id,
                    report.status.label(),
                    latency,
                    report.message
                ));
            }
            Ok(out.trim_end().to_string())
        }
        "context" => {
            let usage = controller.context_usage();
            let mut out = format!(
                "Context: {} on {}",
                usage.display(),
                controller.active_provider()
            );
            if controller.needs_compaction() {
                out.push_str("\nOver the compaction threshold. Run /compact to reclaim budget.");
            }
            Ok(out)
        }
        "help" => {
            let mut out = String::from("Commands:\n");
            for spec in COMMANDS {
                out.push_str(&format!("  {:<20} {}\n", spec.usage, spec.summary));
            }
            Ok(out.trim_end().to_string())
        }
        _ => unreachable!("command table and dispatch arms are kept in sync"),
    }
}
