//! Conversation orchestration: streaming turns, provider switching,
//! compaction, and persistence.
//!
//! One controller exclusively owns one conversation. Streaming and
//! compacting are mutually exclusive phases; a second mutating operation is
//! rejected rather than interleaved so turn ordering (and therefore context
//! accounting) stays intact.

use crate::command::{self, CommandOutcome};
use crate::compactor::{self, SessionSummary};
use crate::config;
use crate::conversation::Conversation;
use crate::error::{EngineError, ProviderError};
use crate::estimator;
use crate::logging;
use crate::message::{ChatRequest, StopReason, StreamEvent, ToolCall, Turn};
use crate::monitor::{self, ContextUsage};
use crate::provider::{self, HealthReport, Provider, ProviderId, ProviderSet};
use crate::storage::{SessionStore, StoredEntry, SummaryStore};
use futures::StreamExt;
use std::ops::ControlFlow;
use std::sync::Arc;

const BASE_SYSTEM_PROMPT: &str = "You are tandem, an AI pair programmer in a terminal. \
Collaborate on code: explain, plan, and propose concrete edits. Be concise.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Streaming,
    Compacting,
}

impl Phase {
    fn label(&self) -> &'static str {
        match self {
            Phase::Idle => "nothing",
            Phase::Streaming => "a streaming reply",
            Phase::Compacting => "a compaction",
        }
    }
}

/// What a committed user turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: Option<StopReason>,
    pub context: ContextUsage,
    pub needs_compaction: bool,
    /// True when the caller abandoned the stream; `text` holds whatever
    /// partial reply was committed.
    pub cancelled: bool,
}

pub struct Controller {
    conversation: Conversation,
    providers: ProviderSet,
    sessions: Arc<dyn SessionStore>,
    summaries: Arc<dyn SummaryStore>,
    system_prompt: String,
    phase: Phase,
    turns_at_last_save: usize,
}

impl Controller {
    /// Create a fresh session. The most recent compaction summary, if any,
    /// is folded into the system prompt as prior context.
    pub fn new(
        providers: ProviderSet,
        active: ProviderId,
        sessions: Arc<dyn SessionStore>,
        summaries: Arc<dyn SummaryStore>,
    ) -> Self {
        let mut system_prompt = BASE_SYSTEM_PROMPT.to_string();
        match summaries.latest() {
            Ok(Some(summary)) => {
                system_prompt.push_str("\n\n");
                system_prompt.push_str(&summary.as_context());
            }
            Ok(None) => {}
            Err(err) => logging::warn(&format!("could not load latest summary: {err:#}")),
        }

        Self {
            conversation: Conversation::new(active),
            providers,
            sessions,
            summaries,
            system_prompt,
            phase: Phase::Idle,
            turns_at_last_save: 0,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn active_provider(&self) -> ProviderId {
        self.conversation.provider
    }

    pub fn is_busy(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Derived, never stored: recomputed against the active provider's
    /// ceiling on every call.
    pub fn context_usage(&self) -> ContextUsage {
        monitor::recompute(&self.conversation, Some(&self.system_prompt))
    }

    pub fn needs_compaction(&self) -> bool {
        monitor::needs_compaction(&self.context_usage())
    }

    fn adapter(&self, id: ProviderId) -> Result<Arc<dyn Provider>, EngineError> {
        self.providers
            .get(id)
            .ok_or_else(|| ProviderError::NotConfigured(id).into())
    }

    fn build_request(&self) -> ChatRequest {
        let session = &config::config().session;
        ChatRequest {
            messages: self.conversation.turns.clone(),
            system: Some(self.system_prompt.clone()),
            max_tokens: Some(session.max_reply_tokens),
            temperature: session.temperature,
            tools: Vec::new(),
        }
    }

    /// Append a user turn, stream the reply, and commit the assistant turn
    /// on completion.
    ///
    /// `on_event` sees every chunk as it arrives (for incremental
    /// rendering); returning `Break` abandons the stream, committing
    /// whatever partial text was received so history matches what the user
    /// saw. A stream error discards the pending assistant turn but keeps
    /// the user turn so the conversation can be retried.
    pub async fn send_user_turn<F>(
        &mut self,
        text: &str,
        mut on_event: F,
    ) -> Result<TurnOutcome, EngineError>
    where
        F: FnMut(&StreamEvent) -> ControlFlow<()>,
    {
        if self.phase != Phase::Idle {
            return Err(EngineError::Busy(self.phase.label()));
        }
        let provider = self.adapter(self.conversation.provider)?;
        if !provider.is_configured() {
            return Err(ProviderError::NotConfigured(provider.id()).into());
        }

        self.conversation.append(Turn::user(text));

        self.phase = Phase::Streaming;
        let result = self.stream_reply(provider.as_ref(), &mut on_event).await;
        self.phase = Phase::Idle;

        let outcome = result?;
        self.autosave();
        Ok(outcome)
    }

    /// Convenience wrapper that drains the stream without observing chunks.
    pub async fn send_user_turn_collect(&mut self, text: &str) -> Result<TurnOutcome, EngineError> {
        self.send_user_turn(text, |_| ControlFlow::Continue(())).await
    }

    async fn stream_reply(
        &mut self,
        provider: &dyn Provider,
        on_event: &mut (dyn FnMut(&StreamEvent) -> ControlFlow<()> + '_),
    ) -> Result<TurnOutcome, EngineError> {
        let request = self.build_request();
        let mut stream = provider.stream(&request).await?;

        let mut text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut current_tool: Option<(String, String)> = None;
        let mut current_input = String::new();
        let mut usage_input: Option<u64> = None;
        let mut usage_output: Option<u64> = None;
        let mut stop_reason: Option<StopReason> = None;
        let mut cancelled = false;

        while let Some(event) = stream.next().await {
            // An error item discards the pending assistant turn; the user
            // turn already committed stays in the log.
            let event = event?;
            match &event {
                StreamEvent::TextDelta(delta) => text.push_str(delta),
                StreamEvent::ToolUseStart { id, name } => {
                    current_tool = Some((id.clone(), name.clone()));
                    current_input.clear();
                }
                StreamEvent::ToolInputDelta(delta) => current_input.push_str(delta),
                StreamEvent::ToolUseEnd => {
                    if let Some((id, name)) = current_tool.take() {
                        tool_calls.push(ToolCall {
                            id,
                            name,
                            input: provider::parse_tool_input(&current_input),
                        });
                        current_input.clear();
                    }
                }
                StreamEvent::TokenUsage {
                    input_tokens,
                    output_tokens,
                } => {
                    if input_tokens.is_some() {
                        usage_input = *input_tokens;
                    }
                    if output_tokens.is_some() {
                        usage_output = *output_tokens;
                    }
                }
                StreamEvent::MessageEnd {
                    stop_reason: reason,
                } => {
                    if reason.is_some() {
                        stop_reason = *reason;
                    }
                }
            }

            if on_event(&event).is_break() {
                cancelled = true;
                break;
            }
        }

        if !text.is_empty() || !tool_calls.is_empty() {
            let mut turn = Turn::assistant(&text, provider.id());
            turn.tool_calls = tool_calls.clone();
            self.conversation.append(turn);
        }

        // Best-effort usage: estimate whatever the backend didn't report
        let input = usage_input.unwrap_or_else(|| {
            let mut estimated = request
                .system
                .as_deref()
                .map(estimator::estimate)
                .unwrap_or(0);
            for turn in &request.messages {
                estimated += estimator::estimate_turn(turn);
            }
            estimated as u64
        });
        let output = usage_output.unwrap_or(estimator::estimate(&text) as u64);
        self.conversation.add_usage(input, output);

        let context = self.context_usage();
        let needs_compaction = monitor::needs_compaction(&context);
        if needs_compaction {
            logging::info(&format!(
                "context at {:.0}% of {} tokens, compaction suggested",
                context.percentage * 100.0,
                context.max_tokens
            ));
        }

        Ok(TurnOutcome {
            text,
            tool_calls,
            stop_reason,
            context,
            needs_compaction,
            cancelled,
        })
    }

    /// Summarize the log through the active provider and reset it.
    /// All-or-nothing: failure leaves the conversation untouched.
    pub async fn compact(&mut self) -> Result<SessionSummary, EngineError> {
        if self.phase != Phase::Idle {
            return Err(EngineError::Busy(self.phase.label()));
        }
        let provider = self.adapter(self.conversation.provider)?;
        if !provider.is_configured() {
            return Err(ProviderError::NotConfigured(provider.id()).into());
        }

        self.phase = Phase::Compacting;
        let result =
            compactor::compact(&mut self.conversation, provider.as_ref(), &*self.summaries).await;
        self.phase = Phase::Idle;

        let summary = result?;
        // The fresh summary becomes context for the turns that follow
        self.system_prompt = format!("{}\n\n{}", BASE_SYSTEM_PROMPT, summary.as_context());
        Ok(summary)
    }

    /// Swap the active backend, optionally compacting first. Context usage
    /// is derived, so the new ceiling takes effect immediately; switching
    /// alone can flip `needs_compaction` because ceilings differ.
    pub async fn switch_provider(
        &mut self,
        target: ProviderId,
        compact_first: bool,
    ) -> Result<Option<SessionSummary>, EngineError> {
        if self.phase != Phase::Idle {
            return Err(EngineError::Busy(self.phase.label()));
        }
        self.adapter(target)?;

        let summary = if compact_first && !self.conversation.is_empty() {
            Some(self.compact().await?)
        } else {
            None
        };

        self.conversation.provider = target;
        logging::info(&format!("switched provider to {}", target));
        Ok(summary)
    }

    pub fn clear(&mut self) {
        self.conversation.clear();
        self.turns_at_last_save = 0;
    }

    pub fn save(&mut self, name: Option<&str>) -> Result<String, EngineError> {
        if let Some(name) = name {
            self.conversation.display_name = Some(name.to_string());
        }
        self.sessions.save(&self.conversation.snapshot())?;
        self.turns_at_last_save = self.conversation.turns.len();
        Ok(self.conversation.id.clone())
    }

    pub fn load(&mut self, id: &str) -> Result<(), EngineError> {
        match self.sessions.load(id)? {
            Some(state) => {
                self.conversation.restore(state);
                self.turns_at_last_save = self.conversation.turns.len();
                Ok(())
            }
            None => Err(EngineError::Storage(format!("no conversation '{id}'"))),
        }
    }

    pub fn list_saved(&self) -> Result<Vec<StoredEntry>, EngineError> {
        Ok(self.sessions.list()?)
    }

    /// Probe every registered backend.
    pub async fn health(&self) -> Vec<(ProviderId, HealthReport)> {
        let mut reports = Vec::new();
        for id in ProviderId::ALL {
            if let Some(provider) = self.providers.get(id) {
                reports.push((id, provider.check_health().await));
            }
        }
        reports
    }

    /// Route a `/`-prefixed input through the command table.
    pub async fn dispatch_command(&mut self, raw: &str) -> Result<CommandOutcome, EngineError> {
        command::dispatch(self, raw).await
    }

    fn autosave(&mut self) {
        let every = config::config().session.autosave_every;
        if every == 0 {
            return;
        }
        let unsaved = self
            .conversation
            .turns
            .len()
            .saturating_sub(self.turns_at_last_save);
        if unsaved >= every {
            match self.sessions.save(&self.conversation.snapshot()) {
                Ok(()) => self.turns_at_last_save = self.conversation.turns.len(),
                Err(err) => logging::warn(&format!("autosave failed: {err:#}")),
            }
        }
    }
}
