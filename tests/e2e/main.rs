//! End-to-end tests for the conversation engine using a mock provider
//!
//! These tests verify the full flow from user input through streaming,
//! compaction, switching, and persistence without real API calls.

mod mock_provider;

use mock_provider::MockProvider;
use std::ops::ControlFlow;
use std::sync::Arc;
use tandem::controller::Controller;
use tandem::error::{EngineError, ProviderError};
use tandem::message::{Role, StopReason, StreamEvent};
use tandem::provider::{HealthStatus, Provider, ProviderId, ProviderSet};
use tandem::storage::{FsSessionStore, FsSummaryStore, SummaryStore};
use tempfile::TempDir;

const SUMMARY_REPLY: &str = "## Summary\nWorked through a refactor of the auth module.\n\n## Key Decisions\n- Split token refresh into its own task\n\n## Files Touched\n- src/auth.rs\n\n## Next Steps\n- Wire up retry telemetry\n";

fn controller_with(dir: &TempDir, adapters: Vec<Arc<MockProvider>>) -> Controller {
    let active = adapters[0].id();
    let mut providers = ProviderSet::default();
    for adapter in adapters {
        providers.insert(adapter);
    }
    let sessions = Arc::new(FsSessionStore::with_root(dir.path().join("conversations")));
    let summaries = Arc::new(FsSummaryStore::with_root(dir.path().join("summaries")));
    Controller::new(providers, active, sessions, summaries)
}

/// A streamed reply commits a user turn and an assistant turn in order
#[tokio::test]
async fn test_streamed_reply_commits_turns() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(ProviderId::Anthropic));
    provider.queue_text_reply("Hello! How can I help?");
    let mut controller = controller_with(&dir, vec![provider]);

    let outcome = controller.send_user_turn_collect("Say hello").await.unwrap();

    assert_eq!(outcome.text, "Hello! How can I help?");
    assert_eq!(outcome.stop_reason, Some(StopReason::End));
    assert!(!outcome.cancelled);

    let turns = &controller.conversation().turns;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].content, "Say hello");
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].provider, Some(ProviderId::Anthropic));
}

/// Context usage never decreases across successful turns
#[tokio::test]
async fn test_context_usage_is_monotonic() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(ProviderId::Anthropic));
    let mut controller = controller_with(&dir, vec![provider.clone()]);

    let mut last_used = 0;
    for i in 0..3 {
        provider.queue_text_reply("A reasonably sized reply with some detail in it.");
        let outcome = controller
            .send_user_turn_collect(&format!("Question number {}", i))
            .await
            .unwrap();
        assert!(outcome.context.used_tokens >= last_used);
        last_used = outcome.context.used_tokens;
    }
    assert!(last_used > 0);
}

/// A stream that errors before any text leaves the user turn in the log
/// and no assistant turn
#[tokio::test]
async fn test_failed_stream_preserves_user_turn() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(ProviderId::Anthropic));
    provider.queue_response(vec![Err(ProviderError::Transport(
        "connection reset".to_string(),
    ))]);
    let mut controller = controller_with(&dir, vec![provider]);

    let result = controller.send_user_turn_collect("hello").await;
    assert!(matches!(
        result,
        Err(EngineError::Provider(ProviderError::Transport(_)))
    ));

    let turns = &controller.conversation().turns;
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].content, "hello");
}

/// Partial text before a stream error is discarded, not committed
#[tokio::test]
async fn test_error_after_partial_text_discards_pending_turn() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(ProviderId::Anthropic));
    provider.queue_response(vec![
        Ok(StreamEvent::TextDelta("Starting...".to_string())),
        Err(ProviderError::Transport("broken pipe".to_string())),
    ]);
    let mut controller = controller_with(&dir, vec![provider]);

    assert!(controller.send_user_turn_collect("go").await.is_err());
    let turns = &controller.conversation().turns;
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, Role::User);
}

/// An abandoned stream commits the partial text the caller actually saw
#[tokio::test]
async fn test_cancelled_stream_commits_partial_text() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(ProviderId::Anthropic));
    provider.queue_response(vec![
        Ok(StreamEvent::TextDelta("Hello".to_string())),
        Ok(StreamEvent::TextDelta(" world".to_string())),
        Ok(StreamEvent::MessageEnd {
            stop_reason: Some(StopReason::End),
        }),
    ]);
    let mut controller = controller_with(&dir, vec![provider]);

    let mut deltas_seen = 0;
    let outcome = controller
        .send_user_turn("hi", |event| {
            if matches!(event, StreamEvent::TextDelta(_)) {
                deltas_seen += 1;
                if deltas_seen == 1 {
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        })
        .await
        .unwrap();

    assert!(outcome.cancelled);
    assert_eq!(outcome.text, "Hello");

    let turns = &controller.conversation().turns;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].content, "Hello");
}

/// Streamed tool-call argument fragments are accumulated into full input
#[tokio::test]
async fn test_tool_call_fragments_accumulate() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(ProviderId::Anthropic));
    provider.queue_response(vec![
        Ok(StreamEvent::ToolUseStart {
            id: "tc_1".to_string(),
            name: "read".to_string(),
        }),
        Ok(StreamEvent::ToolInputDelta("{\"file_path\":".to_string())),
        Ok(StreamEvent::ToolInputDelta("\"src/main.rs\"}".to_string())),
        Ok(StreamEvent::ToolUseEnd),
        Ok(StreamEvent::MessageEnd {
            stop_reason: Some(StopReason::ToolUse),
        }),
    ]);
    let mut controller = controller_with(&dir, vec![provider]);

    let outcome = controller.send_user_turn_collect("read main").await.unwrap();
    assert_eq!(outcome.stop_reason, Some(StopReason::ToolUse));
    assert_eq!(outcome.tool_calls.len(), 1);
    assert_eq!(
        outcome.tool_calls[0].input,
        serde_json::json!({"file_path": "src/main.rs"})
    );

    let turns = &controller.conversation().turns;
    assert_eq!(turns[1].tool_calls.len(), 1);
}

/// A failed summarization leaves the turn log byte-identical
#[tokio::test]
async fn test_compaction_failure_is_all_or_nothing() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(ProviderId::Anthropic));
    let mut controller = controller_with(&dir, vec![provider.clone()]);

    for i in 0..3 {
        provider.queue_text_reply("Some assistant reply with enough words to matter.");
        controller
            .send_user_turn_collect(&format!("message {}", i))
            .await
            .unwrap();
    }
    let turns_before = controller.conversation().turns.clone();

    provider.queue_response(vec![Err(ProviderError::Transport("timed out".to_string()))]);
    let result = controller.compact().await;
    assert!(matches!(result, Err(EngineError::Compaction(_))));

    assert_eq!(controller.conversation().turns, turns_before);
}

/// An unusable summary reply (no content) also leaves the log untouched
#[tokio::test]
async fn test_compaction_rejects_empty_summary() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(ProviderId::Anthropic));
    let mut controller = controller_with(&dir, vec![provider.clone()]);

    provider.queue_text_reply("hi there");
    controller.send_user_turn_collect("hello").await.unwrap();
    let turns_before = controller.conversation().turns.clone();

    provider.queue_response(vec![Ok(StreamEvent::MessageEnd {
        stop_reason: Some(StopReason::End),
    })]);
    assert!(matches!(
        controller.compact().await,
        Err(EngineError::Compaction(_))
    ));
    assert_eq!(controller.conversation().turns, turns_before);
}

/// Successful compaction empties the log, persists the summary, and drops
/// context usage back under the threshold
#[tokio::test]
async fn test_compaction_resets_budget_and_persists_summary() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(ProviderId::Anthropic));
    let mut controller = controller_with(&dir, vec![provider.clone()]);

    provider.queue_text_reply("A long discussion about the auth refactor.");
    controller
        .send_user_turn_collect("let's refactor auth")
        .await
        .unwrap();

    let used_before = controller.context_usage().used_tokens;
    assert!(used_before > 0);

    provider.queue_text_reply(SUMMARY_REPLY);
    let summary = controller.compact().await.unwrap();

    assert!(controller.conversation().is_empty());
    assert_eq!(summary.files_touched, ["src/auth.rs"]);
    assert_eq!(summary.key_decisions.len(), 1);
    assert!(summary.tokens_at_compaction > 0);

    let usage = controller.context_usage();
    assert!(usage.percentage < 0.75);

    // The summary store is append-only and now holds the new record
    let summaries = FsSummaryStore::with_root(dir.path().join("summaries"));
    let latest = summaries.latest().unwrap().unwrap();
    assert_eq!(latest.id, summary.id);
}

/// Switching providers applies the new ceiling immediately without touching
/// the turn log
#[tokio::test]
async fn test_switch_provider_changes_ceiling_immediately() {
    let dir = TempDir::new().unwrap();
    let anthropic = Arc::new(MockProvider::new(ProviderId::Anthropic));
    let openai = Arc::new(MockProvider::new(ProviderId::OpenAI));
    let mut controller = controller_with(&dir, vec![anthropic.clone(), openai]);

    // ~100k estimated tokens: 400_000 bytes of user content
    anthropic.queue_text_reply("ok");
    controller
        .send_user_turn_collect(&"x".repeat(400_000))
        .await
        .unwrap();

    let before = controller.context_usage();
    assert_eq!(before.max_tokens, 200_000);
    assert!(!controller.needs_compaction());
    let turns_before = controller.conversation().turns.clone();

    let summary = controller
        .switch_provider(ProviderId::OpenAI, false)
        .await
        .unwrap();
    assert!(summary.is_none());

    let after = controller.context_usage();
    assert_eq!(after.max_tokens, 128_000);
    assert!(after.percentage > before.percentage);
    assert!(controller.needs_compaction());
    assert_eq!(controller.conversation().turns, turns_before);
}

/// Unknown slash commands are inert: handled=false, nothing appended
#[tokio::test]
async fn test_unknown_command_is_inert() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(ProviderId::Anthropic));
    let mut controller = controller_with(&dir, vec![provider]);

    let outcome = controller.dispatch_command("/frobnicate").await.unwrap();
    assert!(!outcome.handled);
    assert!(outcome.response.is_none());
    assert!(controller.conversation().is_empty());
}

/// /switch with a bogus provider name surfaces a typed error
#[tokio::test]
async fn test_switch_command_rejects_unknown_provider() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(ProviderId::Anthropic));
    let mut controller = controller_with(&dir, vec![provider]);

    let result = controller.dispatch_command("/switch bogus").await;
    assert!(matches!(result, Err(EngineError::UnknownProvider(_))));
}

/// Known commands run through the table: /clear empties, /context reports
#[tokio::test]
async fn test_clear_and_context_commands() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(ProviderId::Anthropic));
    provider.queue_text_reply("sure");
    let mut controller = controller_with(&dir, vec![provider]);

    controller.send_user_turn_collect("hello").await.unwrap();
    assert!(!controller.conversation().is_empty());

    let outcome = controller.dispatch_command("/clear").await.unwrap();
    assert!(outcome.handled);
    assert!(controller.conversation().is_empty());

    let outcome = controller.dispatch_command("/context").await.unwrap();
    assert!(outcome.handled);
    assert!(outcome.response.unwrap().contains("anthropic"));

    let outcome = controller.dispatch_command("/help").await.unwrap();
    assert!(outcome.response.unwrap().contains("/switch"));
}

/// Saved state restores deep-equal, including after a compaction
#[tokio::test]
async fn test_round_trip_persistence() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(ProviderId::Anthropic));
    let mut controller = controller_with(&dir, vec![provider.clone()]);

    provider.queue_text_reply("first reply");
    controller.send_user_turn_collect("first").await.unwrap();
    let id = controller.save(Some("alpha")).unwrap();
    let saved = controller.conversation().clone();

    let provider2 = Arc::new(MockProvider::new(ProviderId::Anthropic));
    let mut restored = controller_with(&dir, vec![provider2.clone()]);
    restored.load(&id).unwrap();
    assert_eq!(restored.conversation(), &saved);

    // Compact, save again, and round-trip the post-compaction state
    provider2.queue_text_reply(SUMMARY_REPLY);
    restored.compact().await.unwrap();
    let id = restored.save(None).unwrap();
    let compacted = restored.conversation().clone();
    assert!(compacted.is_empty());

    let provider3 = Arc::new(MockProvider::new(ProviderId::Anthropic));
    let mut third = controller_with(&dir, vec![provider3]);
    third.load(&id).unwrap();
    assert_eq!(third.conversation(), &compacted);
}

/// An unconfigured provider blocks sendUserTurn before anything is appended
#[tokio::test]
async fn test_unconfigured_provider_blocks_send() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::unconfigured(ProviderId::Gemini));
    let mut controller = controller_with(&dir, vec![provider]);

    let result = controller.send_user_turn_collect("hello").await;
    assert!(matches!(
        result,
        Err(EngineError::Provider(ProviderError::NotConfigured(
            ProviderId::Gemini
        )))
    ));
    assert!(controller.conversation().is_empty());
}

/// Health classification: missing credential and auth rejection are red,
/// rate limiting is yellow, success is green with latency
#[tokio::test]
async fn test_health_check_classification() {
    let unconfigured = MockProvider::unconfigured(ProviderId::OpenAI);
    let report = unconfigured.check_health().await;
    assert_eq!(report.status, HealthStatus::Red);
    assert!(!report.has_credential);

    let auth_failing = MockProvider::new(ProviderId::Anthropic);
    auth_failing.queue_response(vec![Err(ProviderError::Auth("bad key".to_string()))]);
    let report = auth_failing.check_health().await;
    assert_eq!(report.status, HealthStatus::Red);
    assert!(report.has_credential);
    assert!(report.message.contains("invalid credential"));

    let rate_limited = MockProvider::new(ProviderId::Anthropic);
    rate_limited.queue_response(vec![Err(ProviderError::RateLimited {
        message: "try later".to_string(),
        retry_after_secs: Some(30),
    })]);
    let report = rate_limited.check_health().await;
    assert_eq!(report.status, HealthStatus::Yellow);

    let healthy = MockProvider::new(ProviderId::Anthropic);
    healthy.queue_text_reply("pong");
    let report = healthy.check_health().await;
    assert_eq!(report.status, HealthStatus::Green);
    assert!(report.latency_ms.is_some());
}

/// Usage reported by the backend is folded into the cumulative counters
#[tokio::test]
async fn test_reported_usage_accumulates() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(ProviderId::Anthropic));
    provider.queue_response(vec![
        Ok(StreamEvent::TextDelta("Response".to_string())),
        Ok(StreamEvent::TokenUsage {
            input_tokens: Some(10),
            output_tokens: Some(20),
        }),
        Ok(StreamEvent::MessageEnd {
            stop_reason: Some(StopReason::End),
        }),
    ]);
    let mut controller = controller_with(&dir, vec![provider]);

    controller.send_user_turn_collect("test").await.unwrap();
    let usage = controller.conversation().usage;
    assert_eq!(usage.input_tokens, 10);
    assert_eq!(usage.output_tokens, 20);
}
