//! Mock provider for e2e tests
//!
//! Returns pre-scripted StreamEvent sequences for deterministic testing.

use async_stream::stream;
use std::collections::VecDeque;
use std::sync::Mutex;
use tandem::error::ProviderError;
use tandem::message::{ChatRequest, StopReason, StreamEvent};
use tandem::provider::{EventStream, Provider, ProviderId};

pub struct MockProvider {
    id: ProviderId,
    configured: bool,
    responses: Mutex<VecDeque<Vec<Result<StreamEvent, ProviderError>>>>,
}

impl MockProvider {
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            configured: true,
            responses: Mutex::new(VecDeque::new()),
        }
    }

    pub fn unconfigured(id: ProviderId) -> Self {
        Self {
            id,
            configured: false,
            responses: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a scripted event sequence for the next stream() call
    pub fn queue_response(&self, events: Vec<Result<StreamEvent, ProviderError>>) {
        self.responses.lock().unwrap().push_back(events);
    }

    /// Queue a plain text reply split into two deltas
    pub fn queue_text_reply(&self, text: &str) {
        let mid = text.len() / 2;
        self.queue_response(vec![
            Ok(StreamEvent::TextDelta(text[..mid].to_string())),
            Ok(StreamEvent::TextDelta(text[mid..].to_string())),
            Ok(StreamEvent::MessageEnd {
                stop_reason: Some(StopReason::End),
            }),
        ]);
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn model(&self) -> String {
        "mock".to_string()
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn stream(&self, _request: &ChatRequest) -> Result<EventStream, ProviderError> {
        let events = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();

        let stream = stream! {
            for event in events {
                yield event;
            }
        };

        Ok(Box::pin(stream))
    }
}
