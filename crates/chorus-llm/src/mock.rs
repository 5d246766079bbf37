use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;

use chorus_core::errors::StreamError;
use chorus_core::provider::{CompletionProvider, EventStream};
use chorus_core::stream::StreamEvent;
use chorus_core::wire::CompletionRequest;

/// Scripted responses for deterministic tests without a live endpoint.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield these events immediately.
    Stream(Vec<StreamEvent>),
    /// Fail the `stream()` call itself.
    Error(StreamError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Yield each event after `gap`.
    Paced { events: Vec<StreamEvent>, gap: Duration },
    /// Yield these events, then never produce another.
    Stall(Vec<StreamEvent>),
    /// Open a stream that never yields.
    Hang,
}

impl MockResponse {
    /// One delta carrying the whole text, then Done.
    pub fn text(text: &str) -> Self {
        Self::Stream(vec![StreamEvent::delta(text), StreamEvent::Done])
    }

    /// One delta per fragment, then Done.
    pub fn fragments(parts: &[&str]) -> Self {
        Self::Stream(fragment_events(parts))
    }

    /// Same as [`fragments`](Self::fragments) but spaced `gap` apart.
    pub fn paced(parts: &[&str], gap: Duration) -> Self {
        Self::Paced {
            events: fragment_events(parts),
            gap,
        }
    }

    /// A stream that finishes without content.
    pub fn empty() -> Self {
        Self::Stream(vec![StreamEvent::Done])
    }

    /// Partial content followed by a mid-stream error event.
    pub fn stream_error(partial: &str, error: StreamError) -> Self {
        let mut events = Vec::new();
        if !partial.is_empty() {
            events.push(StreamEvent::delta(partial));
        }
        events.push(StreamEvent::Error { error });
        Self::Stream(events)
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

fn fragment_events(parts: &[&str]) -> Vec<StreamEvent> {
    parts
        .iter()
        .map(|p| StreamEvent::delta(*p))
        .chain(std::iter::once(StreamEvent::Done))
        .collect()
}

/// Provider that plays back scripted responses.
///
/// Responses scripted for a specific model are consumed first; otherwise the
/// shared sequence is used, then the repeating fallback if one is set.
#[derive(Default)]
pub struct MockProvider {
    shared: Mutex<VecDeque<MockResponse>>,
    per_model: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    fallback: Option<MockResponse>,
    requests: Mutex<Vec<CompletionRequest>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            shared: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    /// Answers every call with `response`.
    pub fn repeating(response: MockResponse) -> Self {
        Self {
            fallback: Some(response),
            ..Self::default()
        }
    }

    pub fn with_model_script(self, model: impl Into<String>, responses: Vec<MockResponse>) -> Self {
        self.per_model.lock().insert(model.into(), responses.into());
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    fn next_response(&self, model: &str) -> Option<MockResponse> {
        if let Some(script) = self.per_model.lock().get_mut(model) {
            if let Some(resp) = script.pop_front() {
                return Some(resp);
            }
        }
        self.shared
            .lock()
            .pop_front()
            .or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<EventStream, StreamError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let Some(response) = self.next_response(&request.model) else {
            return Err(StreamError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            )));
        };

        resolve_response(response).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<EventStream, StreamError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
            MockResponse::Paced { events, gap } => {
                let paced = stream::iter(events).then(move |event| async move {
                    tokio::time::sleep(gap).await;
                    event
                });
                return Ok(Box::pin(paced));
            }
            MockResponse::Stall(events) => {
                return Ok(Box::pin(stream::iter(events).chain(stream::pending::<StreamEvent>())));
            }
            MockResponse::Hang => return Ok(Box::pin(stream::pending::<StreamEvent>())),
        }
    }
}
