use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::StreamError;
use crate::stream::StreamEvent;
use crate::wire::CompletionRequest;

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// An upstream completion service. Stateless request/response: the returned
/// stream yields content fragments until a terminal event.
///
/// Errors returned from `stream` itself are connection-level failures
/// (including non-2xx responses); errors after the stream opened arrive as
/// `StreamEvent::Error`.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(&self, request: &CompletionRequest) -> Result<EventStream, StreamError>;
}
