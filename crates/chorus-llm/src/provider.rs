use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use pin_project_lite::pin_project;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use chorus_core::errors::StreamError;
use chorus_core::provider::{CompletionProvider, EventStream};
use chorus_core::stream::StreamEvent;
use chorus_core::wire::CompletionRequest;

use crate::sse::{self, SseParser};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Streams completions from an HTTP endpoint that answers with server-sent
/// events of `{content}` fragments terminated by `[DONE]`.
pub struct HttpCompletionProvider {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpCompletionProvider {
    pub fn new(endpoint: impl Into<String>, api_key: Option<SecretString>) -> Result<Self, StreamError> {
        Self::with_connect_timeout(endpoint, api_key, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
        connect_timeout: Duration,
    ) -> Result<Self, StreamError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| StreamError::InvalidRequest(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, request), fields(model = %request.model, endpoint = %self.endpoint))]
    async fn stream(&self, request: &CompletionRequest) -> Result<EventStream, StreamError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("accept", "text/event-stream")
            .json(request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| StreamError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(StreamError::from_status(status, &body));
        }

        debug!(status = resp.status().as_u16(), "completion stream opened");
        Ok(Box::pin(SseStream::new(resp.bytes_stream())))
    }
}

pin_project! {
    /// Adapts a raw byte stream into [`StreamEvent`]s. A byte stream that ends
    /// before a terminal event yields `StreamInterrupted`.
    pub struct SseStream<S> {
        #[pin]
        inner: S,
        parser: SseParser,
        buffer: BytesMut,
        pending: VecDeque<StreamEvent>,
        closed: bool,
    }
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
            closed: false,
        }
    }
}

impl<S, E> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if *this.closed || this.parser.is_finished() {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buffer.extend_from_slice(&bytes);

                    // Decode only whole frames so multi-byte characters
                    // split across chunks survive.
                    while let Some(end) = frame_end(this.buffer) {
                        let chunk = this.buffer.split_to(end);
                        push_frames(this.parser, this.pending, &chunk);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.closed = true;
                    return Poll::Ready(Some(StreamEvent::Error {
                        error: StreamError::StreamInterrupted(e.to_string()),
                    }));
                }
                Poll::Ready(None) => {
                    *this.closed = true;
                    let remaining = this.buffer.split();
                    push_frames(this.parser, this.pending, &remaining);
                    if !this.parser.is_finished() {
                        this.pending.push_back(StreamEvent::Error {
                            error: StreamError::StreamInterrupted(
                                "connection closed before end of stream".into(),
                            ),
                        });
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Byte offset just past the first blank-line frame terminator (`\n\n` or
/// `\r\n\r\n`), if the buffer holds a complete frame.
fn frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).enumerate().find_map(|(i, w)| match w {
        b"\n\n" => Some(i + 2),
        b"\n\r" if buffer.get(i + 2) == Some(&b'\n') => Some(i + 3),
        _ => None,
    })
}

fn push_frames(parser: &mut SseParser, pending: &mut VecDeque<StreamEvent>, raw: &[u8]) {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(e) => {
            pending.push_back(StreamEvent::Error {
                error: StreamError::Protocol(format!("event frame is not valid UTF-8: {e}")),
            });
            return;
        }
    };
    for frame in sse::parse_sse_frames(text) {
        if let Some(event) = parser.parse_frame(&frame) {
            pending.push_back(event);
        }
    }
}
