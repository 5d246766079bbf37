use crate::errors::StreamError;

/// Events produced by an upstream completion stream. Ordering contract:
///
/// Delta* → (Done | Error)
///
/// Anything after a terminal event is ignored by consumers.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Delta { content: String },
    Done,
    Error { error: StreamError },
}

impl StreamEvent {
    pub fn delta(content: impl Into<String>) -> Self {
        Self::Delta { content: content.into() }
    }
}
