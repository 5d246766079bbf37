use std::collections::VecDeque;
use std::time::Duration;

/// Re-times text delivery to a fixed per-character cadence, independent of
/// how bursty the network is.
#[derive(Debug)]
pub struct TypingBuffer {
    queue: VecDeque<char>,
    cadence: Duration,
}

impl TypingBuffer {
    pub fn new(cadence: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            cadence,
        }
    }

    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    pub fn push(&mut self, text: &str) {
        self.queue.extend(text.chars());
    }

    /// Next character to display, if any.
    pub fn pop(&mut self) -> Option<char> {
        self.queue.pop_front()
    }

    /// Characters still waiting to be shown.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

}
