//! Turn-taking engine for a shared multi-agent conversation.
//!
//! The [`scheduler`] decides who speaks and when; the [`session`] manager
//! governs how a single response is streamed, paced and terminated; the
//! [`conversation`] module wires the two together with the retry policy.

pub mod config;
pub mod conversation;
pub mod decision;
pub mod error;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod tracker;
pub mod typing;

pub use config::{DecisionConfig, EngineConfig, SchedulerConfig, SessionConfig};
pub use conversation::{Conversation, ConversationEvent};
pub use decision::DecisionPolicy;
pub use error::EngineError;
pub use retry::{RetryLedger, RetryPolicy, RetryVerdict};
pub use scheduler::{PauseChecker, PauseFlag, ResponseHandler, SchedulerSnapshot, TurnScheduler};
pub use session::{StreamHandler, StreamOutcome, StreamSessionManager, TurnOutput};
pub use tracker::Tracker;
pub use typing::TypingBuffer;
