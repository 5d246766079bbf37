use chorus_core::errors::StreamError;
use chorus_core::ids::AgentId;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("agent {0} already has a live stream")]
    AlreadyStreaming(AgentId),

    #[error("scheduler task has shut down")]
    SchedulerClosed,

    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),
}
