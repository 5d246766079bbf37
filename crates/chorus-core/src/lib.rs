//! Shared vocabulary for the chorus coordination engine: participants,
//! transcript messages, turn decisions, the upstream wire format and the
//! streaming contract every completion provider implements.

pub mod conversation;
pub mod errors;
pub mod ids;
pub mod provider;
pub mod stream;
pub mod turn;
pub mod wire;
