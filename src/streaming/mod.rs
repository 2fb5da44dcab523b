//! Streaming sessions.
//!
//! A session ties one client request to either a direct file read or a live
//! encoder pipeline. The registry tracks every active session for bounded
//! admission and external cancellation.

pub mod registry;
pub mod session;

pub use registry::{
    DeliveryMode, SessionGuard, SessionOutcome, SessionRegistry, SessionSnapshot, SessionState,
};
pub use session::{StreamContent, StreamSession};

use crate::encoder::EncoderError;
use crate::probe::ProbeError;

/// Errors terminating a session before or during streaming.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("client disconnected")]
    ClientDisconnected,

    #[error("requested byte range cannot be satisfied")]
    RangeUnsatisfiable,

    #[error("concurrent session limit exceeded")]
    ConcurrencyLimitExceeded,

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),
}
