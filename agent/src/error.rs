use domexec_protocol::{MsgType, WireError};
use thiserror::Error;

/// Errors fatal to a channel or session.
///
/// Anything below the session boundary propagates as one of these; the
/// session turns them into exit code 255 and the listener still reports the
/// session end to the dispatcher.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("channel is closed")]
    ChannelClosed,

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("channel closed during version exchange")]
    HandshakeEof,

    #[error("unsupported peer protocol version {got}")]
    VersionMismatch { got: u32 },

    #[error("unexpected message type {0:?}")]
    UnexpectedFrame(MsgType),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
