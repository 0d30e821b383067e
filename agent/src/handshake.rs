//! Version exchange performed once on every freshly opened channel.
//!
//! Both sides send a `hello` carrying their protocol version and read the
//! peer's. The accept side (the agent's control channel) sends first and
//! then reads; the connect side (a per-session channel opened toward the
//! caller) reads first and then sends. The ordering is fixed by the
//! protocol.

use domexec_protocol::{MsgType, PeerInfo, PROTOCOL_VERSION};

use crate::channel::FramedChannel;
use crate::error::AgentError;

/// Accept-side handshake: announce our version, then require the peer's.
/// Returns the negotiated version.
pub async fn accept_side(chan: &FramedChannel) -> Result<u32, AgentError> {
    send_hello(chan).await?;
    recv_hello(chan).await
}

/// Connect-side handshake: require the peer's version, then announce ours.
pub async fn connect_side(chan: &FramedChannel) -> Result<u32, AgentError> {
    let version = recv_hello(chan).await?;
    send_hello(chan).await?;
    Ok(version)
}

async fn send_hello(chan: &FramedChannel) -> Result<(), AgentError> {
    let info = PeerInfo {
        version: PROTOCOL_VERSION,
    };
    chan.send(MsgType::Hello, &info.encode()).await
}

async fn recv_hello(chan: &FramedChannel) -> Result<u32, AgentError> {
    let frame = chan.recv().await?.ok_or(AgentError::HandshakeEof)?;
    if frame.ty != MsgType::Hello {
        return Err(AgentError::UnexpectedFrame(frame.ty));
    }
    let info = PeerInfo::decode(&frame.payload)?;
    if info.version != PROTOCOL_VERSION {
        return Err(AgentError::VersionMismatch { got: info.version });
    }
    Ok(info.version)
}
