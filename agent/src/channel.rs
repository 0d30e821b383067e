//! Framed channel: typed message I/O over one transport channel.
//!
//! Wraps any duplex byte stream and exposes `recv`/`send` of whole frames.
//! Reads and writes are serialized independently, so a task blocked in
//! `recv` never delays another task's `send` on the same channel.

use domexec_protocol::{decode_header, encode_header, MsgType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::AgentError;

/// Anything a framed channel can run over. The production transport is a
/// vsock stream; tests use in-memory duplex pipes.
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelStream for T {}

pub type BoxedStream = Box<dyn ChannelStream>;

/// One typed message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ty: MsgType,
    pub payload: Vec<u8>,
}

pub struct FramedChannel {
    read: Mutex<ReadState>,
    write: Mutex<WriteState>,
}

struct ReadState {
    half: Option<ReadHalf<BoxedStream>>,
    /// Bytes pulled from the transport but not yet consumed by a frame.
    carry: Vec<u8>,
}

struct WriteState {
    half: Option<WriteHalf<BoxedStream>>,
}

impl FramedChannel {
    pub fn new(stream: BoxedStream) -> Self {
        let (rd, wr) = tokio::io::split(stream);
        Self {
            read: Mutex::new(ReadState {
                half: Some(rd),
                carry: Vec::new(),
            }),
            write: Mutex::new(WriteState { half: Some(wr) }),
        }
    }

    /// Receive the next frame. `None` means the peer ended the stream; an
    /// end-of-stream in the middle of a frame aborts that frame and is also
    /// reported as `None`.
    ///
    /// Cancellation-safe: nothing is consumed from the carry-over buffer
    /// until the whole frame has arrived, so a dropped `recv` never loses or
    /// tears a frame.
    pub async fn recv(&self) -> Result<Option<Frame>, AgentError> {
        let mut rd = self.read.lock().await;
        if !rd.fill(HEADER_SIZE).await? {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&rd.carry[..HEADER_SIZE]);
        let (ty, len) = decode_header(&header);
        if len > MAX_PAYLOAD_SIZE {
            return Err(AgentError::FrameTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if !rd.fill(HEADER_SIZE + len as usize).await? {
            return Ok(None);
        }
        rd.carry.drain(..HEADER_SIZE);
        let payload = rd.carry.drain(..len as usize).collect();
        Ok(Some(Frame { ty, payload }))
    }

    /// Send one frame. Header and payload go out as a single buffered write
    /// under the write lock, so frames from concurrent senders never
    /// interleave on the wire.
    pub async fn send(&self, ty: MsgType, payload: &[u8]) -> Result<(), AgentError> {
        if payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(AgentError::FrameTooLarge {
                size: payload.len() as u32,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let mut wr = self.write.lock().await;
        let half = wr.half.as_mut().ok_or(AgentError::ChannelClosed)?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&encode_header(ty, payload.len() as u32));
        buf.extend_from_slice(payload);
        half.write_all(&buf).await?;
        half.flush().await?;
        Ok(())
    }

    /// Release the transport channel. Idempotent; callers must be quiescent
    /// (no `recv` in flight).
    pub async fn close(&self) {
        let mut wr = self.write.lock().await;
        if let Some(mut half) = wr.half.take() {
            let _ = half.shutdown().await;
        }
        drop(wr);
        let mut rd = self.read.lock().await;
        rd.half = None;
        rd.carry.clear();
    }
}

impl ReadState {
    /// Grow the carry-over buffer to at least `want` bytes, pulling transport
    /// reads as needed. Returns false if the stream ends first.
    async fn fill(&mut self, want: usize) -> Result<bool, AgentError> {
        let mut chunk = [0u8; 4096];
        while self.carry.len() < want {
            let half = match self.half.as_mut() {
                Some(half) => half,
                None => return Ok(false),
            };
            let n = half.read(&mut chunk).await?;
            if n == 0 {
                return Ok(false);
            }
            self.carry.extend_from_slice(&chunk[..n]);
        }
        Ok(true)
    }
}
