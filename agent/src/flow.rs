//! Stream-oriented view of one execution session.
//!
//! A flow multiplexes stdin, stdout, stderr and the final exit status over
//! the sub-streams of a single framed channel. Its mode is fixed at
//! construction: a detached flow drops writes and reports stdin as already
//! ended, so fire-and-forget commands run without any data exchange.

use std::mem;

use domexec_protocol::{ExitStatus, MsgType};
use tokio::sync::Mutex;
use tracing::warn;

use crate::channel::FramedChannel;
use crate::error::AgentError;

/// Execution mode of a flow, fixed when the session is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    /// Full bidirectional streaming (`exec_cmdline`).
    Streamed,
    /// No stdin/stdout exchange (`just_exec`).
    Detached,
}

pub struct Flow {
    chan: FramedChannel,
    kind: ExecKind,
    stdin: Mutex<StdinState>,
}

struct StdinState {
    /// Bytes received but not yet handed to the caller.
    pending: Vec<u8>,
    eof: bool,
}

impl Flow {
    pub fn new(chan: FramedChannel, kind: ExecKind) -> Self {
        Self {
            chan,
            kind,
            stdin: Mutex::new(StdinState {
                pending: Vec::new(),
                eof: false,
            }),
        }
    }

    pub fn kind(&self) -> ExecKind {
        self.kind
    }

    /// Send bytes on the stdout sub-stream.
    pub async fn write(&self, data: &[u8]) -> Result<(), AgentError> {
        self.send_data(MsgType::DataStdout, data).await
    }

    /// Send bytes on the stderr sub-stream.
    pub async fn ewrite(&self, data: &[u8]) -> Result<(), AgentError> {
        self.send_data(MsgType::DataStderr, data).await
    }

    /// Send a line on the stdout sub-stream, appending the newline.
    pub async fn write_line(&self, line: &str) -> Result<(), AgentError> {
        self.send_data(MsgType::DataStdout, format!("{line}\n").as_bytes())
            .await
    }

    /// Send a line on the stderr sub-stream, appending the newline.
    pub async fn ewrite_line(&self, line: &str) -> Result<(), AgentError> {
        self.send_data(MsgType::DataStderr, format!("{line}\n").as_bytes())
            .await
    }

    async fn send_data(&self, ty: MsgType, data: &[u8]) -> Result<(), AgentError> {
        // Empty chunks are reserved as end-of-stream markers; drop them here
        // so a handler cannot end the stream by accident.
        if data.is_empty() || self.kind == ExecKind::Detached {
            return Ok(());
        }
        self.chan.send(ty, data).await
    }

    /// Read the next stdin chunk. Drains the carry-over buffer first, then
    /// pulls one frame off the wire. `None` means end of stream.
    pub async fn read(&self) -> Result<Option<Vec<u8>>, AgentError> {
        let mut stdin = self.stdin.lock().await;
        if !stdin.pending.is_empty() {
            return Ok(Some(mem::take(&mut stdin.pending)));
        }
        self.next_chunk(&mut stdin).await
    }

    /// Read one line, excluding the newline, refilling from the wire as
    /// needed. End of stream before a newline discards any partial residue
    /// and returns `None`.
    pub async fn read_line(&self) -> Result<Option<String>, AgentError> {
        let mut stdin = self.stdin.lock().await;
        loop {
            if let Some(pos) = stdin.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = stdin.pending.drain(..=pos).collect();
                return Ok(Some(String::from_utf8_lossy(&line[..pos]).into_owned()));
            }
            match self.next_chunk(&mut stdin).await? {
                Some(chunk) => stdin.pending.extend_from_slice(&chunk),
                None => {
                    stdin.pending.clear();
                    return Ok(None);
                }
            }
        }
    }

    /// Pull the next stdin chunk off the wire, ignoring the carry-over
    /// buffer. An empty `data_stdin` payload and a channel end-of-stream both
    /// end the sub-stream; any other frame type is a protocol error.
    async fn next_chunk(&self, stdin: &mut StdinState) -> Result<Option<Vec<u8>>, AgentError> {
        if stdin.eof || self.kind == ExecKind::Detached {
            return Ok(None);
        }
        match self.chan.recv().await? {
            Some(frame) if frame.ty == MsgType::DataStdin => {
                if frame.payload.is_empty() {
                    stdin.eof = true;
                    Ok(None)
                } else {
                    Ok(Some(frame.payload))
                }
            }
            Some(frame) => Err(AgentError::UnexpectedFrame(frame.ty)),
            None => {
                stdin.eof = true;
                Ok(None)
            }
        }
    }

    /// End the flow: send the stdout end-of-stream marker, then the exit
    /// status, then release the channel. Runs on every session exit path;
    /// teardown errors are logged so they never mask the handler's result.
    pub async fn close(self, exit_code: i64) {
        if let Err(e) = self.chan.send(MsgType::DataStdout, &[]).await {
            warn!(error = %e, "failed to send end-of-stream marker");
        }
        let status = ExitStatus {
            return_code: exit_code,
        };
        if let Err(e) = self.chan.send(MsgType::DataExitCode, &status.encode()).await {
            warn!(error = %e, "failed to send exit status");
        }
        self.chan.close().await;
    }
}
