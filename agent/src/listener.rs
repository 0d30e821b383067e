//! Control-channel loop: accept dispatch requests from the management
//! domain, spawn sessions, and report each session's end back.

use std::sync::Arc;

use domexec_protocol::{ExecParams, MsgType};
use tracing::{info, warn};

use crate::channel::{BoxedStream, FramedChannel};
use crate::error::AgentError;
use crate::flow::ExecKind;
use crate::handshake;
use crate::session::{self, ExecHandler};
use crate::transport::Connector;

pub struct Listener {
    control: Arc<FramedChannel>,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn ExecHandler>,
}

impl Listener {
    pub fn new(
        stream: BoxedStream,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn ExecHandler>,
    ) -> Self {
        Self {
            control: Arc::new(FramedChannel::new(stream)),
            connector,
            handler,
        }
    }

    /// Serve the control channel until the dispatcher hangs up.
    ///
    /// Sessions run as independent tasks and are not awaited here; each one
    /// reports back with a `connection_terminated` frame once its flow is
    /// closed. Those sends contend only on the control channel's write lock,
    /// so a blocked `recv` in this loop never delays them.
    pub async fn run(&self) -> Result<(), AgentError> {
        let version = handshake::accept_side(&self.control).await?;
        info!(version, "control channel established");

        loop {
            let frame = match self.control.recv().await? {
                Some(frame) => frame,
                None => {
                    info!("control channel closed");
                    return Ok(());
                }
            };

            let kind = match frame.ty {
                MsgType::ExecCmdline => ExecKind::Streamed,
                MsgType::JustExec => ExecKind::Detached,
                other => {
                    info!(ty = other.to_wire(), "ignoring unexpected message on control channel");
                    continue;
                }
            };

            let params = match ExecParams::decode(&frame.payload) {
                Ok(params) => params,
                Err(e) => {
                    warn!(error = %e, "discarding malformed exec request");
                    continue;
                }
            };

            self.spawn_session(kind, params);
        }
    }

    fn spawn_session(&self, kind: ExecKind, params: ExecParams) {
        let control = Arc::clone(&self.control);
        let connector = Arc::clone(&self.connector);
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            session::run(connector.as_ref(), handler.as_ref(), kind, &params).await;
            // The dispatcher waits for this even when the session channel
            // never opened.
            if let Err(e) = control
                .send(MsgType::ConnectionTerminated, &params.prefix())
                .await
            {
                warn!(error = %e, "failed to report session end");
            }
        });
    }
}
