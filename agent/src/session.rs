//! Per-request lifecycle: connect back to the caller, handshake, run the
//! handler, and close the flow on every exit path.

use async_trait::async_trait;
use domexec_protocol::{split_cmdline, ExecParams};
use tracing::{info, warn};

use crate::channel::FramedChannel;
use crate::flow::{ExecKind, Flow};
use crate::handshake;
use crate::transport::Connector;

/// Exit status reported when a session fails before or inside the handler.
const FAILURE_EXIT_CODE: i64 = 255;

/// Executes one dispatched command against a flow.
///
/// Implementations may read stdin and write stdout/stderr through the flow
/// in any order. The flow is closed by the session, never by the handler; a
/// returned error is logged and reported to the caller as exit code 255.
#[async_trait]
pub trait ExecHandler: Send + Sync {
    async fn handle(&self, user: &str, cmd: &str, flow: &Flow) -> anyhow::Result<i32>;
}

/// Run one session to completion.
///
/// Every path that reaches the handshake also closes the per-session
/// channel; reporting the session end on the control channel is the
/// caller's job, and happens whether or not the channel ever opened.
pub async fn run(
    connector: &dyn Connector,
    handler: &dyn ExecHandler,
    kind: ExecKind,
    params: &ExecParams,
) {
    let stream = match connector
        .connect(params.connect_domain, params.connect_port)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                domain = params.connect_domain,
                port = params.connect_port,
                error = %e,
                "failed to open session channel"
            );
            return;
        }
    };

    let chan = FramedChannel::new(stream);
    match handshake::connect_side(&chan).await {
        Ok(version) => info!(
            domain = params.connect_domain,
            port = params.connect_port,
            version,
            "session channel established"
        ),
        Err(e) => {
            warn!(domain = params.connect_domain, error = %e, "session handshake failed");
            chan.close().await;
            return;
        }
    }

    let flow = Flow::new(chan, kind);
    let exit_code = match split_cmdline(&params.cmdline) {
        Ok((user, cmd)) => match handler.handle(&user, &cmd, &flow).await {
            Ok(code) => i64::from(code),
            Err(e) => {
                warn!(error = %e, "command handler failed");
                FAILURE_EXIT_CODE
            }
        },
        Err(e) => {
            warn!(error = %e, "rejecting malformed command line");
            FAILURE_EXIT_CODE
        }
    };

    info!(domain = params.connect_domain, exit_code, "session finished");
    flow.close(exit_code).await;
}
