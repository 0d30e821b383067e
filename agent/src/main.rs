use std::sync::Arc;

use anyhow::{Context, Result};
use domexec_protocol::CONTROL_PORT;
use tracing::{info, warn};

use domexec_agent::{Listener, ShellHandler, VsockConnector, VsockListener};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "domexec agent starting"
    );

    let listener = VsockListener::bind(CONTROL_PORT)
        .with_context(|| format!("failed to bind control port {CONTROL_PORT}"))?;
    info!(port = CONTROL_PORT, "waiting for the dispatcher");

    loop {
        let (stream, peer) = listener.accept().await.context("control accept failed")?;
        info!(domain = peer, "control connection established");

        let agent = Listener::new(
            Box::new(stream),
            Arc::new(VsockConnector),
            Arc::new(ShellHandler),
        );
        if let Err(e) = agent.run().await {
            warn!(error = %e, "control channel failed");
        }
        info!(domain = peer, "control connection closed");
    }
}
