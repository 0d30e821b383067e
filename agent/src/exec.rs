//! Default command handler: run the dispatched command under the system
//! shell with piped stdio.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::info;

use crate::flow::Flow;
use crate::session::ExecHandler;

/// Runs dispatched commands through `/bin/sh -c`.
///
/// Flow stdin is piped into the child; child stdout/stderr stream back
/// through the flow as they are produced. The user field is recorded but not
/// switched; embedders that need account switching wrap or replace this
/// handler.
pub struct ShellHandler;

#[async_trait]
impl ExecHandler for ShellHandler {
    async fn handle(&self, user: &str, cmd: &str, flow: &Flow) -> Result<i32> {
        info!(user, cmd, "executing command");

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn command")?;

        let mut stdin = child.stdin.take();
        let mut stdout = child.stdout.take().context("child stdout missing")?;
        let mut stderr = child.stderr.take().context("child stderr missing")?;

        let mut out_buf = [0u8; 4096];
        let mut err_buf = [0u8; 4096];
        let mut out_open = true;
        let mut err_open = true;

        // Pump all three streams until the child closes its output pipes.
        // The stdin arm is dropped between iterations, so a peer that never
        // ends stdin cannot keep a finished command alive.
        while out_open || err_open {
            tokio::select! {
                chunk = flow.read(), if stdin.is_some() => match chunk? {
                    Some(data) => {
                        if let Some(pipe) = stdin.as_mut() {
                            if pipe.write_all(&data).await.is_err() {
                                // Child stopped reading; drop our end.
                                stdin = None;
                            }
                        }
                    }
                    None => {
                        stdin = None;
                    }
                },
                n = stdout.read(&mut out_buf), if out_open => {
                    let n = n.context("reading child stdout")?;
                    if n == 0 {
                        out_open = false;
                    } else {
                        flow.write(&out_buf[..n]).await?;
                    }
                },
                n = stderr.read(&mut err_buf), if err_open => {
                    let n = n.context("reading child stderr")?;
                    if n == 0 {
                        err_open = false;
                    } else {
                        flow.ewrite(&err_buf[..n]).await?;
                    }
                },
            }
        }
        drop(stdin);

        let status = child.wait().await.context("waiting for command")?;
        Ok(status.code().unwrap_or(-1))
    }
}
