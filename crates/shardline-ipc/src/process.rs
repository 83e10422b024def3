//! Process transport: a forked child with NDJSON frames over its pipes.
//!
//! The child is owned by a background task that multiplexes `wait()`
//! against a kill signal, so the exit notice is delivered exactly once
//! no matter which side terminates first. `send` resolves once the
//! frame is flushed into the pipe; it does not confirm delivery to peer
//! code.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn};

use shardline_core::config::SpawnOptions;
use shardline_core::error::{FabricError, FabricResult};

use crate::transport::{ChildLink, ExitNotice, LinkEvents, ParentLink};

const FRAME_BUFFER: usize = 64;

/// Manager end of a process child.
pub struct ProcessLink {
    stdin: Mutex<ChildStdin>,
    kill: watch::Sender<bool>,
}

impl ProcessLink {
    /// Fork `file` with the bootstrap environment and spawn options.
    ///
    /// Must be called from within a tokio runtime; the reader and
    /// supervisor tasks attach to it.
    pub fn spawn(
        file: &std::path::Path,
        bootstrap_env: &[(String, String)],
        options: &SpawnOptions,
    ) -> FabricResult<(Arc<Self>, LinkEvents)> {
        let program = options
            .exec_path
            .clone()
            .unwrap_or_else(|| file.to_path_buf());

        let mut command = Command::new(&program);
        command.args(&options.args);

        match &options.cluster_data {
            Some(data) => {
                command.envs(data);
            }
            None => {
                command.envs(bootstrap_env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                command.envs(&options.env);
            }
        }

        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            if let Some(uid) = options.uid {
                command.uid(uid);
            }
            if let Some(gid) = options.gid {
                command.gid(gid);
            }
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if options.silent {
                Stdio::null()
            } else {
                Stdio::inherit()
            })
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| FabricError::Send(format!("spawn {}: {e}", program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FabricError::Send("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FabricError::Send("child stdout unavailable".to_string()))?;

        let (frame_tx, frames) = mpsc::channel(FRAME_BUFFER);
        let (exit_tx, exit) = oneshot::channel();
        let (kill_tx, kill_rx) = watch::channel(false);

        tokio::spawn(read_frames(stdout, frame_tx));
        tokio::spawn(supervise(child, exit_tx, kill_rx));

        let link = Arc::new(Self {
            stdin: Mutex::new(stdin),
            kill: kill_tx,
        });
        Ok((link, LinkEvents { frames, exit }))
    }
}

#[async_trait]
impl ChildLink for ProcessLink {
    async fn send(&self, frame: Value) -> FabricResult<()> {
        let mut line =
            serde_json::to_vec(&frame).map_err(|e| FabricError::Send(e.to_string()))?;
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&line)
            .await
            .map_err(|e| FabricError::Send(format!("pipe write: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| FabricError::Send(format!("pipe flush: {e}")))
    }

    fn kill(&self) {
        let _ = self.kill.send(true);
    }
}

/// Parse newline-delimited frames off a reader into the frame channel.
async fn read_frames<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<Value>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "discarding malformed frame");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "frame reader stopped");
                break;
            }
        }
    }
}

/// Own the child: wait for it, or kill it when signalled, then emit the
/// exit notice.
async fn supervise(
    mut child: Child,
    exit_tx: oneshot::Sender<ExitNotice>,
    mut kill_rx: watch::Receiver<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = kill_rx.changed() => {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "kill signal on already-dead child");
            }
            child.wait().await.ok()
        }
    };
    let _ = exit_tx.send(ExitNotice {
        code: status.and_then(|s| s.code()),
        message: None,
    });
}

/// Child end of a process link: the process's own stdio.
pub struct StdioParent {
    out: Mutex<tokio::io::Stdout>,
}

impl StdioParent {
    /// Attach to this process's stdin/stdout. Inbound frames arrive on
    /// the returned receiver.
    pub fn attach() -> (Arc<Self>, mpsc::Receiver<Value>) {
        let (frame_tx, frames) = mpsc::channel(FRAME_BUFFER);
        tokio::spawn(read_frames(tokio::io::stdin(), frame_tx));
        let parent = Arc::new(Self {
            out: Mutex::new(tokio::io::stdout()),
        });
        (parent, frames)
    }
}

#[async_trait]
impl ParentLink for StdioParent {
    async fn send(&self, frame: Value) -> FabricResult<()> {
        let mut line =
            serde_json::to_vec(&frame).map_err(|e| FabricError::Send(e.to_string()))?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line)
            .await
            .map_err(|e| FabricError::Send(format!("stdout write: {e}")))?;
        out.flush()
            .await
            .map_err(|e| FabricError::Send(format!("stdout flush: {e}")))
    }
}
