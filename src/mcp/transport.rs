//! Line-oriented transports for JSON-RPC messages

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc};

use crate::{Error, Result};

/// Bidirectional message pipe to a protocol server
///
/// Sending and receiving may happen concurrently from different tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one serialized message
    async fn send(&self, message: String) -> Result<()>;

    /// Receive the next serialized message, `None` once the peer is gone
    async fn recv(&self) -> Result<Option<String>>;
}

/// Newline-delimited JSON over a child process's stdin/stdout
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<Lines<BufReader<ChildStdout>>>,
    _child: Child,
}

impl StdioTransport {
    /// Spawn `command` with piped stdio; stderr is inherited
    ///
    /// The child is killed when the transport is dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the process cannot be spawned
    pub fn spawn(command: &str, args: &[String], env: &BTreeMap<String, String>) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Protocol(format!("failed to spawn {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Protocol("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Protocol("child stdout unavailable".to_string()))?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout).lines()),
            _child: child,
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: String) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<String>> {
        let mut stdout = self.stdout.lock().await;
        loop {
            match stdout.next_line().await? {
                Some(line) if line.trim().is_empty() => {}
                other => return Ok(other),
            }
        }
    }
}

/// In-process transport backed by channels
///
/// Created in connected pairs; used to host protocol servers inside the
/// process and in tests.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl ChannelTransport {
    /// Two connected ends
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: String) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::Protocol("peer closed".to_string()))
    }

    async fn recv(&self) -> Result<Option<String>> {
        Ok(self.rx.lock().await.recv().await)
    }
}
