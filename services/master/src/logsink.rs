//! Log-collection endpoint for machine agents.
//!
//! Every machine streams structured log records to the master's side
//! out-of-band from the capability-RPC mesh. The sink's address is
//! established before any machine is told to run and stays valid for the
//! owning driver's lifetime. Record *formatting* policy is not decided
//! here; records are re-emitted through tracing under the sending
//! machine's name.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One log record as streamed by a machine agent: newline-delimited JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Canonical name of the sending machine.
    pub machine: String,
    /// The log line itself.
    pub line: String,
}

/// TCP endpoint collecting log records from machine agents.
pub struct LogSink {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl LogSink {
    /// Binds the sink. Port 0 picks an ephemeral port; the resulting
    /// address is fixed for the sink's lifetime.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        Self::bind_inner(addr, None).await
    }

    /// Binds the sink and additionally forwards every record to `tx`.
    pub async fn bind_with_capture(
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<LogRecord>,
    ) -> std::io::Result<Self> {
        Self::bind_inner(addr, Some(tx)).await
    }

    async fn bind_inner(
        addr: SocketAddr,
        capture: Option<mpsc::UnboundedSender<LogRecord>>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let task = tokio::spawn(accept_loop(listener, capture));
        Ok(Self { local_addr, task })
    }

    /// The address machines stream records to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, capture: Option<mpsc::UnboundedSender<LogRecord>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let capture = capture.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(stream, capture).await {
                        warn!(error = %e, peer = %peer, "Log stream failed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Log sink accept failed");
            }
        }
    }
}

async fn handle_stream(
    stream: TcpStream,
    capture: Option<mpsc::UnboundedSender<LogRecord>>,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(&line) {
            Ok(record) => {
                info!(machine = %record.machine, "{}", record.line);
                if let Some(tx) = &capture {
                    let _ = tx.send(record);
                }
            }
            Err(e) => {
                warn!(error = %e, "Unparseable log record");
            }
        }
    }
    Ok(())
}
