//! Unix-domain socket intake for wrapper scripts.
//!
//! Each connection carries exactly one JSON [`ExecutionRecord`]. The record is
//! decoded as soon as it is complete, so a client does not have to shut down
//! its write half. Reads are bounded by [`READ_TIMEOUT`] and [`MAX_PAYLOAD`].
//! A bad connection is logged and dropped without affecting the others.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::ExecutionRecord;
use crate::queue::EventQueue;

pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_PAYLOAD: usize = 1024 * 1024;

pub struct SocketListener {
    path: PathBuf,
    listener: UnixListener,
}

impl SocketListener {
    /// Bind `path`, replacing a stale socket file. Fails when another
    /// process is still accepting on it.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                bail!("another process is listening on {}", path.display());
            }
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket: {}", path.display()))?;
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory: {}", parent.display()))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind socket: {}", path.display()))?;
        info!(path = %path.display(), "socket listener bound");
        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` fires, then wait for in-flight
    /// connections and remove the socket file.
    pub async fn run(self, queue: EventQueue, shutdown: CancellationToken) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        connections.spawn(handle_connection(stream, queue.clone()));
                    }
                    Err(e) => warn!(error = %e, "socket accept failed"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "socket connection task failed");
                    }
                }
            }
        }

        while connections.join_next().await.is_some() {}
        drop(self.listener);
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove socket file");
            }
        }
        info!("socket listener stopped");
    }
}

async fn handle_connection(mut stream: UnixStream, queue: EventQueue) {
    let record = match tokio::time::timeout(READ_TIMEOUT, read_record(&mut stream)).await {
        Ok(Ok(record)) => record,
        Ok(Err(e)) => {
            warn!(error = %e, "rejected socket payload");
            return;
        }
        Err(_) => {
            warn!(timeout = ?READ_TIMEOUT, "socket client sent no complete record in time");
            return;
        }
    };

    if let Err(reason) = record.validate() {
        warn!(%reason, "rejected socket payload");
        return;
    }

    debug!(tool = %record.tool, command = %record.command, "record received on socket");
    // Drops are counted and logged by the queue.
    let _ = queue.submit(record).await;
}

/// Read until one complete JSON record has arrived.
async fn read_record(stream: &mut UnixStream) -> Result<ExecutionRecord> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 8192];

    loop {
        let n = stream.read(&mut chunk).await.context("socket read failed")?;
        if n == 0 {
            if buf.iter().all(u8::is_ascii_whitespace) {
                bail!("connection closed without a record");
            }
            return serde_json::from_slice(&buf).context("malformed execution record");
        }

        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_PAYLOAD {
            bail!("payload exceeds {MAX_PAYLOAD} bytes");
        }

        let mut records = serde_json::Deserializer::from_slice(&buf).into_iter::<ExecutionRecord>();
        match records.next() {
            Some(Ok(record)) => return Ok(record),
            Some(Err(e)) if e.is_eof() => continue,
            Some(Err(e)) => return Err(e).context("malformed execution record"),
            None => continue,
        }
    }
}
