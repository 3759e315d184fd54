//! Ingestion Core.
//!
//! One [`Daemon`] owns every shared resource: the storage handle, the parser
//! registry, the event queue, and the cancellation token that all tasks
//! watch. Nothing is global; tests run several daemons in one process.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──start()──▶ Running ──stop()──▶ Stopping ──▶ Stopped
//! ```
//!
//! `start()` writes the PID file, spawns the consumer, starts the parsers,
//! binds the socket and (optionally) the HTTP API, and installs signal
//! handlers. `stop()` reverses that in dependency order: producers first,
//! then the queue, then the consumer, then the final flush. Stopping twice
//! is a no-op.
//!
//! # Tasks
//!
//! | Task | Ends when |
//! |------|-----------|
//! | consumer | drain token fires and the buffered records are written |
//! | socket accept loop | shutdown token fires and open connections finish |
//! | HTTP server | graceful shutdown completes or the grace period expires |
//! | signal handler | SIGINT/SIGTERM arrives or shutdown token fires |
//! | housekeeping | shutdown token fires |

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::models::ExecutionRecord;
use crate::parsers::ParserRegistry;
use crate::pidfile;
use crate::queue::EventQueue;
use crate::server::{self, AppState};
use crate::socket::SocketListener;
use crate::storage::JsonStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Created,
    Running,
    Stopping,
    Stopped,
}

pub struct Daemon {
    config: Config,
    store: Arc<JsonStore>,
    registry: Arc<ParserRegistry>,
    state: DaemonState,
    shutdown: CancellationToken,
    drain: CancellationToken,
    queue: Option<EventQueue>,
    consumer: Option<JoinHandle<()>>,
    http: Option<HttpServer>,
    tasks: Vec<JoinHandle<()>>,
    started_at: Instant,
}

struct HttpServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Daemon {
    /// Open storage and build the registry from `config`.
    ///
    /// A storage document that cannot be loaded is fatal: the daemon refuses
    /// to run against undefined state.
    pub fn new(config: Config) -> Result<Self> {
        let registry = ParserRegistry::from_config(&config);
        Self::with_registry(config, registry)
    }

    /// Like [`Daemon::new`] with a caller-built registry.
    pub fn with_registry(config: Config, registry: ParserRegistry) -> Result<Self> {
        config.ensure_directories()?;
        let store = JsonStore::open(&config.storage.json_file).with_context(|| {
            format!(
                "Failed to open storage: {}",
                config.storage.json_file.display()
            )
        })?;

        Ok(Self {
            config,
            store: Arc::new(store),
            registry: Arc::new(registry),
            state: DaemonState::Created,
            shutdown: CancellationToken::new(),
            drain: CancellationToken::new(),
            queue: None,
            consumer: None,
            http: None,
            tasks: Vec::new(),
            started_at: Instant::now(),
        })
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn store(&self) -> &Arc<JsonStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ParserRegistry> {
        &self.registry
    }

    /// Cancelling this token asks a running daemon to stop; see [`Daemon::run`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Address the HTTP API is bound to, once started. Useful with `port = 0`.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().map(|http| http.addr)
    }

    /// Producer handle for the running daemon's queue.
    pub fn queue(&self) -> Option<EventQueue> {
        self.queue.clone()
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.state != DaemonState::Created {
            bail!("daemon cannot start from state {:?}", self.state);
        }

        let backup_every = self.config.backup_interval()?;
        let pid_file = self.config.daemon.pid_file.clone();
        if let Some(pid) = pidfile::running_pid(&pid_file)? {
            bail!("daemon already running with PID {pid}");
        }
        pidfile::write(&pid_file)?;
        debug!(path = %pid_file.display(), "PID file written");

        self.started_at = Instant::now();
        let (queue, rx) = EventQueue::channel();
        self.consumer = Some(tokio::spawn(consume(
            rx,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.drain.clone(),
        )));
        self.queue = Some(queue.clone());
        self.state = DaemonState::Running;

        self.registry.start_all(&self.shutdown, &queue);
        info!(active = self.registry.active_count(), "monitors started");

        match SocketListener::bind(&self.config.daemon.socket_path) {
            Ok(listener) => {
                self.tasks
                    .push(tokio::spawn(listener.run(queue.clone(), self.shutdown.clone())));
            }
            Err(e) => error!(error = %e, "socket listener unavailable, continuing without it"),
        }

        if self.config.api.enabled {
            if let Err(e) = self.start_http(queue.clone()).await {
                self.stop().await;
                return Err(e);
            }
        }

        self.tasks.push(tokio::spawn(watch_signals(self.shutdown.clone())));

        if self.config.storage.backup_enabled {
            self.tasks.push(tokio::spawn(housekeeping(
                Arc::clone(&self.store),
                backup_every,
                self.shutdown.clone(),
            )));
        }

        info!(
            pid = std::process::id(),
            socket = %self.config.daemon.socket_path.display(),
            http = ?self.http_addr(),
            "daemon started"
        );
        Ok(())
    }

    async fn start_http(&mut self, queue: EventQueue) -> Result<()> {
        let bind = format!("{}:{}", self.config.api.host, self.config.api.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind HTTP API on {bind}"))?;
        let addr = listener
            .local_addr()
            .context("Failed to read HTTP API address")?;

        let state = AppState {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            queue,
            started_at: self.started_at,
        };
        let app = server::router(state, self.config.api.cors_enabled);
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
            if let Err(e) = served {
                error!(error = %e, "HTTP API failed");
            }
        });

        info!(%addr, "HTTP API listening");
        self.http = Some(HttpServer { addr, handle });
        Ok(())
    }

    /// Start, wait for a shutdown request (signal or token), then stop.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.shutdown.cancelled().await;
        self.stop().await;
        Ok(())
    }

    /// Stop everything started by [`Daemon::start`]. Failures are logged and
    /// shutdown always runs to completion.
    pub async fn stop(&mut self) {
        match self.state {
            DaemonState::Stopping | DaemonState::Stopped => return,
            DaemonState::Created => {
                self.state = DaemonState::Stopped;
                return;
            }
            DaemonState::Running => self.state = DaemonState::Stopping,
        }
        info!("daemon stopping");

        self.shutdown.cancel();
        self.registry.stop_all();

        if let Some(HttpServer { mut handle, .. }) = self.http.take() {
            let grace = self.config.shutdown_grace();
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(?grace, "HTTP API did not shut down in time, aborting");
                handle.abort();
            }
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "daemon task ended abnormally");
            }
        }

        // All producers are gone; let the consumer write what is buffered.
        self.queue = None;
        self.drain.cancel();
        if let Some(consumer) = self.consumer.take() {
            if let Err(e) = consumer.await {
                warn!(error = %e, "consumer task ended abnormally");
            }
        }

        let store = Arc::clone(&self.store);
        let flushed = tokio::task::spawn_blocking(move || {
            store.recompute_most_active_day()?;
            store.close()
        })
        .await;
        match flushed {
            Ok(Ok(())) => debug!("storage flushed"),
            Ok(Err(e)) => error!(error = %e, "final storage flush failed"),
            Err(e) => error!(error = %e, "final storage flush panicked"),
        }

        if let Err(e) = pidfile::remove(&self.config.daemon.pid_file) {
            warn!(error = %e, "failed to remove PID file");
        }

        self.state = DaemonState::Stopped;
        info!("daemon stopped");
    }
}

/// The only writer: enriches each record and appends it to storage.
async fn consume(
    mut rx: mpsc::Receiver<ExecutionRecord>,
    store: Arc<JsonStore>,
    registry: Arc<ParserRegistry>,
    drain: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = drain.cancelled() => break,
            record = rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        persist(record, &store, &registry).await;
    }

    rx.close();
    let mut drained = 0usize;
    while let Some(record) = rx.recv().await {
        persist(record, &store, &registry).await;
        drained += 1;
    }
    debug!(drained, "consumer stopped");
}

async fn persist(record: ExecutionRecord, store: &Arc<JsonStore>, registry: &Arc<ParserRegistry>) {
    let record = registry.enrich(record);
    let tool = record.tool.clone();
    let store = Arc::clone(store);

    match tokio::task::spawn_blocking(move || store.append(record)).await {
        Ok(Ok(id)) => debug!(%id, %tool, "execution stored"),
        Ok(Err(e)) => error!(%tool, error = %e, "failed to store execution"),
        Err(e) => error!(%tool, error = %e, "storage task panicked"),
    }
}

async fn watch_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler");
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down");
                    shutdown.cancel();
                }
            }
            return;
        }
    };

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
            shutdown.cancel();
        }
        _ = terminate.recv() => {
            info!("received SIGTERM, shutting down");
            shutdown.cancel();
        }
    }
}

/// Periodic backups while the daemon runs. The first backup is taken one
/// interval after start.
async fn housekeeping(store: Arc<JsonStore>, every: std::time::Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || store.backup()).await {
                    Ok(Ok(path)) => info!(path = %path.display(), "scheduled backup written"),
                    Ok(Err(e)) => warn!(error = %e, "scheduled backup failed"),
                    Err(e) => warn!(error = %e, "scheduled backup panicked"),
                }
            }
        }
    }
}
