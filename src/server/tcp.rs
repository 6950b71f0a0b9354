// ────────────────────────────────
// src/server/tcp.rs
// Listener lifecycle: start/stop, accept loop, admission and task spawning.
// ────────────────────────────────
use super::connection::{ConnectionTracker, Pipeline};
use super::error::{ConfigError, ServerError};
use super::handler::{ConnHandler, Connection, ReqHandler, RespHandler};
use super::listener::{bind_tcp, Acceptor, BindTarget, NetType, DEFAULT_BACKLOG};
use crate::admission::{AdmissionController, RateLimit};
use crate::metrics::MetricsCollector;
use arc_swap::ArcSwapOption;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Construction parameters for a [`Server`].
pub struct ServerConfig<C, Q, R> {
    /// "tcp", "tcp4" or "tcp6".
    pub net_type: String,
    /// "host:port"; port 0 lets the OS pick.
    pub addr: String,
    pub conn_handler: C,
    pub req_handler: Q,
    pub resp_handler: R,
    pub rate_limit: Option<RateLimit>,
    pub buffer_size: Option<usize>,
    pub backlog: Option<u32>,
    pub sweep_interval: Option<Duration>,
    pub metrics: Option<Arc<MetricsCollector>>,
}

impl<C, Q, R> ServerConfig<C, Q, R> {
    pub fn new(
        net_type: impl Into<String>,
        addr: impl Into<String>,
        conn_handler: C,
        req_handler: Q,
        resp_handler: R,
    ) -> Self {
        Self {
            net_type: net_type.into(),
            addr: addr.into(),
            conn_handler,
            req_handler,
            resp_handler,
            rate_limit: None,
            buffer_size: None,
            backlog: None,
            sweep_interval: None,
            metrics: None,
        }
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

enum Lifecycle {
    Idle,
    Listening(Running),
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    sweeper: Option<JoinHandle<()>>,
}

/// A TCP listener that drives every admitted connection through the
/// configured handler pipeline on its own task.
pub struct Server<C, Q, R> {
    name: String,
    target: BindTarget,
    backlog: u32,
    buffer_size: Option<usize>,
    sweep_interval: Duration,
    pipeline: Arc<Pipeline<C, Q, R>>,
    admission: Arc<AdmissionController>,
    tracker: ConnectionTracker,
    metrics: Option<Arc<MetricsCollector>>,
    bound: ArcSwapOption<SocketAddr>,
    lifecycle: Mutex<Lifecycle>,
}

impl<C, Q, R> Server<C, Q, R>
where
    C: ConnHandler,
    Q: ReqHandler<C::State>,
    R: RespHandler<C::State, Q::Response>,
{
    /// Validate the configuration. No socket is opened until `start`.
    pub fn new(name: impl Into<String>, config: ServerConfig<C, Q, R>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }

        let net_type: NetType = config.net_type.parse()?;
        let target = BindTarget::parse(net_type, &config.addr)?;

        if config.buffer_size == Some(0) {
            return Err(ConfigError::Zero("buffer_size"));
        }
        if config.backlog == Some(0) {
            return Err(ConfigError::Zero("backlog"));
        }
        if config.sweep_interval == Some(Duration::ZERO) {
            return Err(ConfigError::Zero("sweep_interval"));
        }
        if config.rate_limit.as_ref().and_then(|policy| policy.retention()) == Some(Duration::ZERO) {
            return Err(ConfigError::Zero("rate_limit retention"));
        }

        Ok(Self {
            name,
            target,
            backlog: config.backlog.unwrap_or(DEFAULT_BACKLOG),
            buffer_size: config.buffer_size,
            sweep_interval: config.sweep_interval.unwrap_or(DEFAULT_SWEEP_INTERVAL),
            pipeline: Arc::new(Pipeline {
                conn: config.conn_handler,
                req: config.req_handler,
                resp: config.resp_handler,
            }),
            admission: Arc::new(AdmissionController::new(config.rate_limit)),
            tracker: ConnectionTracker::new(),
            metrics: config.metrics,
            bound: ArcSwapOption::empty(),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Bind the listening socket and spawn the accept loop.
    ///
    /// Returns once the socket is open; valid from the created or stopped state.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Listening(_)) {
            return Err(ServerError::AlreadyListening);
        }

        let addr = self.target.resolve().await?;
        let listener = bind_tcp(addr, self.target.net_type(), self.backlog)?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_loop = AcceptLoop {
            name: self.name.clone(),
            listener,
            local_addr,
            buffer_size: self.buffer_size,
            pipeline: Arc::clone(&self.pipeline),
            admission: Arc::clone(&self.admission),
            tracker: self.tracker.clone(),
            metrics: self.metrics.clone(),
            backoff_min: ACCEPT_BACKOFF_MIN,
            backoff_max: ACCEPT_BACKOFF_MAX,
        };
        let accept_task = tokio::spawn(accept_loop.run(shutdown_rx.clone()));

        let retains = self
            .admission
            .rate_limiter()
            .and_then(|limiter| limiter.policy().retention())
            .is_some();
        let sweeper = retains.then(|| {
            tokio::spawn(sweep_rate_limiter(
                Arc::clone(&self.admission),
                self.sweep_interval,
                self.metrics.clone(),
                shutdown_rx,
            ))
        });

        self.bound.store(Some(Arc::new(local_addr)));
        *lifecycle = Lifecycle::Listening(Running {
            shutdown_tx,
            accept_task,
            sweeper,
        });

        info!(
            server = %self.name,
            net_type = %self.target.net_type(),
            addr = %local_addr,
            "listening"
        );
        Ok(())
    }

    /// Close the listening socket and wait for the accept loop to exit.
    ///
    /// Connections already admitted keep running. Calling this when the
    /// server is not listening is a no-op.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let running = match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
            Lifecycle::Listening(running) => running,
            Lifecycle::Idle => return Ok(()),
        };

        self.bound.store(None);
        let _ = running.shutdown_tx.send(true);

        if let Some(sweeper) = running.sweeper {
            sweeper.abort();
        }
        running.accept_task.await?;

        info!(
            server = %self.name,
            in_flight = self.tracker.active_count(),
            "stopped listening"
        );
        Ok(())
    }

    /// The bound address while listening, with any OS-assigned port resolved.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.bound.load().as_deref().copied()
    }

    pub fn is_listening(&self) -> bool {
        self.bound.load().is_some()
    }

    /// Toggle unconditional rejection of newly accepted connections.
    pub fn drop_connections(&self, enabled: bool) {
        self.admission.set_drop_all(enabled);
        info!(server = %self.name, enabled, "drop connections toggled");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.active_count()
    }

    /// Wait for every in-flight connection to finish.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.tracker.wait_idle())
            .await
            .is_ok()
    }

    /// Number of remote hosts currently tracked by the rate limiter.
    pub fn rate_limited_hosts(&self) -> usize {
        self.admission
            .rate_limiter()
            .map(|limiter| limiter.tracked_hosts())
            .unwrap_or(0)
    }
}

struct AcceptLoop<A, C, Q, R> {
    name: String,
    listener: A,
    local_addr: SocketAddr,
    buffer_size: Option<usize>,
    pipeline: Arc<Pipeline<C, Q, R>>,
    admission: Arc<AdmissionController>,
    tracker: ConnectionTracker,
    metrics: Option<Arc<MetricsCollector>>,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl<A, C, Q, R> AcceptLoop<A, C, Q, R>
where
    A: Acceptor,
    C: ConnHandler,
    Q: ReqHandler<C::State>,
    R: RespHandler<C::State, Q::Response>,
{
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = self.backoff_min;

        loop {
            tokio::select! {
                biased;
                // Also fires if the server is dropped without `stop`.
                _ = shutdown_rx.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        backoff = self.backoff_min;
                        self.dispatch(stream, peer);
                    }
                    Err(e) => {
                        warn!(server = %self.name, error = %e, retry_in = ?backoff, "accept failed");
                        if let Some(metrics) = &self.metrics {
                            metrics.record_accept_error();
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown_rx.changed() => break,
                        }
                        backoff = (backoff * 2).min(self.backoff_max);
                    }
                },
            }
        }

        debug!(server = %self.name, addr = %self.local_addr, "accept loop exited");
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let decision = self.admission.decide(peer);
        if !decision.is_admitted() {
            debug!(server = %self.name, %peer, reason = decision.reason(), "connection rejected");
            if let Some(metrics) = &self.metrics {
                metrics.record_rejected(decision.reason());
            }
            drop(stream);
            return;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_accepted();
        }

        let conn = Connection::new(stream, peer, self.local_addr, self.buffer_size);
        let span = info_span!("connection", server = %self.name, id = %conn.id(), %peer);
        let guard = self.tracker.track(self.metrics.clone());
        let pipeline = Arc::clone(&self.pipeline);
        let metrics = self.metrics.clone();

        tokio::spawn(
            async move {
                let _guard = guard;
                debug!("connection admitted");
                pipeline.drive(conn, metrics.as_deref()).await;
            }
            .instrument(span),
        );
    }
}

async fn sweep_rate_limiter(
    admission: Arc<AdmissionController>,
    every: Duration,
    metrics: Option<Arc<MetricsCollector>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Some(limiter) = admission.rate_limiter() {
                    let evicted = limiter.sweep();
                    if evicted > 0 {
                        debug!(evicted, remaining = limiter.tracked_hosts(), "rate limiter swept");
                    }
                    if let Some(metrics) = &metrics {
                        metrics.update_rate_limiter_entries(limiter.tracked_hosts());
                    }
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}
