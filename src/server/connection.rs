// src/server/connection.rs
//
// Per-connection loop and in-flight bookkeeping.
use super::handler::{ConnHandler, Connection, ReqHandler, RespHandler};
use crate::metrics::MetricsCollector;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// The three handler capabilities, shared by every connection task.
pub(crate) struct Pipeline<C, Q, R> {
    pub(crate) conn: C,
    pub(crate) req: Q,
    pub(crate) resp: R,
}

/// Why a connection loop stopped.
#[derive(Debug)]
pub(crate) enum ConnectionEnd {
    /// Peer closed the stream between requests.
    Closed,
    Bind(io::Error),
    Read(io::Error),
    Write(io::Error),
}

impl ConnectionEnd {
    fn stage(&self) -> Option<&'static str> {
        match self {
            ConnectionEnd::Closed => None,
            ConnectionEnd::Bind(_) => Some("bind"),
            ConnectionEnd::Read(_) => Some("read"),
            ConnectionEnd::Write(_) => Some("write"),
        }
    }
}

impl<C, Q, R> Pipeline<C, Q, R>
where
    C: ConnHandler,
    Q: ReqHandler<C::State>,
    R: RespHandler<C::State, Q::Response>,
{
    /// Run one connection to completion.
    ///
    /// The socket lives inside the bound state (or the `Connection` if bind
    /// fails), so it is closed on every return path when that value drops.
    pub(crate) async fn drive(
        &self,
        conn: Connection,
        metrics: Option<&MetricsCollector>,
    ) -> ConnectionEnd {
        let mut state = match self.conn.bind(conn).await {
            Ok(state) => state,
            Err(e) => return finish(ConnectionEnd::Bind(e), 0, metrics),
        };

        let mut served: u64 = 0;
        loop {
            let request = match self.req.read(&mut state).await {
                Ok(Some(request)) => request,
                Ok(None) => return finish(ConnectionEnd::Closed, served, metrics),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return finish(ConnectionEnd::Closed, served, metrics)
                }
                Err(e) => return finish(ConnectionEnd::Read(e), served, metrics),
            };
            trace!(request = served + 1, "request read");

            let response = self.req.process(request).await;

            if let Err(e) = self.resp.write(&mut state, response).await {
                return finish(ConnectionEnd::Write(e), served, metrics);
            }

            served += 1;
            if let Some(metrics) = metrics {
                metrics.record_request();
            }
        }
    }
}

fn finish(end: ConnectionEnd, served: u64, metrics: Option<&MetricsCollector>) -> ConnectionEnd {
    match &end {
        ConnectionEnd::Closed => debug!(served, "connection closed by peer"),
        ConnectionEnd::Bind(e) | ConnectionEnd::Read(e) | ConnectionEnd::Write(e) => {
            debug!(served, stage = end.stage(), error = %e, "connection ended with error")
        }
    }
    if let (Some(metrics), Some(stage)) = (metrics, end.stage()) {
        metrics.record_connection_error(stage);
    }
    end
}

/// Counts running connection loops and lets callers wait for them to finish.
#[derive(Clone, Default)]
pub(crate) struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    active: AtomicUsize,
    idle: Notify,
}

impl ConnectionTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn track(&self, metrics: Option<Arc<MetricsCollector>>) -> ConnectionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        if let Some(metrics) = &metrics {
            metrics.increment_active_connections();
        }
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
            metrics,
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held by a connection task; releases its slot on drop, even on panic.
pub(crate) struct ConnectionGuard {
    inner: Arc<TrackerInner>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics.decrement_active_connections();
        }
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
