// src/main.rs
//
// Acknowledgement server: replies "GOT IT" to every line it receives.
use anyhow::Result;
use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Request, Response, StatusCode};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::signal;
use tracing::{error, info, warn};

use tcp_server_core::{
    config::{self, Config},
    metrics::MetricsRegistry,
    ConnHandler, Connection, RateLimit, ReqHandler, RespHandler, Server, ServerConfig,
};

const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct LineConn {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

struct AckConnHandler;
struct AckReqHandler;
struct AckRespHandler;

#[async_trait]
impl ConnHandler for AckConnHandler {
    type State = LineConn;

    async fn bind(&self, conn: Connection) -> io::Result<LineConn> {
        let capacity = conn.buffer_size_hint().unwrap_or(DEFAULT_BUFFER_SIZE);
        let stream = conn.into_stream();
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(LineConn {
            reader: BufReader::with_capacity(capacity, read),
            writer: BufWriter::with_capacity(capacity, write),
        })
    }
}

#[async_trait]
impl ReqHandler<LineConn> for AckReqHandler {
    type Request = String;
    type Response = &'static str;

    async fn read(&self, state: &mut LineConn) -> io::Result<Option<String>> {
        let mut line = String::new();
        match state.reader.read_line(&mut line).await? {
            0 => Ok(None),
            _ => Ok(Some(line)),
        }
    }

    async fn process(&self, request: String) -> &'static str {
        tracing::trace!(bytes = request.len(), "ack");
        "GOT IT\n"
    }
}

#[async_trait]
impl RespHandler<LineConn, &'static str> for AckRespHandler {
    async fn write(&self, state: &mut LineConn, response: &'static str) -> io::Result<()> {
        state.writer.write_all(response.as_bytes()).await?;
        state.writer.flush().await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tcp_server_core=info".parse()?)
                .add_directive("tcp_ack_server=info".parse()?),
        )
        .init();
    
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    
    info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).await?;
    
    // Initialize metrics
    let metrics_registry = MetricsRegistry::new()?;
    let metrics = metrics_registry.collector();
    
    if config.metrics.enabled {
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_metrics_server(metrics_addr, metrics_registry, config.metrics.path.clone());
    }
    
    let server = build_server(&config, metrics)?;
    server.drop_connections(config.server.drop_connections);
    server.start().await?;
    
    shutdown_signal().await;
    
    server.stop().await?;
    if !server.wait_for_drain(DRAIN_TIMEOUT).await {
        warn!(
            remaining = server.active_connections(),
            "connections still open after drain timeout"
        );
    }
    
    Ok(())
}

fn build_server(
    config: &Config,
    metrics: Arc<tcp_server_core::metrics::MetricsCollector>,
) -> Result<Server<AckConnHandler, AckReqHandler, AckRespHandler>> {
    let settings = &config.server;
    let mut server_config = ServerConfig::new(
        settings.net_type.clone(),
        settings.addr.clone(),
        AckConnHandler,
        AckReqHandler,
        AckRespHandler,
    )
    .with_metrics(metrics);
    
    if let Some(window) = settings.rate_limit() {
        let mut policy = RateLimit::fixed(window);
        if let Some(retention) = settings.rate_limit_retention() {
            policy = policy.with_retention(retention);
        }
        server_config = server_config.with_rate_limit(policy);
    }
    if let Some(buffer_size) = settings.buffer_size {
        server_config = server_config.with_buffer_size(buffer_size);
    }
    if let Some(backlog) = settings.backlog {
        server_config = server_config.with_backlog(backlog);
    }
    if let Some(interval) = settings.sweep_interval() {
        server_config = server_config.with_sweep_interval(interval);
    }
    
    Ok(Server::new(settings.name.clone(), server_config)?)
}

fn start_metrics_server(addr: SocketAddr, registry: MetricsRegistry, path: String) {
    let registry = Arc::new(registry);
    let metrics_path = Arc::new(path);
    let service_path = metrics_path.clone();

    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = registry.clone();
        let path = service_path.clone();

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                let path = path.clone();

                async move { Ok::<_, Infallible>(metrics_response(&req, &registry, &path)) }
            }))
        }
    });

    info!(
        "Metrics server listening on http://{}{}",
        addr,
        metrics_path.as_str()
    );

    tokio::spawn(async move {
        match hyper::Server::try_bind(&addr) {
            Ok(builder) => {
                if let Err(e) = builder.serve(make_service).await {
                    error!("Metrics server error: {}", e);
                }
            }
            Err(e) => error!("Metrics server failed to bind {}: {}", addr, e),
        }
    });
}

fn metrics_response(req: &Request<Body>, registry: &MetricsRegistry, path: &str) -> Response<Body> {
    if req.uri().path() != path {
        let mut response = Response::new(Body::from("Not Found"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }

    match registry.gather() {
        Ok(metrics) => {
            let mut response = Response::new(Body::from(metrics));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };
    
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    
    info!("Shutdown signal received");
}
