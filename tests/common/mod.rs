//! Line-oriented handlers and client helpers shared by the integration tests.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tcp_server_core::{ConnHandler, Connection, ReqHandler, RespHandler, ServerConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub const ACK: &str = "GOT IT\n";

pub struct LineConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Counts how many connections reached the bind stage.
#[derive(Clone, Default)]
pub struct AckConnHandler {
    pub binds: Arc<AtomicUsize>,
}

impl AckConnHandler {
    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }
}

pub struct AckReqHandler;
pub struct AckRespHandler;

#[async_trait]
impl ConnHandler for AckConnHandler {
    type State = LineConn;

    async fn bind(&self, conn: Connection) -> io::Result<LineConn> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        let (read, write) = conn.into_stream().into_split();
        Ok(LineConn {
            reader: BufReader::new(read),
            writer: write,
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

    async fn process(&self, _request: String) -> &'static str {
        ACK
    }
}

#[async_trait]
impl RespHandler<LineConn, &'static str> for AckRespHandler {
    async fn write(&self, state: &mut LineConn, response: &'static str) -> io::Result<()> {
        state.writer.write_all(response.as_bytes()).await
    }
}

pub type AckConfig = ServerConfig<AckConnHandler, AckReqHandler, AckRespHandler>;

pub fn ack_config(conn: AckConnHandler) -> AckConfig {
    ServerConfig::new("tcp4", "127.0.0.1:0", conn, AckReqHandler, AckRespHandler)
}

/// A connected client with line-buffered reads.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let (read, write) = TcpStream::connect(addr).await?.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    pub async fn send_line(&mut self, line: &str) -> io::Result<String> {
        self.writer.write_all(line.as_bytes()).await?;
        let mut response = String::new();
        let n = self.reader.read_line(&mut response).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"));
        }
        Ok(response)
    }

    /// True if the server closed the connection without sending anything.
    pub async fn was_rejected(mut self) -> bool {
        // Writes may race the server-side close; only the read matters.
        let _ = self.writer.write_all(b"Hello\n").await;
        let mut response = String::new();
        let read = tokio::time::timeout(
            Duration::from_secs(2),
            self.reader.read_line(&mut response),
        )
        .await;
        matches!(read, Ok(Ok(0)) | Ok(Err(_)))
    }
}

pub async fn round_trip(addr: SocketAddr) -> io::Result<String> {
    Client::connect(addr).await?.send_line("Hello\n").await
}
