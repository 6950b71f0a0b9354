// src/server/handler.rs
//
// The three pipeline capabilities a protocol plugs into the server:
// bind (per-connection state), read + process (one request), write (one response).
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use uuid::Uuid;

/// Unique identifier attached to every admitted connection's log span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An admitted connection, handed to `ConnHandler::bind`.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    id: ConnectionId,
    buffer_size: Option<usize>,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
        buffer_size: Option<usize>,
    ) -> Self {
        Self {
            stream,
            peer,
            local,
            id: ConnectionId::new(),
            buffer_size,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Buffer size configured on the server, if any.
    pub fn buffer_size_hint(&self) -> Option<usize> {
        self.buffer_size
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Produces the per-connection state. Invoked once, before the first request.
#[async_trait]
pub trait ConnHandler: Send + Sync + 'static {
    type State: Send + 'static;

    async fn bind(&self, conn: Connection) -> io::Result<Self::State>;
}

/// Reads and processes one request unit at a time.
#[async_trait]
pub trait ReqHandler<S: Send>: Send + Sync + 'static {
    type Request: Send;
    type Response: Send;

    /// `Ok(None)` signals end-of-stream and ends the connection cleanly.
    async fn read(&self, state: &mut S) -> io::Result<Option<Self::Request>>;

    async fn process(&self, request: Self::Request) -> Self::Response;
}

/// Writes the response for the most recent request.
#[async_trait]
pub trait RespHandler<S: Send, R: Send>: Send + Sync + 'static {
    async fn write(&self, state: &mut S, response: R) -> io::Result<()>;
}
