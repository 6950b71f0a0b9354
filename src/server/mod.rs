mod connection;
pub mod error;
pub mod handler;
pub mod listener;
pub mod tcp;

pub use error::{ConfigError, ServerError};
pub use handler::{ConnHandler, Connection, ConnectionId, ReqHandler, RespHandler};
pub use listener::NetType;
pub use tcp::{Server, ServerConfig};
