// src/lib.rs
pub mod admission;
pub mod config;
pub mod metrics;
pub mod server;

pub use admission::{RateLimit, RateLimiter};
pub use server::{
    ConfigError, ConnHandler, Connection, ConnectionId, NetType, ReqHandler, RespHandler, Server,
    ServerConfig, ServerError,
};
