// ────────────────────────────────
// src/server/listener.rs
// Network-type aware address resolution and socket binding.
// ────────────────────────────────
use super::error::{ConfigError, ServerError};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use tokio::net::{TcpListener, TcpStream};

pub const DEFAULT_BACKLOG: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetType {
    /// Either family. An empty host binds the IPv4 wildcard `0.0.0.0`,
    /// not a dual-stack socket; use `[::]` explicitly for dual-stack.
    Tcp,
    Tcp4,
    /// IPv6 only; IPv4-mapped clients are refused on `[::]`.
    Tcp6,
}

impl NetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetType::Tcp => "tcp",
            NetType::Tcp4 => "tcp4",
            NetType::Tcp6 => "tcp6",
        }
    }

    pub fn accepts(&self, ip: &IpAddr) -> bool {
        match self {
            NetType::Tcp => true,
            NetType::Tcp4 => ip.is_ipv4(),
            NetType::Tcp6 => ip.is_ipv6(),
        }
    }

    fn wildcard(&self) -> IpAddr {
        match self {
            NetType::Tcp | NetType::Tcp4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            NetType::Tcp6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl FromStr for NetType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(NetType::Tcp),
            "tcp4" => Ok(NetType::Tcp4),
            "tcp6" => Ok(NetType::Tcp6),
            other => Err(ConfigError::UnknownNetType(other.to_string())),
        }
    }
}

impl fmt::Display for NetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated `host:port` pair for a given network type.
#[derive(Debug, Clone)]
pub struct BindTarget {
    net_type: NetType,
    host: String,
    port: u16,
}

impl BindTarget {
    pub fn parse(net_type: NetType, addr: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidAddr {
            addr: addr.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        let port: u16 = port.parse().map_err(|_| invalid("port is not a number in 0..=65535"))?;

        let host = match host.strip_prefix('[') {
            Some(rest) => rest
                .strip_suffix(']')
                .ok_or_else(|| invalid("unterminated '[' in host"))?,
            None if host.contains(':') => return Err(invalid("IPv6 hosts must be bracketed")),
            None => host,
        };

        if host.chars().any(char::is_whitespace) {
            return Err(invalid("host contains whitespace"));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            if !net_type.accepts(&ip) {
                return Err(ConfigError::FamilyMismatch {
                    net_type: net_type.to_string(),
                    addr: addr.to_string(),
                });
            }
        }

        Ok(Self {
            net_type,
            host: host.to_string(),
            port,
        })
    }

    pub fn net_type(&self) -> NetType {
        self.net_type
    }

    /// Resolve to the first socket address of the configured family.
    pub async fn resolve(&self) -> Result<SocketAddr, ServerError> {
        if self.host.is_empty() {
            return Ok(SocketAddr::new(self.net_type.wildcard(), self.port));
        }
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        let candidates = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|source| ServerError::Resolve {
                addr: self.to_string(),
                source,
            })?;

        let net_type = self.net_type;
        candidates
            .into_iter()
            .find(|candidate| net_type.accepts(&candidate.ip()))
            .ok_or_else(|| ServerError::NoAddress {
                net_type: net_type.to_string(),
                addr: self.to_string(),
            })
    }
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Open a listening socket on `addr`.
///
/// IPv6 sockets are v6-only for `tcp6` and dual-stack otherwise. Must be
/// called from within a tokio runtime.
pub fn bind_tcp(addr: SocketAddr, net_type: NetType, backlog: u32) -> Result<TcpListener, ServerError> {
    open_listener(addr, net_type, backlog).map_err(|source| ServerError::Bind { addr, source })
}

fn open_listener(addr: SocketAddr, net_type: NetType, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if addr.is_ipv6() {
        socket.set_only_v6(net_type == NetType::Tcp6)?;
    }
    #[cfg(unix)]
    socket.set_reuse_address(true)?;

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    TcpListener::from_std(socket.into())
}

/// Source of accepted connections for the accept loop.
#[async_trait]
pub(crate) trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}
