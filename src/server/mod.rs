use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Mutex;

use crate::config;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 12345;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
        }
    }
}

impl From<config::ServerConfig> for ServerConfig {
    fn from(value: config::ServerConfig) -> Self {
        Self {
            host: value.host,
            port: value.port,
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        source: io::Error,
    },
    StreamClone {
        source: io::Error,
    },
    Accept {
        source: io::Error,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(
                    f,
                    "failed to clone accepted TCP stream for full duplex IO: {source}"
                )
            }
            Self::Accept { source } => write!(f, "failed to accept TCP connection: {source}"),
        }
    }
}

impl std::error::Error for ServerError {}

// Full-duplex handle over one accepted worker socket. The writer mutex is
// what serializes outbound frames per connection: the dispatcher's task
// write and the read loop's ping/register replies never interleave.
pub struct PersistentConnection {
    peer_addr: SocketAddr,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
}

impl PersistentConnection {
    fn new(stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, ServerError> {
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;

        let writer = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;

        Ok(Self {
            peer_addr,
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn try_read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.reader
            .lock()
            .expect("connection reader lock poisoned")
            .read(buffer)
    }

    pub fn try_write(&self, payload: &[u8]) -> io::Result<usize> {
        self.writer
            .lock()
            .expect("connection writer lock poisoned")
            .write(payload)
    }

    pub fn shutdown(&self) -> io::Result<()> {
        let _ = self
            .reader
            .lock()
            .expect("connection reader lock poisoned")
            .shutdown(Shutdown::Both);
        self.writer
            .lock()
            .expect("connection writer lock poisoned")
            .shutdown(Shutdown::Both)
    }
}

pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener =
            TcpListener::bind(&address).map_err(|source| ServerError::Bind { address, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self { listener })
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, ServerError> {
        let cfg = ServerConfig::from(app_config.server.clone());
        Self::bind(&cfg)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    // Non-blocking accept; `Ok(None)` means nothing is waiting right now.
    pub fn try_accept_persistent(&self) -> Result<Option<PersistentConnection>, ServerError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                Ok(Some(PersistentConnection::new(stream, peer_addr)?))
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(ServerError::Accept { source }),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::net::TcpStream;

    use super::test_support::{accept_with_retry, loopback_server};
    use super::{ServerConfig, DEFAULT_HOST, DEFAULT_PORT};

    #[test]
    fn default_config_matches_wire_contract() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, DEFAULT_HOST);
        assert_eq!(cfg.port, DEFAULT_PORT);
    }

    #[test]
    fn accept_is_non_blocking_when_nobody_connects() {
        let server = loopback_server();
        let accepted = server
            .try_accept_persistent()
            .expect("poll should not fail");
        assert!(accepted.is_none());
    }

    #[test]
    fn accepted_connection_is_full_duplex_and_non_blocking() {
        let server = loopback_server();
        let addr = server.local_addr().expect("local addr should exist");

        let client = TcpStream::connect(addr).expect("client should connect");
        client
            .set_nonblocking(true)
            .expect("client should be nonblocking");

        let conn = accept_with_retry(&server);
        assert_eq!(conn.peer_addr().ip().to_string(), "127.0.0.1");

        let written = conn.try_write(b"ping").expect("write should pass");
        assert_eq!(written, 4);

        let mut buf = [0_u8; 16];
        let read_result = conn.try_read(&mut buf);
        assert!(matches!(
            read_result,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock
        ));

        conn.shutdown().expect("shutdown should pass");
    }
}
