//! TCP connect readiness
//!
//! A service counts as up once anything accepts a connection on its port.
//! The host is resolved on every attempt and each resolved address is tried
//! in turn, so `localhost` works for servers that bind only one of
//! `127.0.0.1` and `::1`. The whole attempt, resolution included, shares one
//! deadline.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::{HealthError, Probe};

/// Connect-only probe for a host and port
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    /// Probe `host:port`, giving each attempt at most `timeout`
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    async fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = lookup_host((self.host.as_str(), self.port))
            .await?
            .collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} resolved to no addresses", self.host),
            ));
        }
        Ok(addrs)
    }

    async fn connect_any(&self) -> io::Result<SocketAddr> {
        let mut last_error = None;
        for addr in self.resolve().await? {
            match TcpStream::connect(addr).await {
                Ok(_stream) => return Ok(addr),
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused)))
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self) -> Result<(), HealthError> {
        let deadline = Instant::now() + self.timeout;
        match timeout_at(deadline, self.connect_any()).await {
            Ok(Ok(addr)) => {
                debug!("{} accepted a connection at {}", self.target(), addr);
                Ok(())
            }
            Ok(Err(e)) => Err(HealthError::Tcp(e)),
            Err(_elapsed) => Err(HealthError::Timeout(self.timeout)),
        }
    }

    fn target(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}
