//! Preferred-port binding with an upward scan.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::debug;

/// How long a connection attempt may take when checking for an existing listener.
const LISTENER_CHECK_TIMEOUT: Duration = Duration::from_millis(200);

/// Errors from port selection.
#[derive(Debug)]
pub enum PortError {
    /// Every port in the scanned range was taken
    NoFreePort { host: IpAddr, first: u16, last: u16 },

    /// Binding failed for a reason other than the port being taken
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

impl std::fmt::Display for PortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortError::NoFreePort { host, first, last } => {
                write!(f, "no free port on {} between {} and {}", host, first, last)
            }
            PortError::Bind { addr, source } => write!(f, "failed to bind {}: {}", addr, source),
        }
    }
}

impl std::error::Error for PortError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PortError::NoFreePort { .. } => None,
            PortError::Bind { source, .. } => Some(source),
        }
    }
}

/// A listener bound by [`bind_preferred`].
#[derive(Debug)]
pub struct BoundPort {
    pub listener: TcpListener,
    pub port: u16,
    pub preferred: u16,
}

impl BoundPort {
    /// Whether the preferred port was busy and another one was taken.
    pub fn is_fallback(&self) -> bool {
        self.port != self.preferred
    }
}

/// Bind the first available port in `[preferred, preferred + window]`.
///
/// A port that already accepts connections counts as taken even when the
/// bind itself would succeed, as it does next to a wildcard listener on
/// some platforms.
pub async fn bind_preferred(host: IpAddr, preferred: u16, window: u16) -> Result<BoundPort, PortError> {
    let last = preferred.saturating_add(window);

    for port in preferred..=last {
        let addr = SocketAddr::new(host, port);
        if has_listener(addr).await {
            debug!(port = port, "Port already accepting connections");
            continue;
        }
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                return Ok(BoundPort {
                    listener,
                    port,
                    preferred,
                })
            }
            Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied) => {
                debug!(port = port, error = %e, "Port unavailable");
            }
            Err(e) => return Err(PortError::Bind { addr, source: e }),
        }
    }

    Err(PortError::NoFreePort {
        host,
        first: preferred,
        last,
    })
}

async fn has_listener(addr: SocketAddr) -> bool {
    let target = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    };
    matches!(
        timeout(LISTENER_CHECK_TIMEOUT, TcpStream::connect(target)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_preferred_port_used_when_free() {
        // Ask the OS for a free port, then release it.
        let probe = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let bound = bind_preferred(LOOPBACK, port, 5).await.unwrap();
        assert_eq!(bound.port, port);
        assert!(!bound.is_fallback());
    }

    #[tokio::test]
    async fn test_busy_port_falls_back_upward() {
        let occupied = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        if port > u16::MAX - 20 {
            return;
        }

        let bound = bind_preferred(LOOPBACK, port, 20).await.unwrap();
        assert!(bound.is_fallback());
        assert!(bound.port > port && bound.port <= port + 20);
        assert_eq!(bound.listener.local_addr().unwrap().port(), bound.port);
    }

    #[tokio::test]
    async fn test_wildcard_listener_counts_as_busy() {
        let occupied = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        if port > u16::MAX - 20 {
            return;
        }

        assert!(has_listener(SocketAddr::new(LOOPBACK, port)).await);
        let bound = bind_preferred(LOOPBACK, port, 20).await.unwrap();
        assert!(bound.is_fallback());
        assert_ne!(bound.port, port);
    }

    #[tokio::test]
    async fn test_exhausted_window() {
        let occupied = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let err = bind_preferred(LOOPBACK, port, 0).await.unwrap_err();
        assert!(matches!(err, PortError::NoFreePort { .. }));
        assert!(err.to_string().contains(&port.to_string()));
    }
}
