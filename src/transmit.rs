use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("Failed to resolve {target}: {source}")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("{target} resolved to no addresses")]
    NoAddress { target: String },

    #[error("Error creating VXLAN connection for port {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Error sending VXLAN payload from port {port}: {source}")]
    Send {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Short write from port {port}: {sent} of {len} bytes")]
    ShortWrite { port: u16, sent: usize, len: usize },
}

/// Sends one encapsulated payload per call
pub trait Transmit: Send + Sync {
    fn send(&self, source_port: u16, payload: &[u8]) -> Result<usize, TransmitError>;
}

/// Fire-and-forget UDP sender to the collector.
///
/// Every call opens a fresh socket bound to `source_port`, so each datagram
/// carries the port derived for its own flow.
pub struct UdpTransmitter {
    host: String,
    port: u16,
    resolved: Mutex<Option<SocketAddr>>,
}

impl UdpTransmitter {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            resolved: Mutex::new(None),
        }
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve the collector address, caching the first success
    pub fn resolve(&self) -> Result<SocketAddr, TransmitError> {
        if let Some(addr) = *self.resolved.lock() {
            return Ok(addr);
        }

        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| TransmitError::Resolve {
                target: self.target(),
                source,
            })?
            .next()
            .ok_or_else(|| TransmitError::NoAddress {
                target: self.target(),
            })?;

        debug!("Resolved collector {} to {}", self.target(), addr);
        *self.resolved.lock() = Some(addr);
        Ok(addr)
    }

    fn open_socket(source_port: u16, dest: SocketAddr) -> io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(dest), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;

        let unspecified = match dest.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        socket.bind(&SockAddr::from(SocketAddr::new(unspecified, source_port)))?;
        socket.connect(&SockAddr::from(dest))?;
        Ok(socket)
    }
}

impl Transmit for UdpTransmitter {
    fn send(&self, source_port: u16, payload: &[u8]) -> Result<usize, TransmitError> {
        let dest = self.resolve()?;

        // dropped at the end of this call, success or not
        let socket = Self::open_socket(source_port, dest).map_err(|source| TransmitError::Connect {
            port: source_port,
            source,
        })?;

        let sent = socket.send(payload).map_err(|source| TransmitError::Send {
            port: source_port,
            source,
        })?;
        if sent != payload.len() {
            return Err(TransmitError::ShortWrite {
                port: source_port,
                sent,
                len: payload.len(),
            });
        }

        trace!("sent {} byte payload {}->{}", sent, source_port, dest);
        Ok(sent)
    }
}

/// Runs the pipeline without putting anything on the wire
pub struct DryRunTransmitter;

impl Transmit for DryRunTransmitter {
    fn send(&self, source_port: u16, payload: &[u8]) -> Result<usize, TransmitError> {
        trace!("dry run: {} byte payload from port {}", payload.len(), source_port);
        Ok(payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::time::Duration;

    fn receiver() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        socket
    }

    fn free_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_send_uses_source_port() {
        let rx = receiver();
        let dest = rx.local_addr().unwrap();
        let transmitter = UdpTransmitter::new("127.0.0.1", dest.port());
        let source_port = free_port();

        let sent = transmitter.send(source_port, b"mirrored frame").unwrap();
        assert_eq!(sent, 14);

        let mut buf = [0u8; 64];
        let (len, from) = rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"mirrored frame");
        assert_eq!(from.port(), source_port);
    }

    #[test]
    fn test_source_port_reused_across_sends() {
        let rx = receiver();
        let transmitter = UdpTransmitter::new("127.0.0.1", rx.local_addr().unwrap().port());
        let source_port = free_port();

        transmitter.send(source_port, b"one").unwrap();
        transmitter.send(source_port, b"two").unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"one");
        let (len, _) = rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"two");
    }

    #[test]
    fn test_resolve_failure_is_error() {
        let transmitter = UdpTransmitter::new("collector.invalid", 4789);
        let err = transmitter.send(50000, b"payload").unwrap_err();
        assert!(matches!(
            err,
            TransmitError::Resolve { .. } | TransmitError::NoAddress { .. }
        ));
    }

    #[test]
    fn test_resolution_is_cached() {
        let transmitter = UdpTransmitter::new("127.0.0.1", 4789);
        let first = transmitter.resolve().unwrap();
        assert_eq!(first, "127.0.0.1:4789".parse().unwrap());
        assert_eq!(*transmitter.resolved.lock(), Some(first));
        assert_eq!(transmitter.resolve().unwrap(), first);
    }

    #[test]
    fn test_dry_run_reports_length() {
        assert_eq!(DryRunTransmitter.send(65535, &[0u8; 72]).unwrap(), 72);
    }
}
