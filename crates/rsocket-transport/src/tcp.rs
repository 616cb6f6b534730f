use std::net::{SocketAddr, TcpListener, TcpStream};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::SocketStream;

/// TCP listener.
pub struct TcpSocket {
    listener: TcpListener,
}

impl TcpSocket {
    /// Bind and listen on `addr` (`host:port`; port 0 picks a free port).
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|source| TransportError::Bind {
            endpoint: addr.to_string(),
            source,
        })?;
        let local = listener.local_addr()?;
        info!(%local, "listening on tcp");
        Ok(Self { listener })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<SocketStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted tcp connection");
        Ok(SocketStream::from_tcp(stream))
    }

    /// Connect to a listening TCP endpoint (blocking).
    pub fn connect(addr: &str) -> Result<SocketStream> {
        let stream = TcpStream::connect(addr).map_err(|source| TransportError::Connect {
            endpoint: addr.to_string(),
            source,
        })?;
        stream.set_nodelay(true)?;
        debug!(addr, "connected over tcp");
        Ok(SocketStream::from_tcp(stream))
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn loopback_roundtrip_on_ephemeral_port() {
        let listener = TcpSocket::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let client = std::thread::spawn(move || {
            let mut stream = TcpSocket::connect(&addr).unwrap();
            stream.write_all(b"over-tcp").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"over-tcp");
        assert_eq!(server.transport_name(), "tcp");
        client.join().unwrap();
    }

    #[test]
    fn connect_refused_reports_endpoint() {
        let listener = TcpSocket::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        match TcpSocket::connect(&addr) {
            Err(TransportError::Connect { endpoint, .. }) => assert_eq!(endpoint, addr),
            other => panic!("expected connect error, got {other:?}"),
        }
    }
}
