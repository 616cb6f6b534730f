//! Byte-stream transports for rsocket connections.
//!
//! A connection runs over one ordered, reliable byte stream:
//! - Unix domain sockets (Linux/macOS)
//! - TCP
//!
//! This is the lowest layer of the workspace. Framing and the protocol
//! engine build on the [`SocketStream`] type provided here.

pub mod endpoint;
pub mod error;
pub mod stream;
pub mod tcp;

#[cfg(unix)]
pub mod uds;

pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use stream::SocketStream;
pub use tcp::TcpSocket;

#[cfg(unix)]
pub use uds::UnixDomainSocket;

/// A bound listener of either kind.
pub enum Listener {
    #[cfg(unix)]
    Unix(UnixDomainSocket),
    Tcp(TcpSocket),
}

impl Listener {
    /// Bind a listener for the given endpoint.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Self::Unix(UnixDomainSocket::bind(path)?)),
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Err(TransportError::InvalidEndpoint(format!(
                "unix sockets are not supported on this platform: {}",
                path.display()
            ))),
            Endpoint::Tcp(addr) => Ok(Self::Tcp(TcpSocket::bind(addr)?)),
        }
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<SocketStream> {
        match self {
            #[cfg(unix)]
            Self::Unix(socket) => socket.accept(),
            Self::Tcp(socket) => socket.accept(),
        }
    }

    /// The endpoint this listener is bound to.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            #[cfg(unix)]
            Self::Unix(socket) => Ok(Endpoint::Unix(socket.path().to_path_buf())),
            Self::Tcp(socket) => Ok(Endpoint::Tcp(socket.local_addr()?.to_string())),
        }
    }
}

/// Connect to the given endpoint (blocking).
pub fn connect(endpoint: &Endpoint) -> Result<SocketStream> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => UnixDomainSocket::connect(path),
        #[cfg(not(unix))]
        Endpoint::Unix(path) => Err(TransportError::InvalidEndpoint(format!(
            "unix sockets are not supported on this platform: {}",
            path.display()
        ))),
        Endpoint::Tcp(addr) => TcpSocket::connect(addr),
    }
}
