use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::TransportError;

/// Where a connection is accepted or established.
///
/// Accepted spellings:
/// - `unix:/run/app.sock` or `unix:///run/app.sock`
/// - `tcp://127.0.0.1:7878`
/// - `127.0.0.1:7878` (anything with a port and no `/`)
/// - `/run/app.sock` (anything else is treated as a socket path)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match self {
            Self::Unix(_) => "unix-domain-socket",
            Self::Tcp(_) => "tcp",
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TransportError::InvalidEndpoint(
                "endpoint must not be empty".to_string(),
            ));
        }

        if let Some(rest) = input.strip_prefix("tcp://") {
            return parse_tcp(rest);
        }
        if let Some(rest) = input.strip_prefix("unix://") {
            return parse_unix(rest);
        }
        if let Some(rest) = input.strip_prefix("unix:") {
            return parse_unix(rest);
        }
        if !input.contains('/') && input.rsplit_once(':').is_some() {
            return parse_tcp(input);
        }
        parse_unix(input)
    }
}

fn parse_tcp(addr: &str) -> Result<Endpoint, TransportError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidEndpoint(format!("missing port in '{addr}'")))?;
    if host.is_empty() {
        return Err(TransportError::InvalidEndpoint(format!(
            "missing host in '{addr}'"
        )));
    }
    port.parse::<u16>()
        .map_err(|_| TransportError::InvalidEndpoint(format!("invalid port in '{addr}'")))?;
    Ok(Endpoint::Tcp(addr.to_string()))
}

fn parse_unix(path: &str) -> Result<Endpoint, TransportError> {
    if path.is_empty() {
        return Err(TransportError::InvalidEndpoint(
            "socket path must not be empty".to_string(),
        ));
    }
    Ok(Endpoint::Unix(PathBuf::from(path)))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}
