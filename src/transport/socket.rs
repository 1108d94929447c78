//! Connecting to the host.
//!
//! The host listens and the worker connects. Endpoints are given as:
//! - `tcp://host:port`
//! - `unix:/path/to/socket` (Unix only)
//! - a bare port number, meaning `127.0.0.1:<port>`
//!
//! # Example
//!
//! ```ignore
//! use kernel_link::transport::{connect, Endpoint};
//!
//! let endpoint: Endpoint = "tcp://127.0.0.1:9000".parse()?;
//! let (reader, writer) = connect(&endpoint).await?;
//! ```

use std::fmt;
use std::io;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{KernelError, Result};

/// Read half of a connected endpoint.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a connected endpoint.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where the host listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP address in `host:port` form.
    Tcp(String),
    /// Unix domain socket path.
    #[cfg(unix)]
    Unix(std::path::PathBuf),
}

impl FromStr for Endpoint {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.is_empty() || !addr.contains(':') {
                return Err(invalid(s));
            }
            return Ok(Endpoint::Tcp(addr.to_string()));
        }

        if let Some(path) = s.strip_prefix("unix:") {
            #[cfg(unix)]
            {
                if path.is_empty() {
                    return Err(invalid(s));
                }
                return Ok(Endpoint::Unix(path.into()));
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(invalid(s));
            }
        }

        match s.parse::<u16>() {
            Ok(port) => Ok(Endpoint::Tcp(format!("127.0.0.1:{}", port))),
            Err(_) => Err(invalid(s)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

fn invalid(s: &str) -> KernelError {
    KernelError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Invalid endpoint '{}'", s),
    ))
}

/// Connect to the host and split the stream.
pub async fn connect(endpoint: &Endpoint) -> Result<(BoxedReader, BoxedWriter)> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str()).await?;
            // Replies are small and latency bound
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}
