//! Media that carry encoded frames between the client and the device.
//!
//! Every medium implements [`Transport`]. The session only ever talks to that
//! trait; [`AnyTransport`] selects one of the built-in media at runtime.
use std::{
    error::Error,
    fmt::{self, Display},
    io,
    net::SocketAddr,
    time::Duration,
};

pub mod pcie;
pub mod proxy;
pub mod udp;

pub use pcie::{MappedRegion, Mmio, PcieTarget, PcieTransport};
pub use proxy::ProxyTransport;
pub use udp::UdpTransport;

/// Errors reported by a transport.
///
/// [`TransportError::Timeout`] is expected on lossy media and is retried by the session.
/// Every other variant means the handle is no longer usable.
#[derive(Debug)]
pub enum TransportError {
    Timeout,
    Disconnected(String),
    FrameTooLarge { max: usize, got: usize },
    Io(io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

impl From<io::Error> for TransportError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => TransportError::Disconnected(value.to_string()),
            _ => TransportError::Io(value),
        }
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "Timed out waiting for data"),
            TransportError::Disconnected(reason) => write!(f, "Disconnected: {}", reason),
            TransportError::FrameTooLarge { max, got } => {
                write!(f, "Frame too large! Maximum is {}, but got {}", max, got)
            }
            TransportError::Io(error) => write!(f, "{}", error),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransportError::Io(error) => Some(error),
            _ => None,
        }
    }
}

/// A channel that carries whole frames to a device and back.
///
/// A value of an implementing type is an open handle. It exclusively owns its
/// OS resources and releases them when dropped.
pub trait Transport: Sized {
    /// Describes where to connect to.
    type Target: Clone + fmt::Debug;

    /// Opens a new handle to `target`.
    fn open(target: &Self::Target) -> Result<Self, TransportError>;

    /// Sends one encoded frame.
    ///
    /// [TransportError::Timeout] means the medium was not ready and nothing was sent.
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Waits at most `timeout` for the next frame from the device.
    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// The largest frame, in bytes, the medium can carry in either direction.
    fn max_frame_len(&self) -> usize;

    /// Closes the handle.
    fn close(self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Where a device can be reached, for each of the built-in media.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Endpoint {
    Udp(SocketAddr),
    Pcie(PcieTarget),
    Proxy(SocketAddr),
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Udp(addr) => write!(f, "udp://{}", addr),
            Endpoint::Pcie(target) => write!(
                f,
                "pcie://{}@0x{:x}+0x{:x}",
                target.path.display(),
                target.offset,
                target.size
            ),
            Endpoint::Proxy(addr) => write!(f, "proxy://{}", addr),
        }
    }
}

/// One of the built-in media, chosen at runtime from an [`Endpoint`].
pub enum AnyTransport {
    Udp(UdpTransport),
    Pcie(PcieTransport),
    Proxy(ProxyTransport),
}

impl Transport for AnyTransport {
    type Target = Endpoint;

    fn open(target: &Endpoint) -> Result<Self, TransportError> {
        Ok(match target {
            Endpoint::Udp(addr) => AnyTransport::Udp(UdpTransport::open(addr)?),
            Endpoint::Pcie(target) => AnyTransport::Pcie(PcieTransport::open(target)?),
            Endpoint::Proxy(addr) => AnyTransport::Proxy(ProxyTransport::open(addr)?),
        })
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        match self {
            AnyTransport::Udp(transport) => transport.send(bytes),
            AnyTransport::Pcie(transport) => transport.send(bytes),
            AnyTransport::Proxy(transport) => transport.send(bytes),
        }
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        match self {
            AnyTransport::Udp(transport) => transport.receive(timeout),
            AnyTransport::Pcie(transport) => transport.receive(timeout),
            AnyTransport::Proxy(transport) => transport.receive(timeout),
        }
    }

    fn max_frame_len(&self) -> usize {
        match self {
            AnyTransport::Udp(transport) => transport.max_frame_len(),
            AnyTransport::Pcie(transport) => transport.max_frame_len(),
            AnyTransport::Proxy(transport) => transport.max_frame_len(),
        }
    }

    fn close(self) -> Result<(), TransportError> {
        match self {
            AnyTransport::Udp(transport) => transport.close(),
            AnyTransport::Pcie(transport) => transport.close(),
            AnyTransport::Proxy(transport) => transport.close(),
        }
    }
}

#[test]
fn io_errors_are_classified() {
    let timeout: TransportError = io::Error::from(io::ErrorKind::TimedOut).into();
    assert!(timeout.is_timeout());
    let reset: TransportError = io::Error::from(io::ErrorKind::ConnectionReset).into();
    assert!(matches!(reset, TransportError::Disconnected(_)));
    let other: TransportError = io::Error::from(io::ErrorKind::PermissionDenied).into();
    assert!(matches!(other, TransportError::Io(_)));
}
