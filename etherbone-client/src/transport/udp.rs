//! # Direct Ethernet Transport
//!
//! Sends every frame as a single UDP datagram to the device.
//! Datagrams may be lost; a lost request or reply only ever shows up as a timeout.
use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    time::Duration,
};

use super::{Transport, TransportError};

/// Largest payload that fits an Ethernet frame without IP fragmentation.
pub const DEFAULT_MAX_DATAGRAM_LEN: usize = 1472;

const RECEIVE_BUFFER_LEN: usize = 65535;

pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    buf: Box<[u8]>,
}

impl UdpTransport {
    /// The device address this handle is connected to
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    type Target = SocketAddr;

    fn open(target: &SocketAddr) -> Result<Self, TransportError> {
        let bind_addr: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        // Connecting filters out datagrams from any other sender
        socket.connect(target)?;
        log::debug!(
            "UDP transport bound to {} for device {}",
            socket.local_addr()?,
            target
        );
        Ok(UdpTransport {
            socket,
            peer: *target,
            buf: vec![0; RECEIVE_BUFFER_LEN].into_boxed_slice(),
        })
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.len() > DEFAULT_MAX_DATAGRAM_LEN {
            return Err(TransportError::FrameTooLarge {
                max: DEFAULT_MAX_DATAGRAM_LEN,
                got: bytes.len(),
            });
        }
        log::trace!("UDP send to {}: {:02x?}", self.peer, bytes);
        match self.socket.send(bytes) {
            Ok(sent) if sent == bytes.len() => Ok(()),
            Ok(sent) => Err(TransportError::Io(io::Error::other(format!(
                "Short datagram write: {} of {} bytes",
                sent,
                bytes.len()
            )))),
            // An earlier datagram was answered with ICMP port unreachable.
            // The device may still come up, so this counts as loss.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                log::debug!("UDP send to {} refused: {}", self.peer, e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        // A zero read timeout would mean "block forever"
        if timeout.is_zero() {
            return Err(TransportError::Timeout);
        }
        self.socket.set_read_timeout(Some(timeout))?;
        match self.socket.recv(&mut self.buf) {
            Ok(len) => {
                log::trace!("UDP receive from {}: {:02x?}", self.peer, &self.buf[..len]);
                Ok(self.buf[..len].to_vec())
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                log::debug!("UDP receive from {} refused: {}", self.peer, e);
                Err(TransportError::Timeout)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn max_frame_len(&self) -> usize {
        DEFAULT_MAX_DATAGRAM_LEN
    }
}
