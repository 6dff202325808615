//! # Proxied UART Transport
//!
//! Reaches a device behind a serial link through a relay process.
//! Frames travel over TCP wrapped in the tunnel envelope of
//! [`etherbone_protocol::envelope`]; the relay forwards them over the UART.
//!
//! The relay cannot be assumed to pipeline requests. This transport therefore keeps
//! at most one request in flight: a send issued while the previous request is still
//! unanswered first waits for that answer and queues it for the next receive.
//! If no answer arrives within the settle timeout the send reports
//! [TransportError::Timeout] and writes nothing.
use std::{
    collections::VecDeque,
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    time::{Duration, Instant},
};

use bytes::{Buf, BytesMut};
use etherbone_protocol::envelope::{self, ENVELOPE_HEADER_LEN, MAX_ENVELOPE_PAYLOAD};

use super::{Transport, TransportError};

/// Frame size limit for relays; serial links favour short frames
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024;
/// How long a send waits for the answer to the previous, still unanswered request
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_millis(500);

pub struct ProxyTransport {
    stream: TcpStream,
    peer: SocketAddr,
    rx: BytesMut,
    queued: VecDeque<Vec<u8>>,
    in_flight: bool,
    settle_timeout: Duration,
    max_frame_len: usize,
}

impl ProxyTransport {
    /// Changes how long a send may wait for an outstanding answer.
    pub fn set_settle_timeout(&mut self, timeout: Duration) {
        self.settle_timeout = timeout;
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn read_envelope(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 512];
        loop {
            match envelope::decode(&self.rx, MAX_ENVELOPE_PAYLOAD) {
                Ok(Some((payload, used))) => {
                    let payload = payload.to_vec();
                    self.rx.advance(used);
                    log::trace!("Relay {} delivered: {:02x?}", self.peer, payload);
                    return Ok(payload);
                }
                Ok(None) => {}
                // The byte stream can no longer be split into envelopes
                Err(e) => {
                    return Err(TransportError::Disconnected(format!(
                        "Relay stream out of sync: {}",
                        e
                    )));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            self.stream.set_read_timeout(Some(remaining))?;
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(TransportError::Disconnected(
                        "Relay closed the connection".to_string(),
                    ));
                }
                Ok(len) => self.rx.extend_from_slice(&chunk[..len]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Transport for ProxyTransport {
    type Target = SocketAddr;

    fn open(target: &SocketAddr) -> Result<Self, TransportError> {
        log::debug!("Connecting to relay at {}", target);
        let stream = TcpStream::connect(target)?;
        stream.set_nodelay(true)?;
        log::info!("Connected to relay at {}", target);
        Ok(ProxyTransport {
            stream,
            peer: *target,
            rx: BytesMut::with_capacity(ENVELOPE_HEADER_LEN + DEFAULT_MAX_FRAME_LEN),
            queued: VecDeque::new(),
            in_flight: false,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        })
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.len() > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                max: self.max_frame_len,
                got: bytes.len(),
            });
        }

        if self.in_flight {
            log::debug!("Previous request to relay {} still unanswered", self.peer);
            match self.read_envelope(self.settle_timeout) {
                Ok(reply) => {
                    self.queued.push_back(reply);
                    self.in_flight = false;
                }
                Err(TransportError::Timeout) => {
                    log::debug!("Relay {} busy, request not sent", self.peer);
                    return Err(TransportError::Timeout);
                }
                Err(e) => return Err(e),
            }
        }

        let wrapped = envelope::encode(bytes).map_err(|_| TransportError::FrameTooLarge {
            max: MAX_ENVELOPE_PAYLOAD,
            got: bytes.len(),
        })?;
        log::trace!("Relay {} send: {:02x?}", self.peer, bytes);
        self.stream.write_all(&wrapped)?;
        self.in_flight = true;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if let Some(reply) = self.queued.pop_front() {
            return Ok(reply);
        }
        let reply = self.read_envelope(timeout)?;
        self.in_flight = false;
        Ok(reply)
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn close(self) -> Result<(), TransportError> {
        log::debug!("Closing connection to relay {}", self.peer);
        self.stream.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }
}
