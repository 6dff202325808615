use std::{
    io::{self, ErrorKind},
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    thread,
    time::Duration,
};

use crate::{WishboneBus, handle_frame};

#[derive(Debug, Clone)]
pub struct Config {
    /// Largest datagram accepted. Longer datagrams are truncated and dropped.
    pub max_frame_len: usize,
    /// Time between receiving a request and sending its reply.
    pub reply_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_len: 1472,
            reply_delay: Duration::ZERO,
        }
    }
}

/// A device answering Etherbone frames sent as UDP datagrams.
#[derive(Debug)]
pub struct Server<B: WishboneBus> {
    bus: B,
    config: Config,
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```
/// use etherbone_server::{MemoryBus, server::Builder};
/// use std::time::Duration;
///
/// let server = Builder::new()
///     .max_frame_len(512)
///     .reply_delay(Duration::from_millis(5))
///     .build(MemoryBus::new());
/// assert_eq!(server.config().max_frame_len, 512);
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the largest datagram this server is expected to receive.
    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.config.max_frame_len = len;
        self
    }

    /// Delay every reply, e.g. to provoke retransmissions
    pub fn reply_delay(mut self, delay: Duration) -> Self {
        self.config.reply_delay = delay;
        self
    }

    /// Build and return the server
    pub fn build<B: WishboneBus>(self, bus: B) -> Server<B> {
        Server::new(bus, self.config)
    }
}

impl<B: WishboneBus> Server<B> {
    pub fn new(bus: B, config: Config) -> Server<B> {
        Server { bus, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn listen(mut self, addr: impl ToSocketAddrs) -> Result<(), Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind(addr)?;
        log::info!("Server listening on {}", socket.local_addr()?);
        self.serve(&socket)?;
        Ok(())
    }

    /// Answers datagrams on `socket` until a socket error occurs.
    pub fn serve(&mut self, socket: &UdpSocket) -> io::Result<()> {
        // one spare byte detects oversized datagrams
        let mut buf = vec![0u8; self.config.max_frame_len + 1];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                // ICMP port unreachable from an earlier reply
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            };
            if len > self.config.max_frame_len {
                log::warn!("Dropping oversized datagram from {}", peer);
                continue;
            }
            self.answer(socket, &buf[..len], peer)?;
        }
    }

    fn answer(&mut self, socket: &UdpSocket, request: &[u8], peer: SocketAddr) -> io::Result<()> {
        let Some(reply) = handle_frame(request, &mut self.bus) else {
            return Ok(());
        };
        if !self.config.reply_delay.is_zero() {
            thread::sleep(self.config.reply_delay);
        }
        log::trace!("Reply to {}: {:02x?}", peer, reply);
        match socket.send_to(&reply, peer) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                log::debug!("Peer {} went away", peer);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
