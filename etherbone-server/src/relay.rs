//! Loopback relay for the proxied UART transport.
//!
//! A real relay forwards envelope-framed bytes between a socket and a serial port.
//! This one answers the frames itself from a simulated bus, so a client can be
//! exercised end to end without a serial link.
use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::BytesMut;
use etherbone_protocol::envelope::EnvelopeCodec;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, ToSocketAddrs},
};
use tokio_util::codec::{Decoder, Encoder};

use crate::{WishboneBus, handle_frame};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Largest frame carried in one envelope. Larger envelopes close the link.
    pub max_frame_len: usize,
    /// Simulated serial latency added before every reply.
    pub reply_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 1024,
            reply_delay: Duration::ZERO,
        }
    }
}

/// Serves every accepted connection as one serial link to a shared bus.
///
/// Frames on one link are answered strictly in the order they arrive.
pub struct Relay<B> {
    bus: Arc<Mutex<B>>,
    config: RelayConfig,
}

impl<B: WishboneBus + Send + 'static> Relay<B> {
    pub fn new(bus: Arc<Mutex<B>>, config: RelayConfig) -> Relay<B> {
        Relay { bus, config }
    }

    pub async fn listen(self, addr: impl ToSocketAddrs) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accepts links on `listener` until accepting fails.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            log::info!("New link from {}", peer);
            let bus = Arc::clone(&self.bus);
            let config = self.config.clone();
            tokio::spawn(async move {
                match serve_link(stream, bus, config).await {
                    Ok(()) => log::info!("Link from {} closed", peer),
                    Err(e) => log::error!("Link from {} failed: {}", peer, e),
                }
            });
        }
    }
}

async fn serve_link<B: WishboneBus>(
    mut stream: TcpStream,
    bus: Arc<Mutex<B>>,
    config: RelayConfig,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let mut codec = EnvelopeCodec::new(config.max_frame_len);
    let mut rx = BytesMut::with_capacity(4096);
    let mut tx = BytesMut::new();
    loop {
        while let Some(request) = codec.decode(&mut rx)? {
            let reply = {
                let mut bus = bus.lock().unwrap_or_else(PoisonError::into_inner);
                handle_frame(&request, &mut *bus)
            };
            let Some(reply) = reply else {
                continue;
            };
            if !config.reply_delay.is_zero() {
                tokio::time::sleep(config.reply_delay).await;
            }
            codec.encode(&reply[..], &mut tx)?;
            stream.write_all(&tx).await?;
            tx.clear();
        }
        if stream.read_buf(&mut rx).await? == 0 {
            if !rx.is_empty() {
                log::warn!("Link closed with {} bytes of a partial envelope", rx.len());
            }
            return Ok(());
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use etherbone_protocol::{Frame, Record, Width, envelope};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::{Relay, RelayConfig};
    use crate::MemoryBus;

    async fn read_envelope(stream: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; 3];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], envelope::ENVELOPE_TAG);
        let mut payload = vec![0u8; u16::from_be_bytes([header[1], header[2]]) as usize];
        stream.read_exact(&mut payload).await.unwrap();
        payload
    }

    #[tokio::test]
    async fn answers_frames_in_arrival_order() {
        let bus = Arc::new(Mutex::new(MemoryBus::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Relay::new(Arc::clone(&bus), RelayConfig::default()).serve(listener));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let first = Frame::request(1, vec![Record::write(0x8, Width::Byte, vec![7])]);
        let second = Frame::request(2, vec![Record::read(0x8, Width::Byte)]);
        let mut bytes = envelope::encode(&first.encode().unwrap()).unwrap();
        bytes.extend(envelope::encode(&second.encode().unwrap()).unwrap());

        // split mid-envelope, as a serial link would
        stream.write_all(&bytes[..5]).await.unwrap();
        stream.flush().await.unwrap();
        stream.write_all(&bytes[5..]).await.unwrap();

        let reply = Frame::decode(&read_envelope(&mut stream).await).unwrap();
        assert_eq!(reply.id(), 1);
        let reply = Frame::decode(&read_envelope(&mut stream).await).unwrap();
        assert_eq!(reply.id(), 2);
        assert_eq!(reply.records()[0].payload(), &[7]);
        assert_eq!(bus.lock().unwrap().load(0x8, 1), vec![7]);
    }

    #[tokio::test]
    async fn oversized_envelope_closes_link() {
        let bus = Arc::new(Mutex::new(MemoryBus::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = RelayConfig {
            max_frame_len: 16,
            ..RelayConfig::default()
        };
        tokio::spawn(Relay::new(bus, config).serve(listener));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&envelope::encode(&[0u8; 64]).unwrap())
            .await
            .unwrap();
        let mut buf = [0u8; 8];
        // closed either cleanly or with a reset, but never answered
        if let Ok(len) = stream.read(&mut buf).await {
            assert_eq!(len, 0);
        }
    }
}
