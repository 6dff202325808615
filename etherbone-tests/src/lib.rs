//! Fixtures for end-to-end tests: simulated devices on real sockets and a lossy link.
use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use etherbone_server::{
    MemoryBus,
    relay::{Relay, RelayConfig},
    server::{Config, Server},
};
use tokio::net::TcpListener;

pub type SharedBus = Arc<Mutex<MemoryBus>>;

/// Starts a UDP device on a background thread. It runs until the process exits.
pub fn spawn_device(config: Config) -> io::Result<(SocketAddr, SharedBus)> {
    let socket = UdpSocket::bind("127.0.0.1:0")?;
    let addr = socket.local_addr()?;
    let bus = SharedBus::default();
    let mut server = Server::new(Arc::clone(&bus), config);
    thread::spawn(move || {
        if let Err(e) = server.serve(&socket) {
            log::error!("Simulated device stopped: {}", e);
        }
    });
    Ok((addr, bus))
}

/// Starts a loopback relay on the current tokio runtime.
pub async fn spawn_relay(config: RelayConfig) -> io::Result<(SocketAddr, SharedBus)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let bus = SharedBus::default();
    tokio::spawn(Relay::new(Arc::clone(&bus), config).serve(listener));
    Ok((addr, bus))
}

/// A UDP forwarder between one client and a device that drops every n-th datagram,
/// counting both directions together.
pub struct LossyLink {
    addr: SocketAddr,
    forwarded: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl LossyLink {
    pub fn new(device: SocketAddr, drop_every: usize) -> io::Result<LossyLink> {
        let front = UdpSocket::bind("127.0.0.1:0")?;
        let back = UdpSocket::bind("127.0.0.1:0")?;
        back.connect(device)?;

        let link = LossyLink {
            addr: front.local_addr()?,
            forwarded: Arc::default(),
            dropped: Arc::default(),
        };
        let seen = Arc::new(AtomicUsize::new(0));
        let client = Arc::new(Mutex::new(None::<SocketAddr>));

        let pass = {
            let forwarded = Arc::clone(&link.forwarded);
            let dropped = Arc::clone(&link.dropped);
            move || {
                if (seen.fetch_add(1, Ordering::SeqCst) + 1) % drop_every == 0 {
                    dropped.fetch_add(1, Ordering::SeqCst);
                    false
                } else {
                    forwarded.fetch_add(1, Ordering::SeqCst);
                    true
                }
            }
        };
        let pass = Arc::new(pass);

        let (front_rx, back_tx) = (front.try_clone()?, back.try_clone()?);
        let (upstream_pass, upstream_client) = (Arc::clone(&pass), Arc::clone(&client));
        thread::spawn(move || {
            let mut buf = [0u8; 2048];
            while let Ok((len, from)) = front_rx.recv_from(&mut buf) {
                *upstream_client.lock().unwrap() = Some(from);
                if (*upstream_pass)() {
                    let _ = back_tx.send(&buf[..len]);
                }
            }
        });
        thread::spawn(move || {
            let mut buf = [0u8; 2048];
            while let Ok(len) = back.recv(&mut buf) {
                let Some(to) = *client.lock().unwrap() else {
                    continue;
                };
                if (*pass)() {
                    let _ = front.send_to(&buf[..len], to);
                }
            }
        });
        Ok(link)
    }

    /// Where clients should send their requests.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}
