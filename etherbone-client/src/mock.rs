//! In-process transport for unit tests.
use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use etherbone_protocol::Frame;
use etherbone_server::{MemoryBus, respond};

use crate::transport::{Transport, TransportError};

#[derive(Default)]
struct Wire {
    device: Option<MemoryBus>,
    sent: Vec<Vec<u8>>,
    inbox: VecDeque<Vec<u8>>,
    opens: usize,
    drop_sends: usize,
    fail_send_at: Option<usize>,
    sends_attempted: usize,
    fail_receive: bool,
}

/// Shared handle to the simulated wire; every transport opened from it sees the same state.
#[derive(Clone, Default)]
pub(crate) struct MockTarget(Arc<Mutex<Wire>>);

impl fmt::Debug for MockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MockTarget")
    }
}

impl MockTarget {
    /// A wire nobody answers on.
    pub(crate) fn silent() -> MockTarget {
        MockTarget::default()
    }

    /// A wire with a device that answers every decodable request.
    pub(crate) fn with_device(bus: MemoryBus) -> MockTarget {
        let target = MockTarget::default();
        target.wire().device = Some(bus);
        target
    }

    fn wire(&self) -> MutexGuard<'_, Wire> {
        self.0.lock().unwrap()
    }

    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.wire().sent.clone()
    }

    pub(crate) fn opens(&self) -> usize {
        self.wire().opens
    }

    pub(crate) fn device(&self) -> Option<MemoryBus> {
        self.wire().device.clone()
    }

    /// The device ignores the next `count` requests.
    pub(crate) fn drop_sends(&self, count: usize) {
        self.wire().drop_sends = count;
    }

    /// The `n`-th send attempt (1-based) fails as if the link went down.
    pub(crate) fn fail_send_at(&self, n: usize) {
        self.wire().fail_send_at = Some(n);
    }

    pub(crate) fn fail_receive(&self) {
        self.wire().fail_receive = true;
    }

    pub(crate) fn heal(&self) {
        let mut wire = self.wire();
        wire.fail_receive = false;
        wire.fail_send_at = None;
    }

    pub(crate) fn push_reply(&self, frame: Frame) {
        self.push_raw(frame.encode().unwrap());
    }

    pub(crate) fn push_raw(&self, bytes: Vec<u8>) {
        self.wire().inbox.push_back(bytes);
    }
}

pub(crate) struct MockTransport {
    target: MockTarget,
    max_frame_len: usize,
}

impl Transport for MockTransport {
    type Target = MockTarget;

    fn open(target: &MockTarget) -> Result<Self, TransportError> {
        target.wire().opens += 1;
        Ok(MockTransport {
            target: target.clone(),
            max_frame_len: 1472,
        })
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut wire = self.target.wire();
        wire.sends_attempted += 1;
        if wire.fail_send_at == Some(wire.sends_attempted) {
            return Err(TransportError::Disconnected("link down".to_string()));
        }
        wire.sent.push(bytes.to_vec());
        if wire.drop_sends > 0 {
            wire.drop_sends -= 1;
            return Ok(());
        }
        let reply = match (&mut wire.device, Frame::decode(bytes)) {
            (Some(bus), Ok(frame)) => Some(respond(&frame, bus).encode().unwrap()),
            _ => None,
        };
        if let Some(reply) = reply {
            wire.inbox.push_back(reply);
        }
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        {
            let mut wire = self.target.wire();
            if wire.fail_receive {
                return Err(TransportError::Disconnected("link down".to_string()));
            }
            if let Some(bytes) = wire.inbox.pop_front() {
                return Ok(bytes);
            }
        }
        std::thread::sleep(timeout);
        Err(TransportError::Timeout)
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}
