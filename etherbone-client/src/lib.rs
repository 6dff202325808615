//! # Etherbone Client
//!
//! A Rust client library for reading and writing registers on a remote Wishbone bus.
//!
//! ## Overview
//!
//! [`RegisterClient`] offers address-based reads and writes of 1, 2, 4 or 8 bytes and
//! block transfers over consecutive addresses. Underneath, a [`session::Session`]
//! turns each operation into one or more frames, sends them over a
//! [`transport::Transport`], matches replies by transaction identifier and retransmits
//! lost requests with a doubling timeout.
//!
//! ## Transports
//!
//! - **UDP** ([`transport::UdpTransport`]): direct Ethernet access to the device
//! - **PCIe** ([`transport::PcieTransport`]): a mailbox in a memory-mapped PCIe window
//! - **Proxied UART** ([`transport::ProxyTransport`]): a serial link behind a relay process
//!
//! [`transport::AnyTransport`] picks one of them at runtime from an [`transport::Endpoint`].
//!
//! For the wire format see the [`etherbone_protocol`](https://docs.rs/etherbone-protocol/) crate.
//!
//! ## Basic Usage
//!
//! ```ignore
//! use etherbone_client::{RegisterClient, config::SessionConfig, transport::UdpTransport};
//! use etherbone_protocol::Width;
//!
//! let client = RegisterClient::<UdpTransport>::open("192.168.1.50:1234".parse()?, SessionConfig::udp())?;
//!
//! client.write_u32(0xe000_1000, 0x1)?;
//! let id = client.read_u32(0xe000_0000)?;
//! let words = client.read_block(0x4000_0000, 16, Width::Word)?;
//! ```
//!
//! ## Error Handling
//!
//! Every error carries an [`error::ErrorKind`] with a stable exit code for command line tools.
//! A failed block transfer reports how many accesses completed before the failure;
//! completed accesses are never rolled back.
//!
//! ## Thread Model
//!
//! A [`RegisterClient`] can be shared between threads. Calls are serialized on the
//! session's lock. Independent clients share no state and run fully in parallel.
//!
//! ## Related Crates
//!
//! - [`etherbone_server`](https://docs.rs/etherbone-server/) - Simulated device and loopback relay
//! - [`etherbone_protocol`](https://docs.rs/etherbone-protocol/) - Protocol encoding/decoding
use std::sync::{Mutex, MutexGuard, PoisonError};

use etherbone_protocol::{Address, Record, Width};

pub mod config;
pub mod error;
pub mod session;
pub mod transport;

#[cfg(test)]
mod mock;

use config::SessionConfig;
use error::ClientError;
use session::{BatchError, Session};
use transport::Transport;

/// Register access to one device.
pub struct RegisterClient<T: Transport> {
    session: Mutex<Session<T>>,
}

impl<T: Transport> RegisterClient<T> {
    /// Opens a transport to `target`.
    pub fn open(target: T::Target, config: SessionConfig) -> Result<RegisterClient<T>, ClientError> {
        Ok(RegisterClient::new(Session::open(target, config)?))
    }

    pub fn new(session: Session<T>) -> RegisterClient<T> {
        RegisterClient {
            session: Mutex::new(session),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session<T>> {
        // A panicking caller cannot leave the session half-updated
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a fresh transport after a transport failure.
    pub fn reopen(&self) -> Result<(), ClientError> {
        Ok(self.session().reopen()?)
    }

    pub fn into_session(self) -> Session<T> {
        self.session
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads `width` bytes at `address`. The value is returned big-endian.
    pub fn read(&self, address: Address, width: Width) -> Result<Box<[u8]>, ClientError> {
        log::debug!("Read {} at 0x{:x}", width, address);
        let replies = self.session().submit(vec![Record::read(address, width)])?;
        // The session only accepts replies shaped like the request
        Ok(replies
            .into_iter()
            .next()
            .map(Record::into_payload)
            .unwrap_or_default())
    }

    /// Writes the big-endian `value` of `width` bytes at `address`.
    pub fn write(&self, address: Address, width: Width, value: &[u8]) -> Result<(), ClientError> {
        check_value(width, value)?;
        log::debug!("Write {} at 0x{:x}: {:02x?}", width, address, value);
        self.session()
            .submit(vec![Record::write(address, width, value)])?;
        Ok(())
    }

    /// Reads `count` consecutive registers of `width` bytes, starting at `address`.
    ///
    /// Values are returned in ascending address order.
    pub fn read_block(
        &self,
        address: Address,
        count: usize,
        width: Width,
    ) -> Result<Vec<Box<[u8]>>, ClientError> {
        log::debug!("Read block of {} x {} at 0x{:x}", count, width, address);
        let records = block_addresses(address, count, width)?
            .map(|a| Record::read(a, width))
            .collect();
        let replies = self
            .session()
            .submit_all(records)
            .map_err(|e| block_error(e, address, width))?;
        Ok(replies.into_iter().map(Record::into_payload).collect())
    }

    /// Writes `values` to consecutive registers of `width` bytes, starting at `address`.
    ///
    /// Writes are applied in ascending address order. If the transfer fails partway,
    /// the writes that completed stay in effect and the error reports how many there were.
    pub fn write_block<V: AsRef<[u8]>>(
        &self,
        address: Address,
        values: &[V],
        width: Width,
    ) -> Result<(), ClientError> {
        for value in values {
            check_value(width, value.as_ref())?;
        }
        log::debug!(
            "Write block of {} x {} at 0x{:x}",
            values.len(),
            width,
            address
        );
        let records = block_addresses(address, values.len(), width)?
            .zip(values)
            .map(|(a, value)| Record::write(a, width, value.as_ref()))
            .collect();
        self.session()
            .submit_all(records)
            .map_err(|e| block_error(e, address, width))?;
        Ok(())
    }

    pub fn read_u32(&self, address: Address) -> Result<u32, ClientError> {
        let value = self.read(address, Width::Word)?;
        let bytes = <[u8; 4]>::try_from(&value[..]).map_err(|_| ClientError::InvalidValue {
            expected: 4,
            got: value.len(),
        })?;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn write_u32(&self, address: Address, value: u32) -> Result<(), ClientError> {
        self.write(address, Width::Word, &value.to_be_bytes())
    }
}

fn check_value(width: Width, value: &[u8]) -> Result<(), ClientError> {
    if value.len() != width.bytes() {
        return Err(ClientError::InvalidValue {
            expected: width.bytes(),
            got: value.len(),
        });
    }
    Ok(())
}

fn block_addresses(
    address: Address,
    count: usize,
    width: Width,
) -> Result<impl Iterator<Item = Address>, ClientError> {
    let step = width.bytes() as u64;
    let overflow = ClientError::AddressOverflow { address, count };
    if count > 0 {
        (count as u64 - 1)
            .checked_mul(step)
            .and_then(|span| span.checked_add(step - 1))
            .and_then(|span| address.checked_add(span))
            .ok_or(overflow)?;
    }
    Ok((0..count as u64).map(move |i| address + i * step))
}

fn block_error(error: BatchError, address: Address, width: Width) -> ClientError {
    if error.completed == 0 {
        return ClientError::Session(error.cause);
    }
    let failed_at = address + (error.completed * width.bytes()) as u64;
    log::warn!(
        "Block transfer stopped at 0x{:x} after {} accesses",
        failed_at,
        error.completed
    );
    ClientError::PartialBlock {
        completed: error.completed,
        address: failed_at,
        cause: error.cause,
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread, time::Duration};

    use etherbone_protocol::Width;
    use etherbone_server::MemoryBus;

    use crate::{
        RegisterClient,
        config::Builder,
        error::{ClientError, ErrorKind, SessionError},
        mock::{MockTarget, MockTransport},
    };

    fn client(target: &MockTarget, max_frame_len: usize) -> RegisterClient<MockTransport> {
        let config = Builder::new()
            .base_timeout(Duration::from_millis(20))
            .max_retries(1)
            .max_frame_len(max_frame_len)
            .build();
        RegisterClient::open(target.clone(), config).unwrap()
    }

    #[test]
    fn write_then_read() {
        let target = MockTarget::with_device(MemoryBus::new());
        let client = client(&target, 1472);
        client.write_u32(0x2000, 0xdead_beef).unwrap();
        assert_eq!(client.read_u32(0x2000).unwrap(), 0xdead_beef);
        assert_eq!(&*client.read(0x2001, Width::Byte).unwrap(), &[0xad]);
    }

    #[test]
    fn block_read_is_in_address_order() {
        let mut bus = MemoryBus::new();
        for (i, value) in [1u32, 2, 3, 4].iter().enumerate() {
            bus.store(0x100 + i as u64 * 4, &value.to_be_bytes());
        }
        let target = MockTarget::with_device(bus);
        // one record per frame, so the block spans four transactions
        let client = client(&target, 8 + 14);

        let values: Vec<u32> = client
            .read_block(0x100, 4, Width::Word)
            .unwrap()
            .iter()
            .map(|v| u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
            .collect();
        assert_eq!(values, vec![1, 2, 3, 4]);
        assert_eq!(target.sent().len(), 4);
    }

    #[test]
    fn block_write_reports_partial_failure() {
        let target = MockTarget::with_device(MemoryBus::new());
        target.fail_send_at(3);
        let client = client(&target, 8 + 14);

        let values: Vec<[u8; 4]> = (1u32..=5).map(|v| v.to_be_bytes()).collect();
        let error = client.write_block(0x40, &values, Width::Word).unwrap_err();

        match &error {
            ClientError::PartialBlock {
                completed,
                address,
                cause,
            } => {
                assert_eq!(*completed, 2);
                assert_eq!(*address, 0x48);
                assert!(matches!(cause, SessionError::Transport(_)));
            }
            other => panic!("expected PartialBlock, got {:?}", other),
        }
        assert_eq!(error.kind(), ErrorKind::PartialBlockFailure);

        // writes 4 and 5 never left the client
        assert_eq!(target.sent().len(), 2);
        let bus = target.device().unwrap();
        assert_eq!(bus.load(0x40, 4), 1u32.to_be_bytes().to_vec());
        assert_eq!(bus.load(0x44, 4), 2u32.to_be_bytes().to_vec());
        assert_eq!(bus.load(0x48, 4), vec![0; 4]);
    }

    #[test]
    fn failure_before_any_progress_is_not_partial() {
        let target = MockTarget::silent();
        let client = client(&target, 1472);
        let error = client.read_block(0x0, 2, Width::Word).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Unreachable);
    }

    #[test]
    fn value_must_match_width() {
        let target = MockTarget::with_device(MemoryBus::new());
        let client = client(&target, 1472);
        let error = client.write(0x0, Width::Word, &[1, 2]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Encoding);
        assert!(target.sent().is_empty());
    }

    #[test]
    fn block_may_not_wrap_address_space() {
        let target = MockTarget::with_device(MemoryBus::new());
        let client = client(&target, 1472);
        assert!(matches!(
            client.read_block(u64::MAX - 7, 3, Width::Word),
            Err(ClientError::AddressOverflow { .. })
        ));
        assert_eq!(client.read_block(u64::MAX - 7, 2, Width::Word).unwrap().len(), 2);
        assert!(client.read_block(0x0, 0, Width::Word).unwrap().is_empty());
    }

    #[test]
    fn concurrent_callers_are_serialized() {
        let target = MockTarget::with_device(MemoryBus::new());
        let client = Arc::new(client(&target, 1472));

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let client = Arc::clone(&client);
                thread::spawn(move || {
                    for i in 0..25u64 {
                        let address = t * 0x1000 + i * 4;
                        client.write_u32(address, (t * 100 + i) as u32).unwrap();
                        assert_eq!(client.read_u32(address).unwrap(), (t * 100 + i) as u32);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(target.sent().len(), 200);
    }

    #[test]
    fn reopen_after_transport_failure() {
        let target = MockTarget::with_device(MemoryBus::new());
        let client = client(&target, 1472);
        target.fail_send_at(1);
        assert_eq!(
            client.write_u32(0x0, 1).unwrap_err().kind(),
            ErrorKind::TransportFailure
        );
        assert_eq!(
            client.read_u32(0x0).unwrap_err().kind(),
            ErrorKind::TransportFailure
        );
        target.heal();
        client.reopen().unwrap();
        client.write_u32(0x0, 1).unwrap();
    }
}
