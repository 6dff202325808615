//! # Etherbone Server Library
//!
//! A simulated Etherbone device for bring-up and testing without hardware.
//!
//! ## Overview
//!
//! A device answers request [`Frame`]s by performing every record on its Wishbone bus
//! and returning a reply frame with the same transaction identifier. This crate provides
//! the bus abstraction and two ways of exposing a bus to clients.
//!
//! ## Architecture
//!
//! - **[`WishboneBus`] Trait**: the register space a device exposes
//! - **[`MemoryBus`]**: a sparse, zero-initialized byte-addressed memory
//! - **[`server::Server`]**: answers frames arriving as UDP datagrams, like a device on Ethernet
//! - **[`relay::Relay`]**: answers envelope-framed frames on TCP connections, like a UART
//!   link behind a proxy relay
//!
//! ## Basic Usage
//!
//! ```ignore
//! use etherbone_server::{MemoryBus, server::Builder};
//!
//! let server = Builder::new().build(MemoryBus::new());
//! server.listen("127.0.0.1:1234")?;
//! ```
//!
//! ## Error Handling
//!
//! Bus accesses cannot fail. Frames that cannot be decoded are dropped and logged,
//! exactly as a device on a lossy link would drop them.
//!
//! ## Logging
//!
//! This crate uses the `log` crate for diagnostics. Frame dumps are logged at `trace` level.
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use etherbone_protocol::{Address, Frame, Record, RecordKind, Width};

pub mod relay;
pub mod server;

/// The register space of a device.
///
/// Values are big-endian byte strings of exactly `width` bytes.
pub trait WishboneBus {
    /// Read `width` bytes at `address`.
    fn read(&mut self, address: Address, width: Width) -> Box<[u8]>;

    /// Write `value` at `address`. `value` has exactly `width` bytes.
    fn write(&mut self, address: Address, width: Width, value: &[u8]);
}

/// A bus shared between threads, e.g. a server and a test inspecting it.
impl<B: WishboneBus + ?Sized> WishboneBus for Arc<Mutex<B>> {
    fn read(&mut self, address: Address, width: Width) -> Box<[u8]> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read(address, width)
    }

    fn write(&mut self, address: Address, width: Width, value: &[u8]) {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(address, width, value)
    }
}

/// Byte-addressed memory. Bytes never written read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryBus {
    bytes: BTreeMap<Address, u8>,
}

impl MemoryBus {
    pub fn new() -> MemoryBus {
        MemoryBus::default()
    }

    /// Stores `bytes` at consecutive addresses starting at `address`.
    pub fn store(&mut self, address: Address, bytes: &[u8]) {
        for (offset, byte) in bytes.iter().enumerate() {
            self.bytes.insert(address.wrapping_add(offset as u64), *byte);
        }
    }

    /// Loads `len` bytes starting at `address`.
    pub fn load(&self, address: Address, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|offset| {
                self.bytes
                    .get(&address.wrapping_add(offset))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }
}

impl WishboneBus for MemoryBus {
    fn read(&mut self, address: Address, width: Width) -> Box<[u8]> {
        self.load(address, width.bytes()).into_boxed_slice()
    }

    fn write(&mut self, address: Address, width: Width, value: &[u8]) {
        debug_assert_eq!(value.len(), width.bytes());
        self.store(address, value);
    }
}

/// Performs every record of `request` on `bus`, in order, and builds the reply.
pub fn respond<B: WishboneBus + ?Sized>(request: &Frame, bus: &mut B) -> Frame {
    let records = request
        .records()
        .iter()
        .map(|record| match record.kind() {
            RecordKind::Read => {
                let data = bus.read(record.address(), record.width());
                log::trace!("Read 0x{:x}: {:02x?}", record.address(), data);
                Record::read_data(record.address(), record.width(), data)
            }
            RecordKind::Write => {
                log::trace!("Write 0x{:x}: {:02x?}", record.address(), record.payload());
                bus.write(record.address(), record.width(), record.payload());
                Record::write_ack(record.address(), record.width())
            }
        })
        .collect();
    Frame::reply(request.id(), records)
}

/// Decodes one inbound frame, performs it on `bus` and encodes the reply.
///
/// Returns `None` for anything a device does not answer: undecodable bytes and reply frames.
pub fn handle_frame<B: WishboneBus + ?Sized>(bytes: &[u8], bus: &mut B) -> Option<Vec<u8>> {
    log::trace!("Received frame: {:02x?}", bytes);
    let request = match Frame::decode(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Dropping undecodable frame: {}", e);
            return None;
        }
    };
    if request.is_reply() {
        log::warn!("Dropping reply frame {}", request.id());
        return None;
    }
    log::debug!(
        "Transaction {} with {} records",
        request.id(),
        request.records().len()
    );
    match respond(&request, bus).encode() {
        Ok(reply) => Some(reply),
        Err(e) => {
            log::error!("Cannot encode reply to transaction {}: {}", request.id(), e);
            None
        }
    }
}
