//! # Etherbone Protocol Library
//!
//! This crate provides the wire format used to access registers on a remote
//! [Wishbone](https://en.wikipedia.org/wiki/Wishbone_(computer_bus)) bus, independent of
//! the medium that carries the bytes (UDP, a PCIe memory window or a UART behind a proxy relay).
//!
//! ## Overview
//!
//! A [`Frame`] groups one or more [`Record`]s under a transaction identifier.
//! Each record is a single bus access: a read or a write of 1, 2, 4 or 8 bytes at a 64-bit address.
//! The device answers every request frame with a reply frame carrying the same identifier
//! and one record per request record, in the same order.
//!
//! ## Basic Usage
//!
//! ### Encoding a request
//!
//! ```
//! use etherbone_protocol::{Frame, Record, Width};
//!
//! let frame = Frame::request(
//!     1,
//!     vec![
//!         Record::write(0x1000, Width::Word, 0xcafe_f00d_u32.to_be_bytes()),
//!         Record::read(0x1004, Width::Word),
//!     ],
//! );
//! let bytes = frame.encode().expect("Frame is well-formed");
//! assert_eq!(bytes.len(), frame.encoded_len());
//! ```
//!
//! ### Decoding a reply
//!
//! ```
//! use etherbone_protocol::{Frame, Record, Width};
//!
//! let reply = Frame::reply(1, vec![Record::read_data(0x1004, Width::Byte, vec![0x2a])]);
//! let bytes = reply.encode().expect("Frame is well-formed");
//!
//! let decoded = Frame::decode(&bytes).expect("Frame should parse");
//! assert!(decoded.is_reply());
//! assert_eq!(decoded.records()[0].payload(), &[0x2a]);
//! ```
//!
//! ## Message Format
//!
//! All fields are big-endian.
//!
//! - **Frame header** (8 bytes): `magic: u16 = 0x4e6f`, `version: u8`, `flags: u8` (bit 0: reply),
//!   `transaction id: u16`, `record count: u16`
//! - **Record** (10 bytes + payload): `kind: u8` (1: read, 2: write), `width: u8`, `address: u64`,
//!   followed by `width` payload bytes for request writes and reply reads.
//!
//! The [`envelope`] module contains the framing used to tunnel frames through a UART proxy relay.
//!
//! ## Error Handling
//!
//! Encoding fails with [`error::EncodeError`], decoding with [`error::DecodeError`].
//! Decoding never panics on arbitrary input.
//!
//! ## Features
//!
//! - `tokio`: provides [`envelope::EnvelopeCodec`] for use with `tokio_util::codec`.

pub mod protocol;
pub use protocol::*;
pub mod codec;
pub mod envelope;
pub mod error;
