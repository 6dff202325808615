//! # PCIe Window Transport
//!
//! For devices that expose an Etherbone mailbox inside a PCIe BAR, reachable
//! through a UIO node or a `/sys/bus/pci/devices/*/resourceN` file.
//!
//! ## Mailbox layout
//!
//! All registers are 32 bits wide, offsets are relative to the window base.
//!
//! | offset | register    | description                                           |
//! |--------|-------------|-------------------------------------------------------|
//! | 0x00   | CONTROL     | write 1 to ring the doorbell, reads 0 once replied    |
//! | 0x04   | REQUEST_LEN | length of the request frame in bytes                  |
//! | 0x08   | REPLY_LEN   | length of the reply frame in bytes                    |
//! | 0x40   | buffers     | request buffer followed by an equally sized reply one |
//!
//! Frame bytes are packed into the buffers as little-endian 32-bit words.
//! Nothing is ever lost on this medium, but the device may still hang or disappear.
use std::{
    ffi::c_void,
    fs::OpenOptions,
    io,
    num::NonZero,
    path::{Path, PathBuf},
    ptr::{NonNull, read_volatile, write_volatile},
    time::{Duration, Instant},
};

use nix::{
    sys::mman::{MapFlags, ProtFlags, mmap, munmap},
    unistd::{SysconfVar, sysconf},
};

use super::{Transport, TransportError};

pub const CONTROL_REG_OFFSET: usize = 0x00;
pub const REQUEST_LEN_REG_OFFSET: usize = 0x04;
pub const REPLY_LEN_REG_OFFSET: usize = 0x08;
pub const BUFFER_OFFSET: usize = 0x40;

/// Value written to CONTROL to hand a request to the device
pub const DOORBELL: u32 = 0x01;
/// Reads of a removed PCIe device return all ones
pub const DEVICE_GONE: u32 = 0xffff_ffff;

/// Smallest window that leaves room for a useful frame in each direction
pub const MIN_WINDOW_LEN: usize = BUFFER_OFFSET + 2 * 64;

/// 32-bit register access to a device window.
pub trait Mmio: Sized {
    /// Maps the window described by `target`.
    fn map(target: &PcieTarget) -> io::Result<Self>;

    /// Size of the window in bytes
    fn len(&self) -> usize;

    fn read32(&self, offset: usize) -> u32;

    fn write32(&mut self, offset: usize, value: u32);
}

/// Location of a mailbox window.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PcieTarget {
    /// UIO node or PCI resource file
    pub path: PathBuf,
    /// Offset of the window inside the mapped file
    pub offset: usize,
    /// Size of the window in bytes
    pub size: usize,
}

impl PcieTarget {
    pub fn new(path: impl Into<PathBuf>, offset: usize, size: usize) -> PcieTarget {
        PcieTarget {
            path: path.into(),
            offset,
            size,
        }
    }
}

/// A window of a device file mapped into the address space of this process.
pub struct MappedRegion {
    map: NonNull<c_void>,
    map_len: usize,
    /// Distance between the page-aligned mapping and the start of the window
    delta: usize,
    len: usize,
}

// The mapping is owned exclusively and only accessed through &self / &mut self.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    pub fn open(path: impl AsRef<Path>, offset: usize, len: usize) -> io::Result<MappedRegion> {
        let path = path.as_ref();
        log::debug!(
            "Opening device window: {} offset=0x{:x} len=0x{:x}",
            path.display(),
            offset,
            len
        );
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let page_size = sysconf(SysconfVar::PAGE_SIZE)?.unwrap_or(4096) as usize;
        let delta = offset % page_size;
        let map_len = NonZero::new(delta + len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Empty window"))?;
        let map_offset = (offset - delta)
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Offset out of range"))?;

        // SAFETY: The mapping is created from a file we opened read/write and
        // is unmapped exactly once in Drop.
        let map = unsafe {
            mmap(
                None,
                map_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                map_offset,
            )?
        };
        log::info!("Device window mapped successfully");

        Ok(MappedRegion {
            map,
            map_len: map_len.get(),
            delta,
            len,
        })
    }

    fn register(&self, offset: usize) -> *mut u32 {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.len,
            "Register offset 0x{:x} outside of window",
            offset
        );
        // SAFETY: Checked above to lie within the mapping.
        unsafe { self.map.as_ptr().cast::<u8>().add(self.delta + offset).cast() }
    }
}

impl Mmio for MappedRegion {
    fn map(target: &PcieTarget) -> io::Result<Self> {
        MappedRegion::open(&target.path, target.offset, target.size)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: The pointer is aligned and inside the live mapping.
        unsafe { read_volatile(self.register(offset)) }
    }

    fn write32(&mut self, offset: usize, value: u32) {
        // SAFETY: The pointer is aligned and inside the live mapping.
        unsafe { write_volatile(self.register(offset), value) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: `map` was returned by mmap with `map_len` and is not used afterwards.
        unsafe {
            if let Err(e) = munmap(self.map, self.map_len) {
                log::warn!("Failed to unmap device window: {}", e);
            }
        }
    }
}

/// Mailbox transport on top of a device window.
pub struct PcieTransport<M: Mmio = MappedRegion> {
    window: M,
    buffer_len: usize,
    awaiting_reply: bool,
}

impl<M: Mmio> PcieTransport<M> {
    pub fn new(window: M) -> Result<PcieTransport<M>, TransportError> {
        if window.len() < MIN_WINDOW_LEN {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Window of 0x{:x} bytes is smaller than the minimum of 0x{:x}",
                    window.len(),
                    MIN_WINDOW_LEN
                ),
            )));
        }
        let buffer_len = ((window.len() - BUFFER_OFFSET) / 2) & !3;
        log::debug!("PCIe mailbox with {} byte buffers", buffer_len);
        Ok(PcieTransport {
            window,
            buffer_len,
            awaiting_reply: false,
        })
    }

    pub fn window(&self) -> &M {
        &self.window
    }

    fn reply_offset(&self) -> usize {
        BUFFER_OFFSET + self.buffer_len
    }

    fn control(&self) -> Result<u32, TransportError> {
        match self.window.read32(CONTROL_REG_OFFSET) {
            DEVICE_GONE => Err(TransportError::Disconnected(
                "Device no longer responds on the PCIe bus".to_string(),
            )),
            value => Ok(value),
        }
    }

    fn poll_until_ready(&self, timeout: Duration) -> Result<(), TransportError> {
        let start = Instant::now();
        loop {
            if self.control()? == 0 {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(TransportError::Timeout);
            }
            std::hint::spin_loop();
        }
    }
}

impl<M: Mmio> Transport for PcieTransport<M> {
    type Target = PcieTarget;

    fn open(target: &PcieTarget) -> Result<Self, TransportError> {
        PcieTransport::new(M::map(target)?)
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.len() > self.buffer_len {
            return Err(TransportError::FrameTooLarge {
                max: self.buffer_len,
                got: bytes.len(),
            });
        }
        // The device may still be reading the previous request
        if self.control()? != 0 {
            log::debug!("PCIe mailbox busy, request not sent");
            return Err(TransportError::Timeout);
        }
        log::trace!("PCIe request: {:02x?}", bytes);

        for (index, chunk) in bytes.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.window
                .write32(BUFFER_OFFSET + index * 4, u32::from_le_bytes(word));
        }
        self.window
            .write32(REQUEST_LEN_REG_OFFSET, bytes.len() as u32);
        self.window.write32(CONTROL_REG_OFFSET, DOORBELL);
        self.awaiting_reply = true;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.awaiting_reply {
            // The device only ever speaks when spoken to
            std::thread::sleep(timeout);
            return Err(TransportError::Timeout);
        }
        self.poll_until_ready(timeout)?;
        self.awaiting_reply = false;

        let len = self.window.read32(REPLY_LEN_REG_OFFSET) as usize;
        if len > self.buffer_len {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Device reported a reply of {} bytes in a {} byte buffer",
                    len, self.buffer_len
                ),
            )));
        }

        let mut reply = Vec::with_capacity(len.next_multiple_of(4));
        for index in 0..len.div_ceil(4) {
            let word = self.window.read32(self.reply_offset() + index * 4);
            reply.extend_from_slice(&word.to_le_bytes());
        }
        reply.truncate(len);
        log::trace!("PCIe reply: {:02x?}", reply);
        Ok(reply)
    }

    fn max_frame_len(&self) -> usize {
        self.buffer_len
    }
}
