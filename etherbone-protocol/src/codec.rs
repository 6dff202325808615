//! Encoding and decoding of frames. All multi-byte fields are big-endian.
use crate::{
    error::{DecodeError, EncodeError},
    protocol::{
        Address, FLAG_REPLY, Frame, MAGIC, MAX_RECORDS, Record, RecordKind, TransactionId,
        Version, Width,
    },
};

impl Frame {
    /// Serializes the frame.
    ///
    /// Fails if the frame has no records or if any record's payload does not
    /// match the width its kind requires in this direction.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        self.validate()?;
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        buf.push(self.version().number());
        buf.push(if self.is_reply() { FLAG_REPLY } else { 0 });
        buf.extend_from_slice(&self.id().to_be_bytes());
        buf.extend_from_slice(&(self.records().len() as u16).to_be_bytes());
        for record in self.records() {
            buf.push(record.kind().code());
            buf.push(record.width().bytes() as u8);
            buf.extend_from_slice(&record.address().to_be_bytes());
            buf.extend_from_slice(record.payload());
        }
        Ok(buf)
    }

    fn validate(&self) -> Result<(), EncodeError> {
        if self.records().is_empty() {
            return Err(EncodeError::NoRecords);
        }
        if self.records().len() > MAX_RECORDS {
            return Err(EncodeError::TooManyRecords(self.records().len()));
        }
        for (index, record) in self.records().iter().enumerate() {
            let expected = if record.carries_payload(self.is_reply()) {
                record.width().bytes()
            } else {
                0
            };
            if record.payload().len() != expected {
                return Err(EncodeError::PayloadMismatch {
                    index,
                    expected,
                    got: record.payload().len(),
                });
            }
        }
        Ok(())
    }

    /// Parses exactly one frame from `bytes`.
    ///
    /// Never reads past the end of `bytes`; a short buffer yields [DecodeError::Truncated]
    /// and bytes left over after the declared records yield [DecodeError::Malformed].
    pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
        let mut reader = ByteReader::new(bytes);

        let magic = reader.u16()?;
        if magic != MAGIC {
            return Err(DecodeError::Malformed(format!(
                "Invalid magic 0x{:04x}",
                magic
            )));
        }

        let version_number = reader.u8()?;
        let version = Version::from_number(version_number)
            .ok_or(DecodeError::VersionMismatch(version_number))?;

        let flags = reader.u8()?;
        if flags & !FLAG_REPLY != 0 {
            return Err(DecodeError::Malformed(format!(
                "Unknown flags 0x{:02x}",
                flags
            )));
        }
        let reply = flags & FLAG_REPLY != 0;

        let id: TransactionId = reader.u16()?;
        let count = reader.u16()? as usize;
        if count == 0 {
            return Err(DecodeError::Malformed("Frame declares no records".to_string()));
        }

        let mut records = Vec::with_capacity(count.min(reader.remaining()));
        for _ in 0..count {
            records.push(read_record(&mut reader, reply)?);
        }

        if reader.remaining() != 0 {
            return Err(DecodeError::Malformed(format!(
                "{} trailing bytes after {} records",
                reader.remaining(),
                count
            )));
        }

        Ok(Frame::from_parts(version, reply, id, records))
    }
}

fn read_record(reader: &mut ByteReader<'_>, reply: bool) -> Result<Record, DecodeError> {
    let code = reader.u8()?;
    let kind = RecordKind::from_code(code).ok_or_else(|| {
        DecodeError::Malformed(format!("Unknown record kind 0x{:02x}", code))
    })?;
    let width_bytes = reader.u8()?;
    let width = Width::from_bytes(width_bytes as usize)
        .ok_or_else(|| DecodeError::Malformed(format!("Unsupported width {}", width_bytes)))?;
    let address: Address = reader.u64()?;

    let record = match (kind, reply) {
        (RecordKind::Read, false) => Record::read(address, width),
        (RecordKind::Write, true) => Record::write_ack(address, width),
        (RecordKind::Write, false) => Record::write(address, width, reader.take(width.bytes())?),
        (RecordKind::Read, true) => Record::read_data(address, width, reader.take(width.bytes())?),
    };
    Ok(record)
}

/// Bounds-checked big-endian reader over a byte slice.
struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> ByteReader<'a> {
        ByteReader { data, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.offset + len;
        let slice = self
            .data
            .get(self.offset..end)
            .ok_or(DecodeError::Truncated {
                needed: end,
                available: self.data.len(),
            })?;
        self.offset = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take_array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }
}
