use std::fmt::Display;

/// Address on the remote Wishbone bus.
/// Always transferred as 64 bits, independent of the bus width of the device.
pub type Address = u64;

/// Identifier that correlates a reply frame with its request.
pub type TransactionId = u16;

/// Magic number at the start of every frame
pub const MAGIC: u16 = 0x4e6f;
/// Length of the frame header in bytes
pub const FRAME_HEADER_LEN: usize = 8;
/// Length of a record without its payload
pub const RECORD_HEADER_LEN: usize = 10;
/// Largest number of records a single frame can declare
pub const MAX_RECORDS: usize = u16::MAX as usize;

pub(crate) const FLAG_REPLY: u8 = 0x01;

/// The version of the wire protocol.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Version(u8);

impl Version {
    /// Version 1 of the protocol
    pub const V1: Version = Version(1);

    /// Returns the latest supported version
    pub fn latest() -> Version {
        Version::V1
    }

    /// Returns the version if `number` is a version this crate understands.
    pub fn from_number(number: u8) -> Option<Version> {
        match number {
            1 => Some(Version::V1),
            _ => None,
        }
    }

    /// The version byte as it appears on the wire
    pub fn number(&self) -> u8 {
        self.0
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::V1
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Number of bytes transferred by a single bus access.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Width {
    Byte,
    Half,
    Word,
    Double,
}

impl Width {
    /// All supported widths, narrowest first.
    pub const ALL: [Width; 4] = [Width::Byte, Width::Half, Width::Word, Width::Double];

    pub fn from_bytes(bytes: usize) -> Option<Width> {
        match bytes {
            1 => Some(Width::Byte),
            2 => Some(Width::Half),
            4 => Some(Width::Word),
            8 => Some(Width::Double),
            _ => None,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
            Width::Double => 8,
        }
    }
}

impl Display for Width {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} bytes", self.bytes())
    }
}

#[test]
fn width_from_bytes() {
    for width in Width::ALL {
        assert_eq!(Width::from_bytes(width.bytes()), Some(width));
    }
    assert_eq!(Width::from_bytes(3), None);
    assert_eq!(Width::from_bytes(0), None);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RecordKind {
    Read,
    Write,
}

impl RecordKind {
    pub(crate) const CODE_READ: u8 = 0x01;
    pub(crate) const CODE_WRITE: u8 = 0x02;

    pub(crate) fn code(self) -> u8 {
        match self {
            RecordKind::Read => Self::CODE_READ,
            RecordKind::Write => Self::CODE_WRITE,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<RecordKind> {
        match code {
            Self::CODE_READ => Some(RecordKind::Read),
            Self::CODE_WRITE => Some(RecordKind::Write),
            _ => None,
        }
    }
}

/// One bus access inside a [Frame].
///
/// Whether a record carries payload depends on its kind and on the direction of
/// the frame it travels in:
/// in a request, writes carry the value to write;
/// in a reply, reads carry the value that was read and writes are bare acknowledgements.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Record {
    kind: RecordKind,
    address: Address,
    width: Width,
    payload: Box<[u8]>,
}

impl Record {
    /// A read request for `width` bytes at `address`.
    pub fn read(address: Address, width: Width) -> Record {
        Record {
            kind: RecordKind::Read,
            address,
            width,
            payload: Box::default(),
        }
    }

    /// A write request. The payload is the big-endian register value and must be `width` bytes long.
    pub fn write(address: Address, width: Width, payload: impl Into<Box<[u8]>>) -> Record {
        Record {
            kind: RecordKind::Write,
            address,
            width,
            payload: payload.into(),
        }
    }

    /// The answer to a read request, carrying the data read from the bus.
    pub fn read_data(address: Address, width: Width, data: impl Into<Box<[u8]>>) -> Record {
        Record {
            kind: RecordKind::Read,
            address,
            width,
            payload: data.into(),
        }
    }

    /// The answer to a write request.
    pub fn write_ack(address: Address, width: Width) -> Record {
        Record {
            kind: RecordKind::Write,
            address,
            width,
            payload: Box::default(),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn width(&self) -> Width {
        self.width
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Box<[u8]> {
        self.payload
    }

    /// Whether this record carries payload when sent in a request (`reply == false`) or a reply.
    pub fn carries_payload(&self, reply: bool) -> bool {
        matches!(
            (self.kind, reply),
            (RecordKind::Write, false) | (RecordKind::Read, true)
        )
    }

    /// Bytes this record occupies on the wire in the larger of its request and reply form.
    pub fn max_wire_len(&self) -> usize {
        RECORD_HEADER_LEN + self.width.bytes()
    }

    /// Whether `self`, received in a reply, answers the request record `request`.
    pub fn answers(&self, request: &Record) -> bool {
        self.kind == request.kind && self.address == request.address && self.width == request.width
    }
}

/// An ordered group of records sharing one transaction identifier.
/// Records inside a frame are executed and answered in order.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Frame {
    version: Version,
    reply: bool,
    id: TransactionId,
    records: Vec<Record>,
}

impl Frame {
    pub fn request(id: TransactionId, records: Vec<Record>) -> Frame {
        Frame {
            version: Version::latest(),
            reply: false,
            id,
            records,
        }
    }

    pub fn reply(id: TransactionId, records: Vec<Record>) -> Frame {
        Frame {
            version: Version::latest(),
            reply: true,
            id,
            records,
        }
    }

    pub(crate) fn from_parts(
        version: Version,
        reply: bool,
        id: TransactionId,
        records: Vec<Record>,
    ) -> Frame {
        Frame {
            version,
            reply,
            id,
            records,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_reply(&self) -> bool {
        self.reply
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// The exact number of bytes [Frame::encode] produces for a well-formed frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN
            + self
                .records
                .iter()
                .map(|record| {
                    if record.carries_payload(self.reply) {
                        RECORD_HEADER_LEN + record.width.bytes()
                    } else {
                        RECORD_HEADER_LEN
                    }
                })
                .sum::<usize>()
    }
}

#[test]
fn encoded_len_counts_payload_by_direction() {
    let records = vec![
        Record::read(0x10, Width::Word),
        Record::write(0x20, Width::Half, vec![0xab, 0xcd]),
    ];
    let request = Frame::request(1, records);
    assert_eq!(request.encoded_len(), FRAME_HEADER_LEN + 10 + 12);

    let reply = Frame::reply(
        1,
        vec![
            Record::read_data(0x10, Width::Word, vec![0; 4]),
            Record::write_ack(0x20, Width::Half),
        ],
    );
    assert_eq!(reply.encoded_len(), FRAME_HEADER_LEN + 14 + 10);
}
