use std::{error::Error, fmt::Display};

/// Errors that may occur when encoding an outbound frame.
/// These always indicate a bug on the calling side and are never retried.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EncodeError {
    NoRecords,
    TooManyRecords(usize),
    PayloadMismatch {
        index: usize,
        expected: usize,
        got: usize,
    },
    EnvelopeTooLarge {
        max: usize,
        got: usize,
    },
}

impl Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::NoRecords => write!(f, "Frame contains no records"),
            EncodeError::TooManyRecords(count) => {
                write!(f, "Frame contains {} records, more than a frame can hold", count)
            }
            EncodeError::PayloadMismatch {
                index,
                expected,
                got,
            } => write!(
                f,
                "Record {} must carry {} payload bytes, but carries {}",
                index, expected, got
            ),
            EncodeError::EnvelopeTooLarge { max, got } => {
                write!(f, "Envelope payload too large! Maximum is {}, but got {}", max, got)
            }
        }
    }
}

impl Error for EncodeError {}

/// Errors that may occur when decoding an inbound frame or envelope.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    /// Fewer bytes are available than the header and records declare.
    Truncated { needed: usize, available: usize },
    Malformed(String),
    VersionMismatch(u8),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated { needed, available } => write!(
                f,
                "Truncated frame: needed {} bytes, but only {} are available",
                needed, available
            ),
            DecodeError::Malformed(reason) => write!(f, "Malformed frame: {}", reason),
            DecodeError::VersionMismatch(version) => {
                write!(f, "Unsupported protocol version {}", version)
            }
        }
    }
}

impl Error for DecodeError {}
