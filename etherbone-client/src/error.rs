use std::{error::Error, fmt::Display};

use etherbone_protocol::{Address, TransactionId, error::EncodeError};

use crate::transport::TransportError;

/// Coarse classification of every failure a caller can observe.
///
/// Each kind maps to a stable process exit code, see [ErrorKind::exit_code].
///
/// [ErrorKind::Decoding] and [ErrorKind::Timeout] are reserved. A session discards
/// undecodable replies and retries timed out attempts, so neither reaches a caller
/// today; their exit codes stay assigned.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Outbound data was malformed. A bug on the calling side, never retried.
    Encoding,
    /// Inbound data was malformed.
    Decoding,
    /// No reply arrived in time.
    Timeout,
    /// All retries were exhausted without a reply.
    Unreachable,
    /// The transport handle failed and must be reopened.
    TransportFailure,
    /// A block operation stopped partway.
    PartialBlockFailure,
    /// The transaction was cancelled before it completed.
    Cancelled,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Encoding,
        ErrorKind::Decoding,
        ErrorKind::Timeout,
        ErrorKind::Unreachable,
        ErrorKind::TransportFailure,
        ErrorKind::PartialBlockFailure,
        ErrorKind::Cancelled,
    ];

    /// Exit code for command line tools. These values are stable.
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Encoding => 3,
            ErrorKind::Decoding => 4,
            ErrorKind::Timeout => 5,
            ErrorKind::Unreachable => 6,
            ErrorKind::TransportFailure => 7,
            ErrorKind::PartialBlockFailure => 8,
            ErrorKind::Cancelled => 9,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let description = match self {
            ErrorKind::Encoding => "invalid request",
            ErrorKind::Decoding => "invalid reply",
            ErrorKind::Timeout => "timed out",
            ErrorKind::Unreachable => "device unreachable",
            ErrorKind::TransportFailure => "transport failure",
            ErrorKind::PartialBlockFailure => "block transfer incomplete",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(description)
    }
}

#[test]
fn exit_codes_are_distinct() {
    let mut codes: Vec<u8> = ErrorKind::ALL.iter().map(|k| k.exit_code()).collect();
    codes.sort();
    codes.dedup();
    assert_eq!(codes.len(), ErrorKind::ALL.len());
    assert!(!codes.contains(&0) && !codes.contains(&1) && !codes.contains(&2));
}

#[test]
fn transport_errors_are_failures() {
    let lost = SessionError::Transport(TransportError::Timeout);
    assert_eq!(lost.kind(), ErrorKind::TransportFailure);
    let gone = SessionError::Transport(TransportError::Disconnected("gone".to_string()));
    assert_eq!(gone.kind(), ErrorKind::TransportFailure);
}

/// Errors reported by a [crate::session::Session].
#[derive(Debug)]
pub enum SessionError {
    Encode(EncodeError),
    /// A single frame would not fit the transport.
    FrameTooLarge { max: usize, got: usize },
    /// Every transaction identifier is in use.
    NoFreeIdentifier,
    /// No reply after the initial attempt and all retries.
    Unreachable { id: TransactionId, attempts: u32 },
    /// The transport failed while this call was using it.
    Transport(TransportError),
    /// The transaction was pending when another call observed a transport failure.
    Aborted(TransactionId),
    /// The session lost its transport and has to be reopened.
    Closed,
    /// The transaction is not pending, because it was cancelled or already completed.
    UnknownTransaction(TransactionId),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Encode(_)
            | SessionError::FrameTooLarge { .. }
            | SessionError::NoFreeIdentifier => ErrorKind::Encoding,
            SessionError::Unreachable { .. } => ErrorKind::Unreachable,
            SessionError::Transport(_) | SessionError::Aborted(_) | SessionError::Closed => {
                ErrorKind::TransportFailure
            }
            SessionError::UnknownTransaction(_) => ErrorKind::Cancelled,
        }
    }
}

impl From<EncodeError> for SessionError {
    fn from(value: EncodeError) -> Self {
        SessionError::Encode(value)
    }
}

impl Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Encode(e) => write!(f, "{}", e),
            SessionError::FrameTooLarge { max, got } => write!(
                f,
                "Frame of {} bytes does not fit the transport limit of {}",
                got, max
            ),
            SessionError::NoFreeIdentifier => write!(f, "All transaction identifiers are in use"),
            SessionError::Unreachable { id, attempts } => write!(
                f,
                "No reply to transaction {} after {} attempts",
                id, attempts
            ),
            SessionError::Transport(e) => write!(f, "Transport failed: {}", e),
            SessionError::Aborted(id) => {
                write!(f, "Transaction {} aborted by a transport failure", id)
            }
            SessionError::Closed => write!(f, "Session is closed and must be reopened"),
            SessionError::UnknownTransaction(id) => {
                write!(f, "Transaction {} is not pending", id)
            }
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SessionError::Encode(e) => Some(e),
            SessionError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors reported by a [crate::RegisterClient].
#[derive(Debug)]
pub enum ClientError {
    Session(SessionError),
    /// A value does not match the requested access width.
    InvalidValue { expected: usize, got: usize },
    /// A block would run past the end of the address space.
    AddressOverflow { address: Address, count: usize },
    /// A block operation completed `completed` accesses and then failed at `address`.
    /// Completed accesses are not rolled back.
    PartialBlock {
        completed: usize,
        address: Address,
        cause: SessionError,
    },
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Session(e) => e.kind(),
            ClientError::InvalidValue { .. } | ClientError::AddressOverflow { .. } => {
                ErrorKind::Encoding
            }
            ClientError::PartialBlock { .. } => ErrorKind::PartialBlockFailure,
        }
    }
}

impl From<SessionError> for ClientError {
    fn from(value: SessionError) -> Self {
        ClientError::Session(value)
    }
}

impl Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Session(e) => write!(f, "{}", e),
            ClientError::InvalidValue { expected, got } => write!(
                f,
                "Value has {} bytes, but the access width is {}",
                got, expected
            ),
            ClientError::AddressOverflow { address, count } => write!(
                f,
                "Block of {} accesses at 0x{:x} exceeds the address space",
                count, address
            ),
            ClientError::PartialBlock {
                completed,
                address,
                cause,
            } => write!(
                f,
                "Block transfer failed at 0x{:x} after {} accesses: {}",
                address, completed, cause
            ),
        }
    }
}

impl Error for ClientError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientError::Session(e) => Some(e),
            ClientError::PartialBlock { cause, .. } => Some(cause),
            _ => None,
        }
    }
}
