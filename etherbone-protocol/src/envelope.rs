//! Tunnel envelope spoken with a UART proxy relay.
//!
//! The relay bridges a socket to a serial link and has no notion of frame boundaries,
//! so every frame is wrapped as `tag (0xa5) | length: u16 BE | payload`.
use crate::error::{DecodeError, EncodeError};

/// Marker byte that starts every envelope
pub const ENVELOPE_TAG: u8 = 0xa5;
/// Length of the envelope header in bytes
pub const ENVELOPE_HEADER_LEN: usize = 3;
/// Largest payload the length field can describe
pub const MAX_ENVELOPE_PAYLOAD: usize = u16::MAX as usize;

/// Wraps `payload` in an envelope and appends it to `buf`.
pub fn encode_into(payload: &[u8], buf: &mut Vec<u8>) -> Result<(), EncodeError> {
    if payload.len() > MAX_ENVELOPE_PAYLOAD {
        return Err(EncodeError::EnvelopeTooLarge {
            max: MAX_ENVELOPE_PAYLOAD,
            got: payload.len(),
        });
    }
    buf.reserve(ENVELOPE_HEADER_LEN + payload.len());
    buf.push(ENVELOPE_TAG);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(())
}

/// Wraps `payload` in an envelope.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    encode_into(payload, &mut buf)?;
    Ok(buf)
}

/// Attempts to parse one envelope from the start of `buf`.
///
/// Returns `Ok(None)` while the envelope is incomplete. On success the payload
/// is returned together with the total number of bytes the envelope occupies.
pub fn decode(buf: &[u8], max_payload: usize) -> Result<Option<(&[u8], usize)>, DecodeError> {
    let Some(&tag) = buf.first() else {
        return Ok(None);
    };
    if tag != ENVELOPE_TAG {
        return Err(DecodeError::Malformed(format!(
            "Invalid envelope tag 0x{:02x}",
            tag
        )));
    }
    if buf.len() < ENVELOPE_HEADER_LEN {
        return Ok(None);
    }
    let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    if len > max_payload {
        return Err(DecodeError::Malformed(format!(
            "Envelope payload of {} bytes exceeds maximum of {}",
            len, max_payload
        )));
    }
    let total = ENVELOPE_HEADER_LEN + len;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some((&buf[ENVELOPE_HEADER_LEN..total], total)))
}

#[cfg(feature = "tokio")]
mod tokio_codec {
    use std::io;

    use bytes::{Buf, BufMut, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use super::{ENVELOPE_HEADER_LEN, MAX_ENVELOPE_PAYLOAD, decode};

    /// Envelope framing for async byte streams.
    #[derive(Debug, Clone)]
    pub struct EnvelopeCodec {
        max_payload: usize,
    }

    impl EnvelopeCodec {
        pub fn new(max_payload: usize) -> EnvelopeCodec {
            EnvelopeCodec {
                max_payload: max_payload.min(MAX_ENVELOPE_PAYLOAD),
            }
        }
    }

    impl Default for EnvelopeCodec {
        fn default() -> Self {
            Self::new(MAX_ENVELOPE_PAYLOAD)
        }
    }

    impl Decoder for EnvelopeCodec {
        type Item = BytesMut;
        type Error = io::Error;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, io::Error> {
            let total = match decode(src, self.max_payload) {
                Ok(Some((_, total))) => total,
                Ok(None) => return Ok(None),
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            };
            let mut envelope = src.split_to(total);
            envelope.advance(ENVELOPE_HEADER_LEN);
            Ok(Some(envelope))
        }
    }

    impl Encoder<&[u8]> for EnvelopeCodec {
        type Error = io::Error;

        fn encode(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<(), io::Error> {
            if payload.len() > self.max_payload {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "Envelope payload of {} bytes exceeds maximum of {}",
                        payload.len(),
                        self.max_payload
                    ),
                ));
            }
            dst.reserve(ENVELOPE_HEADER_LEN + payload.len());
            dst.put_u8(super::ENVELOPE_TAG);
            dst.put_u16(payload.len() as u16);
            dst.put_slice(payload);
            Ok(())
        }
    }

}

#[cfg(feature = "tokio")]
pub use tokio_codec::EnvelopeCodec;
