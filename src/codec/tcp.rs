// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streaming codec for MBAP framed Modbus TCP messages.

use std::io;

use byteorder::{BigEndian, ByteOrder as _};
use bytes::{BufMut as _, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::u16_len;
use crate::{
    error::{Error, FrameError},
    frame::{Frame, Header, HEADER_SIZE, MAX_PDU_SIZE, PROTOCOL_ID},
};

/// Try to split the next frame off the front of `buf`.
///
/// Returns `Ok(None)` until a complete frame has been buffered. The header
/// is validated as soon as it is complete, so a corrupt stream is detected
/// without waiting for the announced payload.
pub fn decode(buf: &mut BytesMut, max_pdu_size: usize) -> Result<Option<Frame>, FrameError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let protocol_id = BigEndian::read_u16(&buf[2..4]);
    if protocol_id != PROTOCOL_ID {
        return Err(FrameError::InvalidProtocolId(protocol_id));
    }

    // len = bytes of PDU + one byte (unit ID)
    let len = BigEndian::read_u16(&buf[4..6]);
    if len < 2 {
        return Err(FrameError::InvalidLength(len));
    }
    let pdu_len = usize::from(len) - 1;
    if pdu_len > max_pdu_size {
        return Err(FrameError::PduTooLarge {
            size: pdu_len,
            max: max_pdu_size,
        });
    }

    let frame_len = HEADER_SIZE + pdu_len;
    if buf.len() < frame_len {
        buf.reserve(frame_len - buf.len());
        return Ok(None);
    }

    let header_data = buf.split_to(HEADER_SIZE);
    let pdu = buf.split_to(pdu_len).freeze();
    let hdr = Header {
        transaction_id: BigEndian::read_u16(&header_data[0..2]),
        unit_id: header_data[6],
    };
    Ok(Some(Frame { hdr, pdu }))
}

/// Append the wire representation of `frame` to `buf`.
pub fn encode(frame: &Frame, buf: &mut BytesMut) {
    buf.reserve(HEADER_SIZE + frame.pdu.len());
    buf.put_u16(frame.hdr.transaction_id);
    buf.put_u16(PROTOCOL_ID);
    buf.put_u16(u16_len(frame.length()));
    buf.put_u8(frame.hdr.unit_id);
    buf.put_slice(&frame.pdu);
}

/// Value of the length field, if the buffer is long enough to contain it.
fn declared_length(bytes: &[u8]) -> usize {
    bytes
        .get(4..6)
        .map_or(0, |len| usize::from(BigEndian::read_u16(len)))
}

impl TryFrom<&[u8]> for Frame {
    type Error = FrameError;

    /// Decode a buffer that must contain exactly one frame.
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let mut buf = BytesMut::from(bytes);
        match decode(&mut buf, MAX_PDU_SIZE)? {
            Some(frame) if buf.is_empty() => Ok(frame),
            _ => Err(FrameError::LengthMismatch {
                declared: declared_length(bytes),
                actual: bytes.len().saturating_sub(HEADER_SIZE - 1),
            }),
        }
    }
}

/// Codec for both directions of a Modbus TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_pdu_size: usize,
}

impl FrameCodec {
    #[must_use]
    pub const fn new(max_pdu_size: usize) -> Self {
        Self { max_pdu_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PDU_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Error> {
        Ok(decode(buf, self.max_pdu_size)?)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        if buf.len() < HEADER_SIZE {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated header").into());
        }
        Err(FrameError::LengthMismatch {
            declared: declared_length(buf),
            actual: buf.len() - (HEADER_SIZE - 1),
        }
        .into())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), Error> {
        if frame.pdu.is_empty() {
            return Err(FrameError::InvalidLength(1).into());
        }
        if frame.pdu.len() > self.max_pdu_size {
            return Err(FrameError::PduTooLarge {
                size: frame.pdu.len(),
                max: self.max_pdu_size,
            }
            .into());
        }
        encode(&frame, buf);
        Ok(())
    }
}
