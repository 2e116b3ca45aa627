// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Wire codec for the two KTP message kinds.
//
// Both kinds are single datagrams with a one-byte ASCII tag. The numeric
// header fields are *not* packed binary: each is a run of ASCII '0'/'1'
// characters, most-significant bit first. Peers depend on this exact
// encoding, so the codec reproduces it bit for bit.
//
//   DATA  '1' | seq (8 chars) | payload length (10 chars) | payload
//   ACK   '0' | seq (8 chars) | advertised window (4 chars)
//
// Parsing is strict: short datagrams, unknown tags, non-'0'/'1' header
// bytes, and length fields that overrun the datagram are all rejected.
// Callers discard rejected datagrams silently; recovery is the sender's
// retransmission, never a reply.

use crate::config::MAX_MSG_SIZE;

/// Tag byte of a DATA message.
pub const DATA_TAG: u8 = b'1';
/// Tag byte of an ACK message.
pub const ACK_TAG: u8 = b'0';

/// Header length of a DATA message; the payload follows immediately.
pub const DATA_HEADER_LEN: usize = 19;
/// Total length of an ACK message.
pub const ACK_LEN: usize = 13;

/// Largest datagram the protocol ever produces.
pub const MAX_DATAGRAM: usize = DATA_HEADER_LEN + MAX_MSG_SIZE;

mod field {
    use std::ops::Range;

    pub const SEQ: Range<usize> = 1..9;
    pub const DATA_LEN: Range<usize> = 9..19;
    pub const ACK_WINDOW: Range<usize> = 9..13;
}

/// A parse failure. The receiver treats every variant the same way
/// (drop the datagram), so no further detail is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Datagram shorter than its header, or payload shorter than the
    /// length field claims.
    Truncated,
    /// First byte is neither the DATA nor the ACK tag.
    UnknownTag(u8),
    /// A header field byte outside '0'/'1'.
    BadDigit,
    /// Length field exceeds the maximum payload size.
    BadLength(u16),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Truncated => write!(f, "truncated datagram"),
            FrameError::UnknownTag(t) => write!(f, "unknown tag byte 0x{t:02x}"),
            FrameError::BadDigit => write!(f, "non-binary digit in header field"),
            FrameError::BadLength(l) => write!(f, "length field {l} exceeds maximum"),
        }
    }
}

impl std::error::Error for FrameError {}

/// A decoded datagram, borrowing the payload from the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Data { seq: u8, payload: &'a [u8] },
    Ack { seq: u8, window: u8 },
}

impl<'a> Frame<'a> {
    /// Decode one datagram.
    pub fn parse(buf: &'a [u8]) -> Result<Frame<'a>, FrameError> {
        let tag = *buf.first().ok_or(FrameError::Truncated)?;
        match tag {
            DATA_TAG => {
                if buf.len() < DATA_HEADER_LEN {
                    return Err(FrameError::Truncated);
                }
                let seq = read_bits(&buf[field::SEQ])? as u8;
                let len = read_bits(&buf[field::DATA_LEN])?;
                if len as usize > MAX_MSG_SIZE {
                    return Err(FrameError::BadLength(len));
                }
                let end = DATA_HEADER_LEN + len as usize;
                if buf.len() < end {
                    return Err(FrameError::Truncated);
                }
                Ok(Frame::Data {
                    seq,
                    payload: &buf[DATA_HEADER_LEN..end],
                })
            }
            ACK_TAG => {
                if buf.len() < ACK_LEN {
                    return Err(FrameError::Truncated);
                }
                let seq = read_bits(&buf[field::SEQ])? as u8;
                let window = read_bits(&buf[field::ACK_WINDOW])? as u8;
                Ok(Frame::Ack { seq, window })
            }
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

/// Encode a DATA message into `out`.
///
/// # Panics
/// Panics if `payload` exceeds [`MAX_MSG_SIZE`]; the send path checks the
/// length before a payload ever reaches a buffer slot.
pub fn encode_data(seq: u8, payload: &[u8], out: &mut Vec<u8>) {
    assert!(payload.len() <= MAX_MSG_SIZE);
    out.clear();
    out.resize(DATA_HEADER_LEN, 0);
    out[0] = DATA_TAG;
    put_bits(&mut out[field::SEQ], seq as u16);
    put_bits(&mut out[field::DATA_LEN], payload.len() as u16);
    out.extend_from_slice(payload);
}

/// Encode an ACK message. `window` must fit the 4-bit field.
pub fn encode_ack(seq: u8, window: u8) -> [u8; ACK_LEN] {
    debug_assert!(window < 16);
    let mut out = [0u8; ACK_LEN];
    out[0] = ACK_TAG;
    put_bits(&mut out[field::SEQ], seq as u16);
    put_bits(&mut out[field::ACK_WINDOW], window as u16);
    out
}

/// Write `value` into `out` as ASCII '0'/'1', most-significant bit first,
/// one bit per byte of `out`.
fn put_bits(out: &mut [u8], value: u16) {
    let width = out.len();
    for (i, b) in out.iter_mut().enumerate() {
        *b = b'0' + ((value >> (width - 1 - i)) & 1) as u8;
    }
}

/// Read an ASCII '0'/'1' run, most-significant bit first.
fn read_bits(buf: &[u8]) -> Result<u16, FrameError> {
    let mut value = 0u16;
    for &b in buf {
        match b {
            b'0' => value <<= 1,
            b'1' => value = (value << 1) | 1,
            _ => return Err(FrameError::BadDigit),
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_header_is_ascii_binary() {
        let mut out = Vec::new();
        encode_data(5, b"hello", &mut out);
        assert_eq!(out.len(), DATA_HEADER_LEN + 5);
        assert_eq!(out[0], b'1');
        assert_eq!(&out[1..9], b"00000101");
        assert_eq!(&out[9..19], b"0000000101");
        assert_eq!(&out[19..], b"hello");
    }

    #[test]
    fn ack_is_thirteen_ascii_bytes() {
        let out = encode_ack(200, 3);
        assert_eq!(out.len(), ACK_LEN);
        assert_eq!(out[0], b'0');
        assert_eq!(&out[1..9], b"11001000");
        assert_eq!(&out[9..13], b"0011");
    }

    #[test]
    fn data_round_trip() {
        let mut out = Vec::new();
        encode_data(255, &[0xABu8; MAX_MSG_SIZE], &mut out);
        match Frame::parse(&out).unwrap() {
            Frame::Data { seq, payload } => {
                assert_eq!(seq, 255);
                assert_eq!(payload.len(), MAX_MSG_SIZE);
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn ack_round_trip() {
        let out = encode_ack(17, 10);
        assert_eq!(Frame::parse(&out).unwrap(), Frame::Ack { seq: 17, window: 10 });
    }

    #[test]
    fn zero_length_payload() {
        let mut out = Vec::new();
        encode_data(0, b"", &mut out);
        match Frame::parse(&out).unwrap() {
            Frame::Data { seq: 0, payload } => assert!(payload.is_empty()),
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn rejects_short_and_malformed() {
        assert_eq!(Frame::parse(b""), Err(FrameError::Truncated));
        assert_eq!(Frame::parse(b"1"), Err(FrameError::Truncated));
        assert_eq!(Frame::parse(b"x0000000000000000000"), Err(FrameError::UnknownTag(b'x')));

        // ACK with a stray byte in the window field
        let mut ack = encode_ack(1, 1);
        ack[10] = b'7';
        assert_eq!(Frame::parse(&ack), Err(FrameError::BadDigit));

        // DATA whose length field overruns the datagram
        let mut data = Vec::new();
        encode_data(1, b"abcdef", &mut data);
        data.truncate(DATA_HEADER_LEN + 3);
        assert_eq!(Frame::parse(&data), Err(FrameError::Truncated));
    }

    #[test]
    fn rejects_oversized_length_field() {
        let mut data = Vec::new();
        encode_data(1, b"", &mut data);
        // forge length = 1023
        for b in &mut data[9..19] {
            *b = b'1';
        }
        assert_eq!(Frame::parse(&data), Err(FrameError::BadLength(1023)));
    }

    #[test]
    fn trailing_garbage_is_ignored() {
        let mut out = Vec::new();
        encode_data(9, b"abc", &mut out);
        out.extend_from_slice(b"zzzz");
        match Frame::parse(&out).unwrap() {
            Frame::Data { payload, .. } => assert_eq!(payload, b"abc"),
            other => panic!("parsed {other:?}"),
        }
    }
}
