// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Byte-exact wire format vectors. The header fields are ASCII
// '0'/'1' runs, most-significant bit first — peers depend on the exact
// bytes, so these are spelled out literally.

use ktp::wire::{encode_ack, encode_data, Frame, FrameError, ACK_LEN, DATA_HEADER_LEN};

#[test]
fn data_message_exact_bytes() {
    let mut out = Vec::new();
    encode_data(5, b"hello", &mut out);

    // tag, 8-bit sequence, 10-bit length, payload
    let expected: &[u8] = b"1000001010000000101hello";
    assert_eq!(out, expected);
}

#[test]
fn data_message_max_values() {
    let payload = vec![b'x'; 512];
    let mut out = Vec::new();
    encode_data(255, &payload, &mut out);

    assert_eq!(&out[..DATA_HEADER_LEN], b"1111111111000000000".as_slice());
    assert_eq!(out.len(), DATA_HEADER_LEN + 512);
}

#[test]
fn ack_message_exact_bytes() {
    // ACK of sequence 9 advertising a window of 10.
    assert_eq!(&encode_ack(9, 10), b"0000010011010");
    // ACK of sequence 255 advertising a closed window.
    assert_eq!(&encode_ack(255, 0), b"0111111110000");
}

#[test]
fn parse_matches_encode() {
    let mut out = Vec::new();
    encode_data(73, b"the quick brown fox", &mut out);
    assert_eq!(
        Frame::parse(&out).unwrap(),
        Frame::Data {
            seq: 73,
            payload: b"the quick brown fox",
        }
    );

    let ack = encode_ack(73, 7);
    assert_eq!(Frame::parse(&ack).unwrap(), Frame::Ack { seq: 73, window: 7 });
}

#[test]
fn foreign_datagrams_are_rejected() {
    // Shorter than any header.
    assert_eq!(Frame::parse(b"1010"), Err(FrameError::Truncated));
    // Random UDP traffic with a plausible length.
    let noise = [0xA5u8; 32];
    assert!(Frame::parse(&noise).is_err());
    // Correct tag, corrupt digits.
    let mut ack = *b"0000010011010";
    ack[4] = 0x00;
    assert_eq!(Frame::parse(&ack), Err(FrameError::BadDigit));
    assert_eq!(ack.len(), ACK_LEN);
}
