//! Framing: DLE-style escapes, sequence number, direction marker, payload, CRC-16.
//!
//! Wire layout (before stuffing the body):
//! ```text
//! 10 00 | SEQ | TYPE | PAYLOAD ... 0A | CRC_HI | CRC_LO | 10 FF
//! ```
//! Every 0x10 inside the body (including the CRC bytes) is sent twice.

use crate::integrity;

pub const ESCAPE: u8 = 0x10;
pub const START_FRAME: u8 = 0x00;
pub const END_FRAME: u8 = 0xFF;
pub const FRAME_ACK: u8 = 0x11;
pub const FRAME_NAK: u8 = 0x12;

/// Control sequence acknowledging the last frame.
pub const ACK: [u8; 2] = [ESCAPE, FRAME_ACK];
/// Control sequence rejecting the last frame.
pub const NAK: [u8; 2] = [ESCAPE, FRAME_NAK];

/// Largest accepted logical frame body (sequence + type + payload + CRC).
pub const MAX_FRAME_LEN: usize = 20480;

const HEADER_LEN: usize = 2;
const CRC_LEN: usize = 2;

/// Direction marker carried in the second logical byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// ECR to terminal.
    EcrToTerminal,
    /// Terminal to ECR.
    TerminalToEcr,
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x11 => Some(FrameType::EcrToTerminal),
            0x91 => Some(FrameType::TerminalToEcr),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            FrameType::EcrToTerminal => 0x11,
            FrameType::TerminalToEcr => 0x91,
        }
    }
}

/// A validated information frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u8,
    pub frame_type: FrameType,
    /// Application bytes, line terminator included.
    pub payload: Vec<u8>,
}

/// Encode an information frame into wire bytes. A trailing `\n` is appended to
/// the payload if missing.
pub fn encode_frame(
    seq: u8,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<Vec<u8>, FrameEncodeError> {
    let mut logical = Vec::with_capacity(HEADER_LEN + payload.len() + 1 + CRC_LEN);
    logical.push(seq);
    logical.push(frame_type.to_byte());
    logical.extend_from_slice(payload);
    if payload.last() != Some(&b'\n') {
        logical.push(b'\n');
    }
    let crc = integrity::crc16_bytes(&logical);
    logical.extend_from_slice(&crc);
    if logical.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge(logical.len()));
    }

    let escapes = logical.iter().filter(|&&b| b == ESCAPE).count();
    let mut out = Vec::with_capacity(logical.len() + escapes + 4);
    out.extend_from_slice(&[ESCAPE, START_FRAME]);
    stuff_into(&logical, &mut out);
    out.extend_from_slice(&[ESCAPE, END_FRAME]);
    Ok(out)
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
}

/// Double every escape byte of `logical` into `out`.
pub fn stuff_into(logical: &[u8], out: &mut Vec<u8>) {
    for &b in logical {
        if b == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(b);
    }
}

/// Validate an unescaped frame body (sequence, type, payload, CRC) and strip the
/// wrappers.
pub fn decode_frame(logical: &[u8]) -> Result<Frame, FrameDecodeError> {
    if logical.len() < HEADER_LEN + CRC_LEN {
        return Err(FrameDecodeError::TooShort(logical.len()));
    }
    let (body, crc) = logical.split_at(logical.len() - CRC_LEN);
    let received = u16::from_be_bytes([crc[0], crc[1]]);
    let computed = integrity::crc16(body);
    if received != computed {
        return Err(FrameDecodeError::CrcMismatch {
            received,
            computed,
            seq: body[0],
            frame_type: body[1],
        });
    }
    let frame_type =
        FrameType::from_byte(body[1]).ok_or(FrameDecodeError::UnknownFrameType(body[1]))?;
    Ok(Frame {
        seq: body[0],
        frame_type,
        payload: body[HEADER_LEN..].to_vec(),
    })
}

/// Decode one complete wire frame (`10 00 ... 10 FF`) in a single call.
pub fn decode_wire(wire: &[u8]) -> Result<Frame, FrameDecodeError> {
    let body = wire
        .strip_prefix(&[ESCAPE, START_FRAME])
        .and_then(|rest| rest.strip_suffix(&[ESCAPE, END_FRAME]))
        .ok_or(FrameDecodeError::MissingDelimiters)?;
    let mut logical = Vec::with_capacity(body.len());
    let mut bytes = body.iter();
    while let Some(&b) = bytes.next() {
        if b == ESCAPE {
            match bytes.next() {
                Some(&ESCAPE) => logical.push(ESCAPE),
                Some(&other) => return Err(FrameDecodeError::BadEscape(other)),
                None => return Err(FrameDecodeError::BadEscape(END_FRAME)),
            }
        } else {
            logical.push(b);
        }
    }
    decode_frame(&logical)
}

/// Error validating a received frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    #[error("wrong CRC {received:04X}, expected {computed:04X} (type {frame_type:02X}, seq {seq:02X})")]
    CrcMismatch {
        received: u16,
        computed: u16,
        seq: u8,
        frame_type: u8,
    },
    #[error("unsupported frame type {0:02X}")]
    UnknownFrameType(u8),
    #[error("missing frame delimiters")]
    MissingDelimiters,
    #[error("unsupported escape sequence {0:02X}")]
    BadEscape(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let wire = encode_frame(1, FrameType::EcrToTerminal, b"{\"StatusRequest\":{}}").unwrap();
        assert_eq!(&wire[..4], &[ESCAPE, START_FRAME, 0x01, 0x11]);
        assert_eq!(&wire[wire.len() - 2..], &[ESCAPE, END_FRAME]);
        let frame = decode_wire(&wire).unwrap();
        assert_eq!(frame.payload, b"{\"StatusRequest\":{}}\n");
    }

    #[test]
    fn terminator_not_doubled() {
        let a = encode_frame(5, FrameType::EcrToTerminal, b"abc").unwrap();
        let b = encode_frame(5, FrameType::EcrToTerminal, b"abc\n").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_payload_gets_terminator() {
        let wire = encode_frame(2, FrameType::TerminalToEcr, b"").unwrap();
        let frame = decode_wire(&wire).unwrap();
        assert_eq!(frame.payload, b"\n");
        assert_eq!(frame.seq, 2);
        assert_eq!(frame.frame_type, FrameType::TerminalToEcr);
    }

    #[test]
    fn escape_bytes_are_stuffed() {
        let wire = encode_frame(0x10, FrameType::EcrToTerminal, &[0x10, b'x', 0x10]).unwrap();
        // seq 0x10 is stuffed right after the start marker
        assert_eq!(&wire[..4], &[ESCAPE, START_FRAME, ESCAPE, ESCAPE]);
        let frame = decode_wire(&wire).unwrap();
        assert_eq!(frame.seq, 0x10);
        assert_eq!(frame.payload, vec![0x10, b'x', 0x10, b'\n']);
    }

    #[test]
    fn roundtrip_escape_counts() {
        let payloads: [&[u8]; 3] = [b"plain text", b"one \x10 escape", b"\x10\x10\x10many\x10"];
        for payload in payloads {
            let wire = encode_frame(42, FrameType::TerminalToEcr, payload).unwrap();
            let frame = decode_wire(&wire).unwrap();
            assert_eq!(frame.seq, 42);
            assert_eq!(frame.frame_type, FrameType::TerminalToEcr);
            assert_eq!(&frame.payload[..payload.len()], payload);
        }
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let mut wire = encode_frame(3, FrameType::TerminalToEcr, b"{\"A\":{}}").unwrap();
        wire[6] ^= 0x01;
        assert!(matches!(
            decode_wire(&wire),
            Err(FrameDecodeError::CrcMismatch { seq: 3, frame_type: 0x91, .. })
        ));
    }

    #[test]
    fn short_body_rejected() {
        assert_eq!(decode_frame(&[1, 0x91, 0]), Err(FrameDecodeError::TooShort(3)));
    }

    #[test]
    fn too_large_rejected() {
        let payload = vec![b'a'; MAX_FRAME_LEN];
        assert!(matches!(
            encode_frame(1, FrameType::EcrToTerminal, &payload),
            Err(FrameEncodeError::TooLarge(_))
        ));
    }

    #[test]
    fn frame_type_bytes() {
        assert_eq!(FrameType::from_byte(0x11), Some(FrameType::EcrToTerminal));
        assert_eq!(FrameType::from_byte(0x91), Some(FrameType::TerminalToEcr));
        assert_eq!(FrameType::from_byte(0x12), None);
    }
}
