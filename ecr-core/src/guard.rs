//! Duplicate/ordering guard: CRC check plus comparison with the last accepted
//! frame, so a frame replayed after a lost ACK is acknowledged but not
//! delivered twice.

use tracing::warn;

use crate::wire::{self, Frame, FrameDecodeError, ACK, NAK};

/// Outcome of inspecting a completed frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// New frame; deliver the payload.
    Accepted(Frame),
    /// Byte-identical replay of the last accepted frame.
    Repeated { seq: u8, frame_type: u8 },
    /// Same sequence number as the last accepted frame, different content.
    Conflict { seq: u8, frame_type: u8 },
    /// CRC mismatch or malformed body.
    Corrupt(FrameDecodeError),
}

impl Verdict {
    /// Control sequence to send back to the peer.
    pub fn reply(&self) -> [u8; 2] {
        match self {
            Verdict::Accepted(_) | Verdict::Repeated { .. } => ACK,
            Verdict::Conflict { .. } | Verdict::Corrupt(_) => NAK,
        }
    }
}

#[derive(Debug, Default)]
pub struct DuplicateGuard {
    last_accepted: Option<Vec<u8>>,
}

impl DuplicateGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the last accepted frame (link reset).
    pub fn reset(&mut self) {
        self.last_accepted = None;
    }

    /// Sequence number of the last accepted frame, if any.
    pub fn last_seq(&self) -> Option<u8> {
        self.last_accepted.as_ref().map(|body| body[0])
    }

    /// Validate `body` (unescaped, CRC included) and decide what to do with it.
    pub fn inspect(&mut self, body: Vec<u8>) -> Verdict {
        let frame = match wire::decode_frame(&body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Rejecting frame");
                return Verdict::Corrupt(e);
            }
        };
        match &self.last_accepted {
            Some(last) if last[0] == frame.seq => {
                if *last == body {
                    warn!(
                        seq = format_args!("{:02X}", body[0]),
                        frame_type = format_args!("{:02X}", body[1]),
                        "Repeated frame"
                    );
                    Verdict::Repeated {
                        seq: body[0],
                        frame_type: body[1],
                    }
                } else {
                    warn!(
                        seq = format_args!("{:02X}", body[0]),
                        frame_type = format_args!("{:02X}", body[1]),
                        "Different frame, same sequence number"
                    );
                    Verdict::Conflict {
                        seq: body[0],
                        frame_type: body[1],
                    }
                }
            }
            _ => {
                self.last_accepted = Some(body);
                Verdict::Accepted(frame)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_wire, encode_frame, FrameType};

    fn body(seq: u8, payload: &[u8]) -> Vec<u8> {
        // Rebuild the unescaped body the receiver would produce.
        let wire = encode_frame(seq, FrameType::TerminalToEcr, payload).unwrap();
        let frame = decode_wire(&wire).unwrap();
        let mut out = vec![frame.seq, frame.frame_type.to_byte()];
        out.extend_from_slice(&frame.payload);
        out.extend_from_slice(&crate::integrity::crc16_bytes(&out));
        out
    }

    #[test]
    fn first_frame_accepted() {
        let mut guard = DuplicateGuard::new();
        let verdict = guard.inspect(body(1, b"{\"A\":{}}"));
        assert!(matches!(verdict, Verdict::Accepted(ref f) if f.seq == 1));
        assert_eq!(verdict.reply(), ACK);
        assert_eq!(guard.last_seq(), Some(1));
    }

    #[test]
    fn replay_is_repeated() {
        let mut guard = DuplicateGuard::new();
        guard.inspect(body(4, b"{\"A\":{}}"));
        let verdict = guard.inspect(body(4, b"{\"A\":{}}"));
        assert_eq!(verdict, Verdict::Repeated { seq: 4, frame_type: 0x91 });
        assert_eq!(verdict.reply(), ACK);
    }

    #[test]
    fn same_seq_different_content_conflicts() {
        let mut guard = DuplicateGuard::new();
        guard.inspect(body(4, b"{\"A\":{}}"));
        let verdict = guard.inspect(body(4, b"{\"B\":{}}"));
        assert_eq!(verdict, Verdict::Conflict { seq: 4, frame_type: 0x91 });
        assert_eq!(verdict.reply(), NAK);
        // the first frame stays the reference
        let again = guard.inspect(body(4, b"{\"A\":{}}"));
        assert!(matches!(again, Verdict::Repeated { .. }));
    }

    #[test]
    fn new_sequence_replaces_reference() {
        let mut guard = DuplicateGuard::new();
        guard.inspect(body(1, b"{\"A\":{}}"));
        assert!(matches!(guard.inspect(body(2, b"{\"A\":{}}")), Verdict::Accepted(_)));
        assert!(matches!(guard.inspect(body(1, b"{\"A\":{}}")), Verdict::Accepted(_)));
    }

    #[test]
    fn bad_crc_is_corrupt_and_not_stored() {
        let mut guard = DuplicateGuard::new();
        let mut b = body(3, b"{\"A\":{}}");
        let last = b.len() - 1;
        b[last] ^= 0xFF;
        let verdict = guard.inspect(b);
        assert!(matches!(verdict, Verdict::Corrupt(FrameDecodeError::CrcMismatch { .. })));
        assert_eq!(verdict.reply(), NAK);
        assert_eq!(guard.last_seq(), None);
    }

    #[test]
    fn reset_forgets_last_frame() {
        let mut guard = DuplicateGuard::new();
        guard.inspect(body(5, b"{\"A\":{}}"));
        guard.reset();
        assert!(matches!(guard.inspect(body(5, b"{\"A\":{}}")), Verdict::Accepted(_)));
    }
}
