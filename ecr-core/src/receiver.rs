//! Byte-level receive state machine.
//!
//! Consumes inbound bytes one at a time and reassembles them into unescaped
//! frame bodies or ACK/NAK control events. CRC and duplicate checks happen
//! later, in [`crate::guard`].

use tracing::{debug, warn};

use crate::wire::{FrameType, END_FRAME, ESCAPE, FRAME_ACK, FRAME_NAK, MAX_FRAME_LEN, START_FRAME};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// Between frames.
    Idle,
    /// Escape seen between frames.
    IdleEscape,
    /// Expecting the sequence number.
    SeqNo,
    /// Escape seen where the sequence number was expected.
    SeqNoEscape,
    /// Expecting the direction marker.
    Type,
    /// Collecting payload and CRC bytes.
    InfoFrame,
    /// Escape seen inside the frame body.
    InfoFrameEscape,
}

/// Something the coordinator has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    /// Peer acknowledged our in-flight frame.
    Acknowledged,
    /// Peer rejected our in-flight frame.
    Rejected,
    /// End marker seen; unescaped body (sequence, type, payload, CRC).
    FrameComplete(Vec<u8>),
    /// Direction marker we do not accept; answer with NAK.
    UnsupportedFrameType(u8),
    /// Frame body grew past [`MAX_FRAME_LEN`]; answer with NAK.
    Overflow,
}

#[derive(Debug, Clone)]
pub struct FrameReceiver {
    state: ReceiveState,
    buffer: Vec<u8>,
    inbound: FrameType,
}

impl FrameReceiver {
    /// Receiver accepting information frames marked `inbound`.
    pub fn new(inbound: FrameType) -> Self {
        Self {
            state: ReceiveState::Idle,
            buffer: Vec::new(),
            inbound,
        }
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// Drop any partial frame and return to idle.
    pub fn reset(&mut self) {
        self.change_state(ReceiveState::Idle);
    }

    fn change_state(&mut self, next: ReceiveState) {
        if next == ReceiveState::Idle {
            self.buffer.clear();
        }
        self.state = next;
    }

    /// Feed one byte. Returns an event when the byte completes one.
    pub fn feed(&mut self, byte: u8) -> Option<ReceiveEvent> {
        match self.state {
            ReceiveState::Idle => {
                if byte == ESCAPE {
                    self.change_state(ReceiveState::IdleEscape);
                } else {
                    warn!(byte = format_args!("{:02X}", byte), "Undecodable data");
                }
                None
            }
            ReceiveState::IdleEscape => match byte {
                START_FRAME => {
                    self.buffer.clear();
                    self.change_state(ReceiveState::SeqNo);
                    None
                }
                FRAME_ACK => {
                    self.change_state(ReceiveState::Idle);
                    Some(ReceiveEvent::Acknowledged)
                }
                FRAME_NAK => {
                    self.change_state(ReceiveState::Idle);
                    Some(ReceiveEvent::Rejected)
                }
                _ => {
                    self.change_state(ReceiveState::Idle);
                    None
                }
            },
            ReceiveState::SeqNo => {
                if byte == ESCAPE {
                    self.change_state(ReceiveState::SeqNoEscape);
                } else {
                    self.buffer.push(byte);
                    self.change_state(ReceiveState::Type);
                }
                None
            }
            ReceiveState::SeqNoEscape => {
                if byte == ESCAPE {
                    self.buffer.push(byte);
                    self.change_state(ReceiveState::Type);
                } else {
                    warn!(byte = format_args!("{:02X}", byte), "Ignoring unsupported escape sequence");
                    self.change_state(ReceiveState::SeqNo);
                }
                None
            }
            ReceiveState::Type => {
                if FrameType::from_byte(byte) == Some(self.inbound) {
                    self.buffer.push(byte);
                    self.change_state(ReceiveState::InfoFrame);
                    None
                } else {
                    warn!(frame_type = format_args!("{:02X}", byte), "Unsupported frame type");
                    self.change_state(ReceiveState::Idle);
                    Some(ReceiveEvent::UnsupportedFrameType(byte))
                }
            }
            ReceiveState::InfoFrame => {
                if byte == ESCAPE {
                    self.change_state(ReceiveState::InfoFrameEscape);
                    None
                } else {
                    self.push_body(byte)
                }
            }
            ReceiveState::InfoFrameEscape => match byte {
                ESCAPE => {
                    self.change_state(ReceiveState::InfoFrame);
                    self.push_body(byte)
                }
                END_FRAME => {
                    let body = std::mem::take(&mut self.buffer);
                    self.change_state(ReceiveState::Idle);
                    Some(ReceiveEvent::FrameComplete(body))
                }
                FRAME_ACK => {
                    // ACK interleaved with an information frame still counts.
                    self.change_state(ReceiveState::InfoFrame);
                    Some(ReceiveEvent::Acknowledged)
                }
                START_FRAME => {
                    debug!(discarded = self.buffer.len(), "New frame, discarding incomplete frame");
                    self.buffer.clear();
                    self.change_state(ReceiveState::SeqNo);
                    None
                }
                _ => {
                    warn!(byte = format_args!("{:02X}", byte), "Ignoring unsupported escape sequence");
                    self.change_state(ReceiveState::InfoFrame);
                    None
                }
            },
        }
    }

    fn push_body(&mut self, byte: u8) -> Option<ReceiveEvent> {
        if self.buffer.len() >= MAX_FRAME_LEN {
            warn!(len = self.buffer.len(), "Frame too long, discarding");
            self.change_state(ReceiveState::Idle);
            return Some(ReceiveEvent::Overflow);
        }
        self.buffer.push(byte);
        None
    }

    /// Feed a chunk of bytes and collect every event, in order.
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> Vec<ReceiveEvent> {
        bytes.iter().filter_map(|&b| self.feed(b)).collect()
    }
}
