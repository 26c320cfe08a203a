//! Send queue and retry scheduler: strictly FIFO, at most one frame in flight.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, warn};

use crate::wire::FrameType;

/// Transmissions per frame before it is given up.
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// Time to wait for ACK/NAK after a frame has left the wire.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(350);

/// Baud rate used to estimate how long a frame takes to transmit.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Bits on the wire per byte (8N1).
const BITS_PER_BYTE: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub ack_timeout: Duration,
    /// `0` disables the wire time allowance.
    pub baud_rate: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl RetryPolicy {
    /// Resend threshold for a frame of `len` wire bytes.
    pub fn resend_after(&self, len: usize) -> Duration {
        if self.baud_rate == 0 {
            return self.ack_timeout;
        }
        let wire_ms = (len as u64 * BITS_PER_BYTE * 1000) / u64::from(self.baud_rate);
        self.ack_timeout + Duration::from_millis(wire_ms)
    }
}

/// An encoded frame waiting for its turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub seq: u8,
    pub frame_type: FrameType,
    pub wire: Vec<u8>,
}

/// The frame currently on the wire.
#[derive(Debug)]
struct InFlight {
    frame: OutboundFrame,
    /// Transmissions so far (1 after the first send).
    tries: u32,
    since_sent: Duration,
    resend_after: Duration,
}

/// What the host has to do after a queue operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// Write these bytes to the channel.
    Transmit(Vec<u8>),
    /// Frame given up after exhausting its tries; the message is lost.
    Dropped { seq: u8, frame_type: FrameType },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub transmitted: u64,
    pub retransmitted: u64,
    pub acknowledged: u64,
    pub dropped: u64,
}

#[derive(Debug)]
pub struct SendQueue {
    policy: RetryPolicy,
    in_flight: Option<InFlight>,
    pending: VecDeque<OutboundFrame>,
    stats: QueueStats,
}

impl SendQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            in_flight: None,
            pending: VecDeque::new(),
            stats: QueueStats::default(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    /// Frames queued behind the in-flight one.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Sequence number of the frame awaiting ACK/NAK.
    pub fn in_flight_seq(&self) -> Option<u8> {
        self.in_flight.as_ref().map(|f| f.frame.seq)
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Queue a frame; it goes out immediately when nothing is in flight.
    pub fn enqueue(&mut self, frame: OutboundFrame) -> Vec<QueueEvent> {
        self.pending.push_back(frame);
        if self.in_flight.is_none() {
            self.send_next().into_iter().collect()
        } else {
            Vec::new()
        }
    }

    /// Time until the in-flight frame must be resent, if any is in flight.
    pub fn time_until_resend(&self) -> Option<Duration> {
        self.in_flight
            .as_ref()
            .map(|f| f.resend_after.saturating_sub(f.since_sent))
    }

    /// Advance the clock by `elapsed`; resend or drop the head frame when its
    /// timeout has run out.
    pub fn tick(&mut self, elapsed: Duration) -> Vec<QueueEvent> {
        let due = match &mut self.in_flight {
            Some(f) => {
                f.since_sent += elapsed;
                f.since_sent >= f.resend_after
            }
            None => false,
        };
        if due {
            self.resend()
        } else {
            Vec::new()
        }
    }

    fn resend(&mut self) -> Vec<QueueEvent> {
        let max_tries = self.policy.max_tries;
        let Some(f) = self.in_flight.as_mut() else {
            return Vec::new();
        };
        if f.tries >= max_tries {
            return self.give_up();
        }
        f.tries += 1;
        f.since_sent = Duration::ZERO;
        self.stats.retransmitted += 1;
        debug!(seq = f.frame.seq, tries = f.tries, "Resending frame");
        vec![QueueEvent::Transmit(f.frame.wire.clone())]
    }

    /// Drop the in-flight frame and move on to the next one.
    fn give_up(&mut self) -> Vec<QueueEvent> {
        let mut events = Vec::new();
        if let Some(f) = self.in_flight.take() {
            warn!(
                frame_type = format_args!("{:02X}", f.frame.frame_type.to_byte()),
                seq = format_args!("{:02X}", f.frame.seq),
                tries = f.tries,
                "No ACK for frame, dropping"
            );
            self.stats.dropped += 1;
            events.push(QueueEvent::Dropped {
                seq: f.frame.seq,
                frame_type: f.frame.frame_type,
            });
        }
        events.extend(self.send_next());
        events
    }

    /// Peer acknowledged: the head frame is done; start the next one.
    pub fn on_ack(&mut self) -> Vec<QueueEvent> {
        match self.in_flight.take() {
            Some(f) => {
                debug!(seq = f.frame.seq, tries = f.tries, "Frame acknowledged");
                self.stats.acknowledged += 1;
                self.send_next().into_iter().collect()
            }
            None => {
                warn!("ACK with nothing in flight");
                Vec::new()
            }
        }
    }

    /// Peer rejected the head frame. Gives up only once the try count
    /// exceeds the maximum; otherwise the timeout drives the resend (or the
    /// drop after the last try).
    pub fn on_nak(&mut self) -> Vec<QueueEvent> {
        match &self.in_flight {
            Some(f) if f.tries > self.policy.max_tries => {
                warn!(seq = f.frame.seq, "NAK after last try");
                self.give_up()
            }
            Some(f) => {
                debug!(seq = f.frame.seq, tries = f.tries, "NAK, waiting for resend timeout");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    fn send_next(&mut self) -> Option<QueueEvent> {
        debug_assert!(self.in_flight.is_none());
        let frame = self.pending.pop_front()?;
        let wire = frame.wire.clone();
        self.in_flight = Some(InFlight {
            resend_after: self.policy.resend_after(frame.wire.len()),
            frame,
            tries: 1,
            since_sent: Duration::ZERO,
        });
        self.stats.transmitted += 1;
        Some(QueueEvent::Transmit(wire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u8) -> OutboundFrame {
        OutboundFrame {
            seq,
            frame_type: FrameType::EcrToTerminal,
            wire: vec![0x10, 0x00, seq, 0x11, b'\n', 0xAA, 0xBB, 0x10, 0xFF],
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            baud_rate: 0,
            ..RetryPolicy::default()
        }
    }

    fn transmits(events: &[QueueEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, QueueEvent::Transmit(_)))
            .count()
    }

    #[test]
    fn first_frame_sent_immediately() {
        let mut q = SendQueue::new(policy());
        let events = q.enqueue(frame(1));
        assert_eq!(events, vec![QueueEvent::Transmit(frame(1).wire)]);
        assert_eq!(q.in_flight_seq(), Some(1));
    }

    #[test]
    fn second_frame_waits_for_ack() {
        let mut q = SendQueue::new(policy());
        q.enqueue(frame(1));
        assert!(q.enqueue(frame(2)).is_empty());
        assert_eq!(q.pending_len(), 1);
        let events = q.on_ack();
        assert_eq!(events, vec![QueueEvent::Transmit(frame(2).wire)]);
        assert_eq!(q.in_flight_seq(), Some(2));
        assert!(q.on_ack().is_empty());
        assert!(q.is_idle());
    }

    #[test]
    fn no_resend_before_timeout() {
        let mut q = SendQueue::new(policy());
        q.enqueue(frame(1));
        assert!(q.tick(Duration::from_millis(349)).is_empty());
        assert_eq!(q.time_until_resend(), Some(Duration::from_millis(1)));
        let events = q.tick(Duration::from_millis(1));
        assert_eq!(events, vec![QueueEvent::Transmit(frame(1).wire)]);
        assert_eq!(q.time_until_resend(), Some(DEFAULT_ACK_TIMEOUT));
    }

    #[test]
    fn unanswered_frame_sent_max_tries_then_dropped() {
        let mut q = SendQueue::new(policy());
        let mut sent = transmits(&q.enqueue(frame(1)));
        let mut dropped = Vec::new();
        for _ in 0..10 {
            for event in q.tick(DEFAULT_ACK_TIMEOUT) {
                match event {
                    QueueEvent::Transmit(_) => sent += 1,
                    QueueEvent::Dropped { seq, .. } => dropped.push(seq),
                }
            }
        }
        assert_eq!(sent, DEFAULT_MAX_TRIES as usize);
        assert_eq!(dropped, vec![1]);
        assert!(q.is_idle());
        assert_eq!(q.stats().dropped, 1);
        assert_eq!(q.stats().retransmitted, u64::from(DEFAULT_MAX_TRIES - 1));
    }

    #[test]
    fn drop_advances_to_next_frame() {
        let mut q = SendQueue::new(policy());
        q.enqueue(frame(1));
        q.enqueue(frame(2));
        q.tick(DEFAULT_ACK_TIMEOUT);
        q.tick(DEFAULT_ACK_TIMEOUT);
        let events = q.tick(DEFAULT_ACK_TIMEOUT);
        assert_eq!(
            events,
            vec![
                QueueEvent::Dropped {
                    seq: 1,
                    frame_type: FrameType::EcrToTerminal
                },
                QueueEvent::Transmit(frame(2).wire),
            ]
        );
    }

    #[test]
    fn nak_waits_for_timeout() {
        let mut q = SendQueue::new(policy());
        q.enqueue(frame(1));
        assert!(q.on_nak().is_empty());
        assert_eq!(q.in_flight_seq(), Some(1));
        assert_eq!(transmits(&q.tick(DEFAULT_ACK_TIMEOUT)), 1);
    }

    #[test]
    fn nak_after_last_try_leaves_drop_to_timeout() {
        let mut q = SendQueue::new(policy());
        q.enqueue(frame(1));
        q.enqueue(frame(2));
        q.tick(DEFAULT_ACK_TIMEOUT);
        q.tick(DEFAULT_ACK_TIMEOUT);
        // third transmission is out; a try count equal to the maximum is not exceeded
        assert!(q.on_nak().is_empty());
        assert_eq!(q.in_flight_seq(), Some(1));
        assert_eq!(q.pending_len(), 1);
        let events = q.tick(DEFAULT_ACK_TIMEOUT);
        assert_eq!(
            events,
            vec![
                QueueEvent::Dropped {
                    seq: 1,
                    frame_type: FrameType::EcrToTerminal
                },
                QueueEvent::Transmit(frame(2).wire),
            ]
        );
    }

    #[test]
    fn ack_resets_retry_count_for_next_frame() {
        let mut q = SendQueue::new(policy());
        q.enqueue(frame(1));
        q.enqueue(frame(2));
        q.tick(DEFAULT_ACK_TIMEOUT);
        q.tick(DEFAULT_ACK_TIMEOUT);
        q.on_ack();
        // frame 2 gets its own full set of tries
        assert_eq!(transmits(&q.tick(DEFAULT_ACK_TIMEOUT)), 1);
        assert_eq!(transmits(&q.tick(DEFAULT_ACK_TIMEOUT)), 1);
        assert!(matches!(
            q.tick(DEFAULT_ACK_TIMEOUT).as_slice(),
            [QueueEvent::Dropped { seq: 2, .. }]
        ));
    }

    #[test]
    fn wire_time_extends_timeout() {
        let policy = RetryPolicy {
            baud_rate: 9600,
            ..RetryPolicy::default()
        };
        // 960 bytes at 9600 baud take one second
        assert_eq!(policy.resend_after(960), DEFAULT_ACK_TIMEOUT + Duration::from_secs(1));
    }

    #[test]
    fn idle_queue_has_no_deadline() {
        let q = SendQueue::new(policy());
        assert_eq!(q.time_until_resend(), None);
    }
}
