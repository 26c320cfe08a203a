//! Host-driven API: EcrCore receives bytes and elapsed time from the host,
//! returns actions.

use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::guard::{DuplicateGuard, Verdict};
use crate::protocol::{LineAssembler, Message, StatusFlags};
use crate::receiver::{FrameReceiver, ReceiveEvent};
use crate::scheduler::{OutboundFrame, QueueEvent, QueueStats, RetryPolicy, SendQueue};
use crate::transaction::{
    FlowAction, FlowConfig, PaymentFlow, PaymentReceipt, TransactionState, WorkflowError,
};
use crate::wire::{self, FrameEncodeError, FrameType, NAK};

/// Longest the host should wait for input before calling [`EcrCore::tick`].
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_secs(1);

/// Sequence number of the first outbound frame.
const FIRST_SEQ: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub retry: RetryPolicy,
    pub idle_poll: Duration,
    pub flow: FlowConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            idle_poll: DEFAULT_IDLE_POLL,
            flow: FlowConfig::default(),
        }
    }
}

/// Action for host to perform.
#[derive(Debug)]
pub enum OutboundAction {
    /// Write these bytes to the channel, in order.
    Write(Vec<u8>),
    /// Frame dropped after exhausting its tries; the message is lost.
    DeliveryFailed { seq: u8, frame_type: FrameType },
    /// Payment finished; the host may end the session.
    Completed(PaymentReceipt),
    /// Payment failed; the host may end the session.
    Failed(WorkflowError),
}

/// One terminal link. Host passes events; core returns actions.
pub struct EcrCore {
    idle_poll: Duration,
    receiver: FrameReceiver,
    guard: DuplicateGuard,
    queue: SendQueue,
    lines: LineAssembler,
    flow: PaymentFlow,
    next_seq: u8,
    delivered: u64,
}

impl EcrCore {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            idle_poll: config.idle_poll,
            receiver: FrameReceiver::new(FrameType::TerminalToEcr),
            guard: DuplicateGuard::new(),
            queue: SendQueue::new(config.retry),
            lines: LineAssembler::default(),
            flow: PaymentFlow::new(config.flow),
            next_seq: FIRST_SEQ,
            delivered: 0,
        }
    }

    /// Begin the payment: sends the connect request.
    pub fn start(&mut self) -> Vec<OutboundAction> {
        let flow_actions = self.flow.start();
        self.apply_flow(flow_actions)
    }

    pub fn state(&self) -> TransactionState {
        self.flow.state()
    }

    pub fn status(&self) -> Option<StatusFlags> {
        self.flow.status()
    }

    pub fn is_finished(&self) -> bool {
        self.flow.is_finished()
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Payloads handed to the application layer so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Sequence number the next outbound frame will carry.
    pub fn next_seq(&self) -> u8 {
        self.next_seq
    }

    /// How long the host may wait for input before the next [`tick`](Self::tick).
    pub fn poll_timeout(&self) -> Duration {
        match self.queue.time_until_resend() {
            Some(t) => t.min(self.idle_poll),
            None => self.idle_poll,
        }
    }

    /// Clear the inbound side of the link: partial frame, last accepted frame
    /// and partial message.
    pub fn reset_link(&mut self) {
        debug!("Link reset");
        self.receiver.reset();
        self.guard.reset();
        self.lines.clear();
    }

    /// Process bytes read from the channel.
    pub fn on_bytes_received(&mut self, data: &[u8]) -> Vec<OutboundAction> {
        trace!(len = data.len(), "Received bytes");
        let mut actions = Vec::new();
        for event in self.receiver.feed_bytes(data) {
            match event {
                ReceiveEvent::Acknowledged => {
                    let events = self.queue.on_ack();
                    actions.extend(queue_actions(events));
                }
                ReceiveEvent::Rejected => {
                    let events = self.queue.on_nak();
                    actions.extend(queue_actions(events));
                }
                ReceiveEvent::FrameComplete(body) => {
                    let verdict = self.guard.inspect(body);
                    actions.push(OutboundAction::Write(verdict.reply().to_vec()));
                    if let Verdict::Accepted(frame) = verdict {
                        trace!(seq = frame.seq, len = frame.payload.len(), "Accepted frame");
                        self.delivered += 1;
                        actions.extend(self.deliver(&frame.payload));
                    }
                }
                ReceiveEvent::UnsupportedFrameType(_) | ReceiveEvent::Overflow => {
                    actions.push(OutboundAction::Write(NAK.to_vec()));
                }
            }
        }
        actions
    }

    /// Advance the clock by `elapsed` since the previous call.
    pub fn tick(&mut self, elapsed: Duration) -> Vec<OutboundAction> {
        let mut actions = queue_actions(self.queue.tick(elapsed));
        // status polls only go out on a quiet link
        if self.queue.is_idle() {
            let flow_actions = self.flow.on_tick(elapsed);
            actions.extend(self.apply_flow(flow_actions));
        }
        actions
    }

    /// Encode `msg` into the next frame and queue it. Nothing is queued and
    /// the sequence number is not consumed when the message cannot be framed.
    pub fn send_message(
        &mut self,
        msg: &Message,
    ) -> Result<Vec<OutboundAction>, FrameEncodeError> {
        let seq = self.next_seq;
        let frame_type = FrameType::EcrToTerminal;
        let wire = wire::encode_frame(seq, frame_type, &msg.to_line()).map_err(|e| {
            warn!(error = %e, tag = msg.tag(), "Cannot frame message");
            e
        })?;
        self.next_seq = self.next_seq.wrapping_add(1);
        debug!(seq, tag = msg.tag(), "Queueing message");
        Ok(queue_actions(self.queue.enqueue(OutboundFrame {
            seq,
            frame_type,
            wire,
        })))
    }

    fn deliver(&mut self, payload: &[u8]) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        for line in self.lines.push(payload) {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match Message::parse(&line) {
                Ok(msg) => {
                    debug!(tag = msg.tag(), "Message from terminal");
                    let flow_actions = self.flow.on_message(&msg);
                    actions.extend(self.apply_flow(flow_actions));
                }
                Err(e) => warn!(error = %e, "Ignoring undecodable message"),
            }
        }
        actions
    }

    fn apply_flow(&mut self, flow_actions: Vec<FlowAction>) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        for action in flow_actions {
            match action {
                FlowAction::Send(msg) => match self.send_message(&msg) {
                    Ok(sent) => actions.extend(sent),
                    Err(e) => {
                        let e = self.flow.abort(e.into());
                        actions.push(OutboundAction::Failed(e));
                        break;
                    }
                },
                FlowAction::Completed(receipt) => actions.push(OutboundAction::Completed(receipt)),
                FlowAction::Failed(e) => actions.push(OutboundAction::Failed(e)),
            }
        }
        actions
    }
}

impl Default for EcrCore {
    fn default() -> Self {
        Self::new()
    }
}

fn queue_actions(events: Vec<QueueEvent>) -> Vec<OutboundAction> {
    events
        .into_iter()
        .map(|event| match event {
            QueueEvent::Transmit(bytes) => OutboundAction::Write(bytes),
            QueueEvent::Dropped { seq, frame_type } => {
                OutboundAction::DeliveryFailed { seq, frame_type }
            }
        })
        .collect()
}
