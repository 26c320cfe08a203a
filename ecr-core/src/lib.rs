//! ECR serial link protocol and example payment workflow.
//! Host-driven: no I/O; host passes bytes and elapsed time and receives actions.

pub mod guard;
pub mod integrity;
pub mod protocol;
pub mod receiver;
pub mod scheduler;
pub mod transaction;
pub mod wire;

pub mod core;

pub use crate::core::{EcrCore, OutboundAction, SessionConfig, DEFAULT_IDLE_POLL};
pub use protocol::{Message, MessageError, MessageType, StatusFlags, TrxResult};
pub use scheduler::{QueueStats, RetryPolicy};
pub use transaction::{
    ConnectOptions, FlowConfig, PaymentReceipt, PaymentRequest, TransactionState, WorkflowError,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, FrameType};
