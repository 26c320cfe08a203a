//! ECR interface application messages: newline-delimited JSON objects with a
//! single top-level key (the message tag) mapping to a field object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Longest application message accepted from the line assembler.
pub const MAX_MESSAGE_LEN: usize = 20480;

/// Message tags of the ECR interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ConnectRequest,
    ConnectResponse,
    StatusRequest,
    StatusResponse,
    ActivationRequest,
    ActivationResponse,
    DeactivationRequest,
    DeactivationResponse,
    TransactionRequest,
    TransactionResponse,
    TransactionConfirmationRequest,
    TransactionConfirmationResponse,
    AbortTransactionRequest,
    AbortTransactionResponse,
    BalanceRequest,
    BalanceResponse,
    ReceiptRequest,
    ReceiptResponse,
    DeviceCommandRequest,
    DeviceCommandResponse,
    HeartbeatRequest,
    HeartbeatResponse,
    ErrorNotification,
    DisplayNotification,
}

const MESSAGE_TYPES: [MessageType; 24] = [
    MessageType::ConnectRequest,
    MessageType::ConnectResponse,
    MessageType::StatusRequest,
    MessageType::StatusResponse,
    MessageType::ActivationRequest,
    MessageType::ActivationResponse,
    MessageType::DeactivationRequest,
    MessageType::DeactivationResponse,
    MessageType::TransactionRequest,
    MessageType::TransactionResponse,
    MessageType::TransactionConfirmationRequest,
    MessageType::TransactionConfirmationResponse,
    MessageType::AbortTransactionRequest,
    MessageType::AbortTransactionResponse,
    MessageType::BalanceRequest,
    MessageType::BalanceResponse,
    MessageType::ReceiptRequest,
    MessageType::ReceiptResponse,
    MessageType::DeviceCommandRequest,
    MessageType::DeviceCommandResponse,
    MessageType::HeartbeatRequest,
    MessageType::HeartbeatResponse,
    MessageType::ErrorNotification,
    MessageType::DisplayNotification,
];

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::ConnectRequest => "ConnectRequest",
            MessageType::ConnectResponse => "ConnectResponse",
            MessageType::StatusRequest => "StatusRequest",
            MessageType::StatusResponse => "StatusResponse",
            MessageType::ActivationRequest => "ActivationRequest",
            MessageType::ActivationResponse => "ActivationResponse",
            MessageType::DeactivationRequest => "DeactivationRequest",
            MessageType::DeactivationResponse => "DeactivationResponse",
            MessageType::TransactionRequest => "TransactionRequest",
            MessageType::TransactionResponse => "TransactionResponse",
            MessageType::TransactionConfirmationRequest => "TransactionConfirmationRequest",
            MessageType::TransactionConfirmationResponse => "TransactionConfirmationResponse",
            MessageType::AbortTransactionRequest => "AbortTransactionRequest",
            MessageType::AbortTransactionResponse => "AbortTransactionResponse",
            MessageType::BalanceRequest => "BalanceRequest",
            MessageType::BalanceResponse => "BalanceResponse",
            MessageType::ReceiptRequest => "ReceiptRequest",
            MessageType::ReceiptResponse => "ReceiptResponse",
            MessageType::DeviceCommandRequest => "DeviceCommandRequest",
            MessageType::DeviceCommandResponse => "DeviceCommandResponse",
            MessageType::HeartbeatRequest => "HeartbeatRequest",
            MessageType::HeartbeatResponse => "HeartbeatResponse",
            MessageType::ErrorNotification => "ErrorNotification",
            MessageType::DisplayNotification => "DisplayNotification",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        MESSAGE_TYPES.iter().copied().find(|t| t.as_str() == tag)
    }
}

/// Field names looked up by the workflow.
pub mod fields {
    pub const TRM_STATUS: &str = "TrmStatus";
    pub const TRX_RESULT: &str = "TrxResult";
    pub const RECEIPT_TYPE: &str = "ReceiptType";
    pub const RECEIPT_FLAGS: &str = "ReceiptFlags";
    pub const RECEIPT_TEXT: &str = "ReceiptText";
    pub const ERROR_DESCRIPTION: &str = "ErrorDescription";
}

/// One decoded application message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    tag: String,
    fields: Map<String, Value>,
}

impl Message {
    pub fn new(tag: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            tag: tag.into(),
            fields,
        }
    }

    /// Message with an empty field object.
    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind.as_str(), Map::new())
    }

    /// Message whose fields come from a serializable body.
    pub fn with_body<T: Serialize>(kind: MessageType, body: &T) -> Result<Self, MessageError> {
        match serde_json::to_value(body)? {
            Value::Object(fields) => Ok(Self::new(kind.as_str(), fields)),
            _ => Err(MessageError::NotAnObject),
        }
    }

    /// Parse one line (terminator optional).
    pub fn parse(line: &[u8]) -> Result<Self, MessageError> {
        let root: Map<String, Value> = serde_json::from_slice(line)?;
        if root.len() != 1 {
            return Err(MessageError::KeyCount(root.len()));
        }
        let Some((tag, body)) = root.into_iter().next() else {
            return Err(MessageError::KeyCount(0));
        };
        match body {
            Value::Object(fields) => Ok(Self { tag, fields }),
            _ => Err(MessageError::NotAnObject),
        }
    }

    /// Serialize to one JSON line, `\n` included.
    pub fn to_line(&self) -> Vec<u8> {
        let mut root = Map::with_capacity(1);
        root.insert(self.tag.clone(), Value::Object(self.fields.clone()));
        let mut out = Value::Object(root).to_string().into_bytes();
        out.push(b'\n');
        out
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_tag(&self.tag)
    }

    pub fn is(&self, kind: MessageType) -> bool {
        self.tag == kind.as_str()
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// `Ok(None)` when absent, `Err` when present but not an unsigned integer.
    pub fn field_u64(&self, name: &str) -> Result<Option<u64>, MessageError> {
        match self.fields.get(name) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| MessageError::InvalidField(name.to_string())),
        }
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected exactly one top-level key, found {0}")]
    KeyCount(usize),
    #[error("message body is not an object")]
    NotAnObject,
    #[error("field {0} is not an unsigned integer")]
    InvalidField(String),
}

/// Terminal status bit set (`TrmStatus`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusFlags(pub u32);

impl StatusFlags {
    pub const SHIFT_OPEN: u32 = 0x0000_0001;
    /// Same bit as SHIFT_OPEN: the terminal has been activated.
    pub const ACTIVATED: u32 = Self::SHIFT_OPEN;
    pub const CARD_DATA_AVAILABLE: u32 = 0x0000_0002;
    pub const BUSY: u32 = 0x0000_0004;
    pub const READER_SLOT_OCCUPIED: u32 = 0x0000_0008;
    pub const LOCKED: u32 = 0x0000_0010;
    pub const APPLICATION_SELECTED: u32 = 0x0000_0020;
    pub const WAITING_FOR_TRANSACTION_REQUEST: u32 = 0x0000_0040;
    pub const WAITING_FOR_APPLICATION_SELECTION: u32 = 0x0000_0080;
    pub const ONLINE_PROCESSING: u32 = 0x0000_0100;
    pub const PRINTER_UNAVAILABLE: u32 = 0x0000_0200;
    pub const OUT_OF_PAPER: u32 = 0x0000_0400;
    pub const MODEM_IN_USE: u32 = 0x4000_0000;

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn is_activated(self) -> bool {
        self.contains(Self::ACTIVATED)
    }

    pub fn is_busy(self) -> bool {
        self.contains(Self::BUSY)
    }
}

/// Transaction function requested in `TransactionRequest.TrxFunction`.
pub const TRX_FUNCTION_PURCHASE: u32 = 0x8000;

/// Receipt type for the transaction receipt.
pub const RECEIPT_TYPE_TRX: u32 = 1;

/// `ReceiptFlags` bits.
pub const RECEIPT_MORE_DATA_AVAILABLE: u64 = 0x1;
pub const RECEIPT_FIRST_PART: u64 = 0x2;

/// How the terminal classified a transaction (`TrxResult`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxResult {
    Approved,
    Declined,
    Referred,
    Aborted(u64),
}

impl TrxResult {
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => TrxResult::Approved,
            1 => TrxResult::Declined,
            2 => TrxResult::Referred,
            other => TrxResult::Aborted(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectRequest {
    pub trm_lng: String,
    pub printer_width: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransactionRequest {
    pub trx_function: u32,
    pub trx_curr_c: u32,
    pub amt_auth: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransactionConfirmationRequest {
    pub confirm: u32,
    pub amt_auth: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReceiptRequest {
    pub receipt_type: u32,
}

/// Splits frame payloads into newline-terminated messages. A message may span
/// several frames.
#[derive(Debug)]
pub struct LineAssembler {
    buffer: Vec<u8>,
    max_len: usize,
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_LEN)
    }
}

impl LineAssembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_len,
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Append `data`; returns every completed line, terminator stripped.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        for &b in data {
            if b == b'\n' {
                lines.push(std::mem::take(&mut self.buffer));
                continue;
            }
            if self.buffer.len() >= self.max_len {
                warn!(len = self.buffer.len(), "Terminal message too long, discarding");
                self.buffer.clear();
            }
            self.buffer.push(b);
        }
        lines
    }
}
