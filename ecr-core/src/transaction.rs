//! Payment workflow: connect, poll status, activate, authorize, confirm, fetch
//! the receipt.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::protocol::{
    fields, ConnectRequest, Message, MessageError, MessageType, ReceiptRequest, StatusFlags,
    TransactionConfirmationRequest, TransactionRequest, TrxResult, RECEIPT_FIRST_PART,
    RECEIPT_MORE_DATA_AVAILABLE, RECEIPT_TYPE_TRX, TRX_FUNCTION_PURCHASE,
};
use crate::wire::FrameEncodeError;

/// Default interval between status polls while waiting on the terminal.
pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Connecting,
    AwaitingStatus,
    Activating,
    Authorizing,
    Confirming,
    Receipting,
}

/// Amount and currency of the purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    /// Minor units.
    pub amount: u64,
    /// ISO 4217 numeric code.
    pub currency: u32,
    pub trx_function: u32,
}

impl Default for PaymentRequest {
    fn default() -> Self {
        Self {
            amount: 175,
            currency: 756,
            trx_function: TRX_FUNCTION_PURCHASE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub language: String,
    pub printer_width: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            language: "de".to_string(),
            printer_width: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowConfig {
    pub connect: ConnectOptions,
    pub payment: PaymentRequest,
    pub status_poll_interval: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            payment: PaymentRequest::default(),
            status_poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
        }
    }
}

/// Final receipt handed back when the workflow completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub receipt_type: u64,
    pub text: String,
}

#[derive(Debug)]
pub enum FlowAction {
    /// Queue this message for the terminal.
    Send(Message),
    Completed(PaymentReceipt),
    Failed(WorkflowError),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("transaction not approved (TrxResult {code}, {class:?})")]
    Declined { code: u64, class: TrxResult },
    #[error("transaction response without TrxResult")]
    MissingResult,
    #[error("invalid TrxResult")]
    InvalidResult,
    #[error("terminal reported an error: {0}")]
    TerminalError(String),
    #[error("cannot build request: {0}")]
    Request(#[from] MessageError),
    #[error("cannot frame request: {0}")]
    Frame(#[from] FrameEncodeError),
}

pub struct PaymentFlow {
    config: FlowConfig,
    state: TransactionState,
    status: Option<StatusFlags>,
    receipt_text: String,
    since_poll: Duration,
    finished: bool,
}

impl PaymentFlow {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            config,
            state: TransactionState::Connecting,
            status: None,
            receipt_text: String::new(),
            since_poll: Duration::ZERO,
            finished: false,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Last terminal status seen, if any.
    pub fn status(&self) -> Option<StatusFlags> {
        self.status
    }

    /// True once the workflow completed or failed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// End the workflow with `error`; later messages are ignored.
    pub fn abort(&mut self, error: WorkflowError) -> WorkflowError {
        warn!(error = %error, state = ?self.state, "Payment workflow failed");
        self.finished = true;
        error
    }

    /// Enter Connecting and emit the connect request.
    pub fn start(&mut self) -> Vec<FlowAction> {
        self.state = TransactionState::Connecting;
        let request = ConnectRequest {
            trm_lng: self.config.connect.language.clone(),
            printer_width: self.config.connect.printer_width,
        };
        self.finish_on_error(|_| {
            Ok(vec![FlowAction::Send(Message::with_body(
                MessageType::ConnectRequest,
                &request,
            )?)])
        })
    }

    /// Process one accepted message from the terminal.
    pub fn on_message(&mut self, msg: &Message) -> Vec<FlowAction> {
        if self.finished {
            debug!(tag = msg.tag(), "Workflow finished, ignoring message");
            return Vec::new();
        }
        let mut actions = Vec::new();
        match msg.kind() {
            Some(MessageType::HeartbeatRequest) => {
                actions.push(FlowAction::Send(Message::empty(MessageType::HeartbeatResponse)));
            }
            Some(MessageType::StatusResponse) => self.update_status(msg),
            Some(MessageType::ErrorNotification) => {
                warn!(
                    description = msg.field_str(fields::ERROR_DESCRIPTION).unwrap_or(""),
                    "Terminal error notification"
                );
            }
            Some(_) => {}
            None => debug!(tag = msg.tag(), "Unknown message tag"),
        }
        actions.extend(self.finish_on_error(|flow| flow.step(msg)));
        actions
    }

    /// Advance the clock; re-polls the status while waiting on the terminal.
    pub fn on_tick(&mut self, elapsed: Duration) -> Vec<FlowAction> {
        if self.finished
            || !matches!(
                self.state,
                TransactionState::AwaitingStatus | TransactionState::Activating
            )
        {
            return Vec::new();
        }
        self.since_poll += elapsed;
        if self.since_poll < self.config.status_poll_interval {
            return Vec::new();
        }
        self.since_poll = Duration::ZERO;
        debug!(state = ?self.state, "Polling terminal status");
        vec![FlowAction::Send(Message::empty(MessageType::StatusRequest))]
    }

    fn finish_on_error<F>(&mut self, f: F) -> Vec<FlowAction>
    where
        F: FnOnce(&mut Self) -> Result<Vec<FlowAction>, WorkflowError>,
    {
        match f(self) {
            Ok(actions) => {
                if actions.iter().any(|a| matches!(a, FlowAction::Completed(_))) {
                    self.finished = true;
                }
                actions
            }
            Err(e) => {
                warn!(error = %e, state = ?self.state, "Payment workflow failed");
                self.finished = true;
                vec![FlowAction::Failed(e)]
            }
        }
    }

    fn update_status(&mut self, msg: &Message) {
        match msg.field_u64(fields::TRM_STATUS) {
            Ok(Some(bits)) => match u32::try_from(bits) {
                Ok(bits) => {
                    let status = StatusFlags(bits);
                    if self.status != Some(status) {
                        info!(status = format_args!("{:#010X}", bits), "Terminal status changed");
                    }
                    self.status = Some(status);
                }
                Err(_) => warn!(bits, "TrmStatus out of range"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Ignoring status"),
        }
    }

    fn enter(&mut self, next: TransactionState) {
        debug!(from = ?self.state, to = ?next, "Transaction state change");
        self.state = next;
        self.since_poll = Duration::ZERO;
    }

    fn step(&mut self, msg: &Message) -> Result<Vec<FlowAction>, WorkflowError> {
        match self.state {
            TransactionState::Connecting => {
                if msg.is(MessageType::ConnectResponse) {
                    self.enter(TransactionState::AwaitingStatus);
                    return Ok(send(Message::empty(MessageType::StatusRequest)));
                }
            }
            TransactionState::AwaitingStatus => {
                if matches!(self.status, Some(s) if !s.is_busy()) {
                    self.enter(TransactionState::Activating);
                    return Ok(send(Message::empty(MessageType::ActivationRequest)));
                }
                return Ok(Vec::new());
            }
            TransactionState::Activating => {
                if matches!(self.status, Some(s) if s.is_activated() && !s.is_busy()) {
                    let request = TransactionRequest {
                        trx_function: self.config.payment.trx_function,
                        trx_curr_c: self.config.payment.currency,
                        amt_auth: self.config.payment.amount,
                    };
                    self.enter(TransactionState::Authorizing);
                    return Ok(send(Message::with_body(
                        MessageType::TransactionRequest,
                        &request,
                    )?));
                }
                return Ok(Vec::new());
            }
            TransactionState::Authorizing => {
                if msg.is(MessageType::ErrorNotification) {
                    return Err(terminal_error(msg));
                }
                if msg.is(MessageType::TransactionResponse) {
                    let code = msg
                        .field_u64(fields::TRX_RESULT)
                        .map_err(|_| WorkflowError::InvalidResult)?
                        .ok_or(WorkflowError::MissingResult)?;
                    return match TrxResult::from_code(code) {
                        TrxResult::Approved => {
                            info!(amount = self.config.payment.amount, "Transaction approved");
                            let request = TransactionConfirmationRequest {
                                confirm: 1,
                                amt_auth: self.config.payment.amount,
                            };
                            self.enter(TransactionState::Confirming);
                            Ok(send(Message::with_body(
                                MessageType::TransactionConfirmationRequest,
                                &request,
                            )?))
                        }
                        class => Err(WorkflowError::Declined { code, class }),
                    };
                }
            }
            TransactionState::Confirming => {
                if msg.is(MessageType::ErrorNotification) {
                    return Err(terminal_error(msg));
                }
                if msg.is(MessageType::TransactionConfirmationResponse) {
                    self.enter(TransactionState::Receipting);
                    self.receipt_text.clear();
                    return Ok(send(receipt_request(u64::from(RECEIPT_TYPE_TRX))?));
                }
            }
            TransactionState::Receipting => {
                if msg.is(MessageType::ReceiptResponse) {
                    return self.on_receipt(msg);
                }
            }
        }
        debug!(tag = msg.tag(), state = ?self.state, "No transition for message");
        Ok(Vec::new())
    }

    fn on_receipt(&mut self, msg: &Message) -> Result<Vec<FlowAction>, WorkflowError> {
        let receipt_type = msg
            .field_u64(fields::RECEIPT_TYPE)
            .ok()
            .flatten()
            .unwrap_or(u64::from(RECEIPT_TYPE_TRX));
        let flags = msg.field_u64(fields::RECEIPT_FLAGS).unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring receipt flags");
            None
        });
        let flags = flags.unwrap_or(0);
        if flags & RECEIPT_FIRST_PART != 0 {
            self.receipt_text.clear();
        }
        if let Some(text) = msg.field_str(fields::RECEIPT_TEXT) {
            self.receipt_text.push_str(text);
        }
        if flags & RECEIPT_MORE_DATA_AVAILABLE != 0 {
            debug!(receipt_type, "Requesting next receipt part");
            return Ok(send(receipt_request(receipt_type)?));
        }
        info!(receipt_type, "Receipt complete, all ok");
        Ok(vec![FlowAction::Completed(PaymentReceipt {
            receipt_type,
            text: std::mem::take(&mut self.receipt_text),
        })])
    }
}

fn send(msg: Message) -> Vec<FlowAction> {
    vec![FlowAction::Send(msg)]
}

fn receipt_request(receipt_type: u64) -> Result<Message, MessageError> {
    let receipt_type = u32::try_from(receipt_type).unwrap_or(RECEIPT_TYPE_TRX);
    Message::with_body(MessageType::ReceiptRequest, &ReceiptRequest { receipt_type })
}

fn terminal_error(msg: &Message) -> WorkflowError {
    WorkflowError::TerminalError(
        msg.field_str(fields::ERROR_DESCRIPTION)
            .unwrap_or("unspecified")
            .to_string(),
    )
}
