//! Boundary to the underlying SIP transaction and transport layer.
//!
//! The gateway does not parse, retransmit or route SIP messages itself. It
//! drives an implementation of [`SipStack`] and receives protocol events from
//! it (see [`crate::dispatcher::SipEvent`]).
use crate::dialog::DialogId;
use crate::resolver::Hop;
use crate::transaction::TransactionKey;
use crate::Result;
use async_trait::async_trait;
use rsip::{Request, Response};

/// Which listening point an event arrived on.
///
/// `Lan` faces the local proxy, `Wan` faces the trunk providers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Listener {
    Lan,
    Wan,
}

impl std::fmt::Display for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Listener::Lan => write!(f, "lan"),
            Listener::Wan => write!(f, "wan"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// An outbound transaction issued through the stack.
#[derive(Clone, Debug)]
pub struct ClientTransaction {
    pub key: TransactionKey,
    pub listener: Listener,
    pub request: Request,
    /// Dialog created or used by this transaction, if any.
    pub dialog: Option<DialogId>,
    pub destination: Option<Hop>,
}

/// An inbound transaction awaiting our response.
#[derive(Clone, Debug)]
pub struct ServerTransaction {
    pub key: TransactionKey,
    pub listener: Listener,
    pub request: Request,
}

#[async_trait]
pub trait SipStack: Send + Sync {
    fn new_server_transaction(&self, listener: Listener, request: &Request)
        -> Result<TransactionKey>;

    /// Create (but do not send) a client transaction. A dialog-creating
    /// request may yield a different dialog than the one it replaces.
    fn new_client_transaction(
        &self,
        listener: Listener,
        request: Request,
        hop: Option<Hop>,
    ) -> Result<ClientTransaction>;

    async fn send_response(&self, server: &TransactionKey, response: Response) -> Result<()>;

    async fn send_request(&self, tx: &ClientTransaction) -> Result<()>;

    async fn send_in_dialog(&self, dialog: &DialogId, tx: &ClientTransaction) -> Result<()>;

    async fn send_ack(&self, dialog: &DialogId, cseq: u32) -> Result<()>;

    async fn send_bye(&self, dialog: &DialogId, reason: Option<String>) -> Result<()>;

    /// Liveness check used by the session timer.
    async fn send_options(&self, dialog: &DialogId) -> Result<()>;

    fn terminate_transaction(&self, key: &TransactionKey);

    fn delete_dialog(&self, dialog: &DialogId);

    fn dialog_state(&self, dialog: &DialogId) -> Option<DialogState>;

    fn transaction_state(&self, key: &TransactionKey) -> TransactionState;
}
