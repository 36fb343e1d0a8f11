use crate::dialog::DialogId;
use crate::transaction::TransactionKey;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Error(String),

    #[error("sip message error: {0}")]
    SipMessage(String),

    #[error("transaction error: {0} ({1})")]
    TransactionError(String, TransactionKey),

    #[error("dialog error: {0} ({1})")]
    DialogError(String, DialogId),

    #[error("sip stack error: {0}")]
    StackError(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// An unexpected fault while processing a single event.
    #[error("system fault: {0}")]
    SystemFault(String),
}

impl Error {
    pub fn stack<E: std::fmt::Display>(err: E) -> Self {
        Self::StackError(err.to_string())
    }

    /// Wrap a processing error as a fault of a single event.
    pub fn into_system_fault(self) -> Self {
        match self {
            Self::SystemFault(_) => self,
            other => Self::SystemFault(other.to_string()),
        }
    }
}

impl From<rsip::Error> for Error {
    fn from(err: rsip::Error) -> Self {
        Self::SipMessage(err.to_string())
    }
}
