use crate::{Error, Result};
use rand::{distr::Alphanumeric, Rng};
use rsip::prelude::*;
use rsip::{Param, Request};

pub mod context;

pub use context::{Operation, TransactionContext};

pub const TAG_LEN: usize = 8;
pub const BRANCH_LEN: usize = 12;
pub const CNONCE_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

impl std::fmt::Display for TransactionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionRole::Client => write!(f, "c"),
            TransactionRole::Server => write!(f, "s"),
        }
    }
}

/// Identity of one transaction as known to the underlying stack.
///
/// The gateway never inspects the value; it is only used to look up the
/// [`TransactionContext`] attached to a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransactionKey(String);

impl TransactionKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Build the key from the top Via branch and the request method.
    pub fn from_request(req: &Request, role: TransactionRole) -> Result<Self> {
        let via = req.via_header()?.typed()?;
        let branch = via
            .params
            .iter()
            .find_map(|p| match p {
                Param::Branch(b) => Some(b.to_string()),
                _ => None,
            })
            .ok_or_else(|| Error::Error("via branch not found".to_string()))?;
        Ok(Self(format!("{}.{}.{}", role, req.method, branch)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn random_text(count: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

pub fn make_via_branch() -> Param {
    Param::Branch(format!("z9hG4bK{}", random_text(BRANCH_LEN)).into())
}

pub fn make_tag() -> String {
    random_text(TAG_LEN)
}
