use crate::gateway::account::TrunkAccount;
use crate::resolver::Hop;
use crate::stack::{ClientTransaction, ServerTransaction};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// What an outbound transaction was issued for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    SendInviteToTrunk,
    SendInviteToProxy,
    SpiralBlindTransferInviteToTrunk,
    SendInviteToMohServer,
    ForwardReinvite,
    SessionTimer,
    Register,
    Other,
}

impl Operation {
    /// Operations whose timeout moves on to the next candidate hop.
    pub fn fails_over(&self) -> bool {
        matches!(
            self,
            Operation::SendInviteToTrunk | Operation::SpiralBlindTransferInviteToTrunk
        )
    }
}

/// Application metadata of one transaction.
///
/// Looked up by [`TransactionKey`](crate::transaction::TransactionKey) in the
/// gateway's context store. When a transaction is superseded (challenge retry,
/// failover) the same context is re-attached under the new key.
#[derive(Debug)]
pub struct TransactionContext {
    operation: Operation,
    server_transaction: Option<ServerTransaction>,
    client_transaction: Mutex<Option<ClientTransaction>>,
    account: Option<Arc<TrunkAccount>>,
    hops: Mutex<VecDeque<Hop>>,
}

impl TransactionContext {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            server_transaction: None,
            client_transaction: Mutex::new(None),
            account: None,
            hops: Mutex::new(VecDeque::new()),
        }
    }

    /// Context of an INVITE relayed to a trunk. `hops` are the alternates left
    /// after the one `client` was sent to.
    pub fn for_trunk_invite(
        server: ServerTransaction,
        client: ClientTransaction,
        account: Arc<TrunkAccount>,
        hops: impl IntoIterator<Item = Hop>,
    ) -> Self {
        Self::new(Operation::SendInviteToTrunk)
            .with_server_transaction(server)
            .with_client_transaction(client)
            .with_account(account)
            .with_hops(hops)
    }

    pub fn with_server_transaction(mut self, server: ServerTransaction) -> Self {
        self.server_transaction = Some(server);
        self
    }

    pub fn with_client_transaction(self, client: ClientTransaction) -> Self {
        *self.client_transaction.lock().unwrap() = Some(client);
        self
    }

    pub fn with_account(mut self, account: Arc<TrunkAccount>) -> Self {
        self.account = Some(account);
        self
    }

    pub fn with_hops(self, hops: impl IntoIterator<Item = Hop>) -> Self {
        self.hops.lock().unwrap().extend(hops);
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn server_transaction(&self) -> Option<&ServerTransaction> {
        self.server_transaction.as_ref()
    }

    pub fn client_transaction(&self) -> Option<ClientTransaction> {
        self.client_transaction.lock().unwrap().clone()
    }

    /// Replace the client transaction, returning the superseded one.
    pub fn set_client_transaction(&self, tx: ClientTransaction) -> Option<ClientTransaction> {
        self.client_transaction.lock().unwrap().replace(tx)
    }

    pub fn account(&self) -> Option<&Arc<TrunkAccount>> {
        self.account.as_ref()
    }

    /// Consume the next candidate hop.
    pub fn pop_hop(&self) -> Option<Hop> {
        self.hops.lock().unwrap().pop_front()
    }

    pub fn remaining_hops(&self) -> usize {
        self.hops.lock().unwrap().len()
    }
}
