use crate::b2bua::BackToBackUserAgent;
use crate::dialog::{DialogContext, DialogId};
use crate::transaction::{TransactionContext, TransactionKey};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Owned tables of application metadata
///
/// `ContextStore` replaces the opaque application-data slots of transactions
/// and dialogs: contexts are looked up by transaction key or dialog id.
///
/// # Fields
///
/// * `transactions` - transaction contexts indexed by [`TransactionKey`]
/// * `dialogs` - dialog contexts indexed by [`DialogId`]
/// * `calls` - B2BUAs indexed by every Call-ID they own
///
/// # Thread Safety
///
/// Each table is behind its own `RwLock`. No lock is held across an await
/// point and no two tables are locked at once.
#[derive(Default)]
pub struct ContextStore {
    transactions: RwLock<HashMap<TransactionKey, Arc<TransactionContext>>>,
    dialogs: RwLock<HashMap<DialogId, Arc<DialogContext>>>,
    calls: RwLock<HashMap<String, Arc<BackToBackUserAgent>>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_transaction(&self, key: TransactionKey, ctx: Arc<TransactionContext>) {
        debug!(%key, operation = ?ctx.operation(), "transaction context attached");
        self.transactions.write().unwrap().insert(key, ctx);
    }

    pub fn transaction(&self, key: &TransactionKey) -> Option<Arc<TransactionContext>> {
        self.transactions.read().unwrap().get(key).cloned()
    }

    pub fn detach_transaction(&self, key: &TransactionKey) -> Option<Arc<TransactionContext>> {
        self.transactions.write().unwrap().remove(key)
    }

    pub fn attach_dialog(&self, ctx: Arc<DialogContext>) {
        self.dialogs.write().unwrap().insert(ctx.id().clone(), ctx);
    }

    /// Attach `ctx` as a dialog of `b2bua` and index the call under its
    /// Call-ID. Returns false, leaving nothing behind, when the call was torn
    /// down meanwhile.
    pub fn attach_call_dialog(
        &self,
        b2bua: &Arc<BackToBackUserAgent>,
        ctx: Arc<DialogContext>,
    ) -> bool {
        let id = ctx.id().clone();
        self.attach_dialog(ctx);
        self.register_b2bua(&id.call_id, b2bua.clone());
        // teardown marks the call before it is released
        if !b2bua.is_torn_down() {
            return true;
        }
        self.detach_dialog(&id);
        self.release_b2bua(b2bua);
        debug!(%id, b2bua = b2bua.id(), "dialog attached to a torn down call");
        false
    }

    pub fn dialog(&self, id: &DialogId) -> Option<Arc<DialogContext>> {
        self.dialogs.read().unwrap().get(id).cloned()
    }

    pub fn detach_dialog(&self, id: &DialogId) -> Option<Arc<DialogContext>> {
        self.dialogs.write().unwrap().remove(id)
    }

    /// Index `b2bua` under `call_id`.
    pub fn register_b2bua(&self, call_id: &str, b2bua: Arc<BackToBackUserAgent>) {
        b2bua.add_call_id(call_id);
        self.calls
            .write()
            .unwrap()
            .insert(call_id.to_string(), b2bua);
    }

    pub fn find_b2bua(&self, call_id: &str) -> Option<Arc<BackToBackUserAgent>> {
        self.calls.read().unwrap().get(call_id).cloned()
    }

    /// Drop every index entry of `b2bua` and the dialog contexts it owned.
    pub fn release_b2bua(&self, b2bua: &BackToBackUserAgent) {
        let call_ids = b2bua.call_ids();
        {
            let mut calls = self.calls.write().unwrap();
            for call_id in call_ids.iter() {
                if calls.get(call_id).map(|b| b.id()) == Some(b2bua.id()) {
                    calls.remove(call_id);
                }
            }
        }
        self.dialogs
            .write()
            .unwrap()
            .retain(|_, ctx| !ctx.is_owned_by(b2bua));
        debug!(b2bua = b2bua.id(), ?call_ids, "call released");
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.read().unwrap().len()
    }

    pub fn dialog_count(&self) -> usize {
        self.dialogs.read().unwrap().len()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }
}
