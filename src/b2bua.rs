//! The back-to-back user agent of one bridged call.
//!
//! A [`BackToBackUserAgent`] owns the table of dialogs that make up one call
//! (the LAN leg, the WAN leg, forked WAN branches and the music-on-hold leg)
//! and coordinates cross-leg operations on it: peer linking, metadata migration
//! when a leg is replaced by a new dialog, and teardown. All table and peer-link
//! mutations happen under one lock per call; nothing is sent while it is held.
use crate::dialog::authenticate::AuthenticationHelper;
use crate::dialog::{DialogContext, DialogId, MediaAssociation, PeerLink};
use crate::gateway::ContextStore;
use crate::stack::{ClientTransaction, DialogState, SipStack};
use crate::transaction::make_via_branch;
use crate::{Error, Result};
use rsip::prelude::*;
use rsip::Param;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

static NEXT_B2BUA_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    CallSetupError,
    AuthenticationFailure,
    ForkTimedOut,
    SessionTimerError,
    ProtocolError,
    CallTerminated,
}

impl ReasonCode {
    pub fn code(&self) -> u16 {
        match self {
            ReasonCode::CallSetupError => 1001,
            ReasonCode::AuthenticationFailure => 1002,
            ReasonCode::ForkTimedOut => 1003,
            ReasonCode::SessionTimerError => 1004,
            ReasonCode::ProtocolError => 1005,
            ReasonCode::CallTerminated => 1006,
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReasonCode::CallSetupError => "call-setup-error",
            ReasonCode::AuthenticationFailure => "authentication-failure",
            ReasonCode::ForkTimedOut => "fork-timed-out",
            ReasonCode::SessionTimerError => "session-timer-error",
            ReasonCode::ProtocolError => "protocol-error",
            ReasonCode::CallTerminated => "call-terminated",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum B2buaStatus {
    Active,
    TornDown { reason: ReasonCode, text: String },
}

struct B2buaInner {
    dialogs: HashMap<DialogId, Arc<DialogContext>>,
    call_ids: HashSet<String>,
    moh_dialog: Option<DialogId>,
    status: B2buaStatus,
}

pub struct BackToBackUserAgent {
    id: u64,
    stack: Arc<dyn SipStack>,
    inner: Mutex<B2buaInner>,
}

impl std::fmt::Debug for BackToBackUserAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("BackToBackUserAgent")
            .field("id", &self.id)
            .field("dialogs", &inner.dialogs.keys().collect::<Vec<_>>())
            .field("status", &inner.status)
            .finish()
    }
}

impl BackToBackUserAgent {
    pub fn new(stack: Arc<dyn SipStack>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_B2BUA_ID.fetch_add(1, Ordering::Relaxed),
            stack,
            inner: Mutex::new(B2buaInner {
                dialogs: HashMap::new(),
                call_ids: HashSet::new(),
                moh_dialog: None,
                status: B2buaStatus::Active,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> B2buaStatus {
        self.inner.lock().unwrap().status.clone()
    }

    pub fn is_torn_down(&self) -> bool {
        matches!(self.status(), B2buaStatus::TornDown { .. })
    }

    pub(crate) fn add_call_id(&self, call_id: &str) {
        self.inner.lock().unwrap().call_ids.insert(call_id.to_string());
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().call_ids.iter().cloned().collect()
    }

    /// Add a dialog to this call. Adding a dialog already in the table is a no-op.
    pub fn add_dialog(&self, ctx: Arc<DialogContext>) -> Result<()> {
        if !ctx.is_owned_by(self) {
            return Err(Error::DialogError(
                format!("dialog belongs to another call than {}", self.id),
                ctx.id().clone(),
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.status, B2buaStatus::TornDown { .. }) {
            return Err(self.torn_down_error(ctx.id()));
        }
        inner.call_ids.insert(ctx.id().call_id.clone());
        inner.dialogs.insert(ctx.id().clone(), ctx);
        Ok(())
    }

    pub fn remove_dialog(&self, id: &DialogId) -> Option<Arc<DialogContext>> {
        let removed = self.inner.lock().unwrap().dialogs.remove(id);
        if removed.is_some() {
            debug!(b2bua = self.id, %id, "dialog removed");
        }
        removed
    }

    pub fn dialog(&self, id: &DialogId) -> Option<Arc<DialogContext>> {
        self.inner.lock().unwrap().dialogs.get(id).cloned()
    }

    pub fn dialogs(&self) -> Vec<Arc<DialogContext>> {
        self.inner.lock().unwrap().dialogs.values().cloned().collect()
    }

    pub fn contains(&self, id: &DialogId) -> bool {
        self.inner.lock().unwrap().dialogs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A dialog of the same call leg that already has a media session: the
    /// sibling a forked branch attaches to.
    pub fn find_fork_sibling(&self, call_leg_id: &str) -> Option<Arc<DialogContext>> {
        self.inner
            .lock()
            .unwrap()
            .dialogs
            .values()
            .find(|ctx| ctx.call_leg_id() == call_leg_id && ctx.has_media_session())
            .cloned()
    }

    /// Link two dialogs of this call to each other.
    pub fn link_peers(&self, a: &DialogId, b: &DialogId) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let (Some(ctx_a), Some(ctx_b)) = (inner.dialogs.get(a), inner.dialogs.get(b)) else {
            return Err(Error::DialogError(
                format!("cannot link dialogs outside call {}", self.id),
                a.clone(),
            ));
        };
        ctx_a.set_peer_link(PeerLink::Linked(b.clone()));
        ctx_b.set_peer_link(PeerLink::Linked(a.clone()));
        Ok(())
    }

    /// Complete a half-made peer link once the handshake of `id` finishes: the
    /// peer now points back at `id`, and a shared media session becomes owned
    /// by `id`.
    pub fn complete_peer_link(&self, id: &DialogId) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let ctx = inner
            .dialogs
            .get(id)
            .ok_or_else(|| Error::DialogError(format!("not in call {}", self.id), id.clone()))?;

        if let PeerLink::HalfLinked(peer_id) = ctx.peer_link() {
            if let Some(peer) = inner.dialogs.get(&peer_id) {
                // the branch the peer pointed at so far loses its link
                if let Some(previous) = peer.peer().filter(|p| p != id) {
                    if let Some(sibling) = inner.dialogs.get(&previous) {
                        if sibling.peer().as_ref() == Some(&peer_id) {
                            sibling.set_peer_link(PeerLink::Unlinked);
                        }
                    }
                }
                peer.set_peer_link(PeerLink::Linked(id.clone()));
            }
            ctx.set_peer_link(PeerLink::Linked(peer_id));
        }

        if let MediaAssociation::Shared { session, owner } = ctx.media() {
            if let Some(previous) = inner.dialogs.get(&owner) {
                if previous.media().session() == Some(&session) {
                    previous.set_media(MediaAssociation::Unassociated);
                }
            }
            ctx.set_media(MediaAssociation::Owned(session));
        }
        Ok(())
    }

    /// Replace dialog `old` by `new` in this call: metadata moves onto `new`,
    /// the peer's back-reference is rebound to `new`, and the session timer of
    /// `old` is cancelled.
    pub fn migrate_dialog(&self, old: &DialogId, new: Arc<DialogContext>) -> Result<()> {
        if !new.is_owned_by(self) {
            return Err(Error::DialogError(
                format!("dialog belongs to another call than {}", self.id),
                new.id().clone(),
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        let Some(previous) = inner.dialogs.remove(old) else {
            return Err(Error::DialogError(
                format!("not in call {}", self.id),
                old.clone(),
            ));
        };
        new.migrate_from(&previous);
        previous.cancel_session_timer();

        if let Some(peer_id) = new.peer() {
            if let Some(peer) = inner.dialogs.get(&peer_id) {
                match peer.peer_link() {
                    PeerLink::Linked(p) if &p == old => {
                        peer.set_peer_link(PeerLink::Linked(new.id().clone()))
                    }
                    PeerLink::HalfLinked(p) if &p == old => {
                        peer.set_peer_link(PeerLink::HalfLinked(new.id().clone()))
                    }
                    _ => {}
                }
            }
        }
        debug!(b2bua = self.id, %old, new = %new.id(), "dialog migrated");
        inner.call_ids.insert(new.id().call_id.clone());
        inner.dialogs.insert(new.id().clone(), new);
        Ok(())
    }

    /// Take the dialog of `retry` into this call in place of `old`.
    ///
    /// When the stack created a different dialog for the retried request,
    /// the metadata of `old` migrates onto a new context for it. Returns the
    /// context now in charge of the leg.
    pub fn adopt_retry_dialog(
        self: &Arc<Self>,
        store: &ContextStore,
        old: &DialogId,
        retry: &ClientTransaction,
    ) -> Result<Arc<DialogContext>> {
        let new_id = retry.dialog.clone().unwrap_or_else(|| old.clone());
        if &new_id == old {
            let ctx = match store.dialog(old) {
                Some(ctx) => ctx,
                None => Arc::new(DialogContext::attach(
                    self,
                    new_id,
                    Some(retry.key.clone()),
                    retry.request.clone(),
                )?),
            };
            self.add_dialog(ctx.clone())?;
            if !store.attach_call_dialog(self, ctx.clone()) {
                return Err(self.torn_down_error(ctx.id()));
            }
            return Ok(ctx);
        }

        let ctx = Arc::new(DialogContext::attach(
            self,
            new_id,
            Some(retry.key.clone()),
            retry.request.clone(),
        )?);
        if self.contains(old) {
            self.migrate_dialog(old, ctx.clone())?;
        } else {
            if let Some(previous) = store.dialog(old) {
                ctx.migrate_from(&previous);
                previous.cancel_session_timer();
            }
            self.add_dialog(ctx.clone())?;
        }
        store.detach_dialog(old);
        if !store.attach_call_dialog(self, ctx.clone()) {
            return Err(self.torn_down_error(ctx.id()));
        }
        Ok(ctx)
    }

    fn torn_down_error(&self, id: &DialogId) -> Error {
        Error::DialogError(format!("call {} already torn down", self.id), id.clone())
    }

    /// Resend a timed out trunk INVITE to the next candidate hop.
    ///
    /// Returns false when no hop is left. The transaction context is
    /// re-attached under the key of the new transaction.
    pub async fn resend_invite_to_trunk(
        self: &Arc<Self>,
        store: &ContextStore,
        auth: &dyn AuthenticationHelper,
        timed_out: &ClientTransaction,
    ) -> Result<bool> {
        let ctx = store.transaction(&timed_out.key).ok_or_else(|| {
            Error::TransactionError("no transaction context".to_string(), timed_out.key.clone())
        })?;
        let Some(hop) = ctx.pop_hop() else {
            return Ok(false);
        };

        let mut request = timed_out.request.clone();
        let mut via = request.via_header()?.typed()?;
        via.params.retain(|p| !matches!(p, Param::Branch(_)));
        via.params.push(make_via_branch());
        request.headers_mut().unique_push(via.into());
        let authorized = auth.authorize(&mut request)?;

        let tx = self
            .stack
            .new_client_transaction(timed_out.listener, request, Some(hop.clone()))?;
        ctx.set_client_transaction(tx.clone());
        store.detach_transaction(&timed_out.key);
        store.attach_transaction(tx.key.clone(), ctx.clone());

        if let Some(old) = timed_out.dialog.as_ref() {
            if tx.dialog.as_ref().is_some_and(|d| d != old) {
                self.adopt_retry_dialog(store, old, &tx)?;
            }
        }
        info!(
            b2bua = self.id,
            %hop,
            key = %tx.key,
            remaining = ctx.remaining_hops(),
            authorized,
            "resending invite to next trunk hop"
        );
        self.stack.send_request(&tx).await?;
        Ok(true)
    }

    pub fn set_moh_dialog(&self, id: DialogId) {
        self.inner.lock().unwrap().moh_dialog = Some(id);
    }

    pub fn moh_dialog(&self) -> Option<DialogId> {
        self.inner.lock().unwrap().moh_dialog.clone()
    }

    /// Release the music-on-hold leg, if any. Returns true if a BYE was sent.
    pub async fn send_bye_to_moh_server(&self) -> bool {
        let Some(moh) = self.inner.lock().unwrap().moh_dialog.take() else {
            return false;
        };
        match self.stack.send_bye(&moh, None).await {
            Ok(_) => true,
            Err(e) => {
                warn!(b2bua = self.id, dialog = %moh, error = %e, "failed to release moh leg");
                false
            }
        }
    }

    /// Tear the call down. Cancels every session timer, sends BYE on confirmed
    /// dialogs without one in flight and releases the music-on-hold leg.
    /// Returns false if the call was already torn down.
    pub async fn tear_down(&self, initiator: &str, reason: ReasonCode, text: &str) -> bool {
        let dialogs: Vec<Arc<DialogContext>> = {
            let mut inner = self.inner.lock().unwrap();
            if matches!(inner.status, B2buaStatus::TornDown { .. }) {
                return false;
            }
            inner.status = B2buaStatus::TornDown {
                reason,
                text: text.to_string(),
            };
            inner.dialogs.drain().map(|(_, ctx)| ctx).collect()
        };
        info!(
            b2bua = self.id,
            %reason,
            text,
            initiator,
            dialogs = dialogs.len(),
            "tearing down call"
        );

        let reason_header = format!("{};cause={};text=\"{}\"", initiator, reason.code(), text);
        for ctx in dialogs.iter() {
            ctx.cancel_session_timer();
            if self.stack.dialog_state(ctx.id()) != Some(DialogState::Confirmed) {
                continue;
            }
            if !ctx.mark_clearing() {
                continue;
            }
            if let Err(e) = self
                .stack
                .send_bye(ctx.id(), Some(reason_header.clone()))
                .await
            {
                warn!(b2bua = self.id, dialog = %ctx.id(), error = %e, "bye failed during teardown");
            }
        }
        self.send_bye_to_moh_server().await;
        true
    }
}
