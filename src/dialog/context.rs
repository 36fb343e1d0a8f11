use super::session_timer::SessionTimer;
use super::DialogId;
use crate::b2bua::BackToBackUserAgent;
use crate::gateway::account::TrunkAccount;
use crate::rsip_ext::call_leg_id;
use crate::stack::SipStack;
use crate::transaction::TransactionKey;
use crate::Result;
use rsip::Request;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Opaque handle of the media session (RTP bridge) bound to a dialog.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MediaSessionHandle(Arc<str>);

impl MediaSessionHandle {
    pub fn new(id: &str) -> Self {
        Self(Arc::from(id))
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

/// How a dialog holds its media session.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum MediaAssociation {
    #[default]
    Unassociated,
    Owned(MediaSessionHandle),
    /// Borrowed from `owner` while a forked branch is being established.
    /// `owner` stays authoritative until the association is re-made.
    Shared {
        session: MediaSessionHandle,
        owner: DialogId,
    },
}

impl MediaAssociation {
    pub fn session(&self) -> Option<&MediaSessionHandle> {
        match self {
            MediaAssociation::Unassociated => None,
            MediaAssociation::Owned(session) | MediaAssociation::Shared { session, .. } => {
                Some(session)
            }
        }
    }
}

/// Link from a dialog to the other leg of the bridged call.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum PeerLink {
    #[default]
    Unlinked,
    /// We point at the peer, the peer does not point back yet.
    HalfLinked(DialogId),
    Linked(DialogId),
}

impl PeerLink {
    pub fn peer(&self) -> Option<&DialogId> {
        match self {
            PeerLink::Unlinked => None,
            PeerLink::HalfLinked(id) | PeerLink::Linked(id) => Some(id),
        }
    }
}

enum TimerSlot {
    Idle,
    Running(SessionTimer),
    Cancelled,
}

/// Bridge metadata of one dialog.
pub struct DialogContext {
    id: DialogId,
    b2bua: Weak<BackToBackUserAgent>,
    b2bua_id: u64,
    call_leg_id: String,
    request: Request,
    creating_transaction: Option<TransactionKey>,
    peer: Mutex<PeerLink>,
    media: Mutex<MediaAssociation>,
    account: Mutex<Option<Arc<TrunkAccount>>>,
    session_timer: Mutex<TimerSlot>,
    clearing: AtomicBool,
}

impl std::fmt::Debug for DialogContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialogContext")
            .field("id", &self.id)
            .field("b2bua", &self.b2bua_id)
            .field("call_leg_id", &self.call_leg_id)
            .field("peer", &self.peer_link())
            .field("media", &self.media())
            .finish()
    }
}

impl DialogContext {
    /// Create the context of `id`, owned by `b2bua`. The call-leg identifier
    /// is taken from the dialog-creating `request`.
    pub fn attach(
        b2bua: &Arc<BackToBackUserAgent>,
        id: DialogId,
        creating_transaction: Option<TransactionKey>,
        request: Request,
    ) -> Result<Self> {
        Ok(Self {
            call_leg_id: call_leg_id(&request)?,
            id,
            b2bua: Arc::downgrade(b2bua),
            b2bua_id: b2bua.id(),
            request,
            creating_transaction,
            peer: Mutex::new(PeerLink::Unlinked),
            media: Mutex::new(MediaAssociation::Unassociated),
            account: Mutex::new(None),
            session_timer: Mutex::new(TimerSlot::Idle),
            clearing: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &DialogId {
        &self.id
    }

    pub fn b2bua(&self) -> Option<Arc<BackToBackUserAgent>> {
        self.b2bua.upgrade()
    }

    pub fn is_owned_by(&self, b2bua: &BackToBackUserAgent) -> bool {
        self.b2bua_id == b2bua.id()
    }

    pub fn call_leg_id(&self) -> &str {
        &self.call_leg_id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn creating_transaction(&self) -> Option<&TransactionKey> {
        self.creating_transaction.as_ref()
    }

    pub fn peer_link(&self) -> PeerLink {
        self.peer.lock().unwrap().clone()
    }

    pub fn peer(&self) -> Option<DialogId> {
        self.peer.lock().unwrap().peer().cloned()
    }

    pub fn set_peer_link(&self, link: PeerLink) {
        *self.peer.lock().unwrap() = link;
    }

    pub fn media(&self) -> MediaAssociation {
        self.media.lock().unwrap().clone()
    }

    pub fn set_media(&self, media: MediaAssociation) {
        *self.media.lock().unwrap() = media;
    }

    pub fn has_media_session(&self) -> bool {
        self.media.lock().unwrap().session().is_some()
    }

    pub fn account(&self) -> Option<Arc<TrunkAccount>> {
        self.account.lock().unwrap().clone()
    }

    pub fn set_account(&self, account: Option<Arc<TrunkAccount>>) {
        *self.account.lock().unwrap() = account;
    }

    /// Move peer link, media session and account from `old` onto this
    /// context. `old` is left unlinked and without media.
    pub fn migrate_from(&self, old: &DialogContext) {
        let link = std::mem::take(&mut *old.peer.lock().unwrap());
        let media = std::mem::take(&mut *old.media.lock().unwrap());
        self.set_peer_link(link);
        self.set_media(media);
        self.set_account(old.account());
    }

    /// Start the session timer unless it was ever started (or cancelled).
    /// Returns true if this call started it.
    pub fn start_session_timer(&self, stack: Arc<dyn SipStack>, interval: Duration) -> bool {
        let mut slot = self.session_timer.lock().unwrap();
        if !matches!(*slot, TimerSlot::Idle) {
            return false;
        }
        *slot = TimerSlot::Running(SessionTimer::start(self.id.clone(), stack, interval));
        true
    }

    pub fn cancel_session_timer(&self) {
        let mut slot = self.session_timer.lock().unwrap();
        if let TimerSlot::Running(timer) = &*slot {
            timer.cancel();
        }
        *slot = TimerSlot::Cancelled;
    }

    pub fn is_session_timer_started(&self) -> bool {
        !matches!(*self.session_timer.lock().unwrap(), TimerSlot::Idle)
    }

    pub fn is_session_timer_running(&self) -> bool {
        match &*self.session_timer.lock().unwrap() {
            TimerSlot::Running(timer) => !timer.is_cancelled(),
            _ => false,
        }
    }

    /// Mark that a BYE is in flight on this dialog. Returns false if one
    /// already was.
    pub fn mark_clearing(&self) -> bool {
        !self.clearing.swap(true, Ordering::AcqRel)
    }

    pub fn is_clearing(&self) -> bool {
        self.clearing.load(Ordering::Acquire)
    }
}
