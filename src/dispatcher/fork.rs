use super::{EventDispatcher, Outcome, ResponseEvent};
use crate::b2bua::ReasonCode;
use crate::dialog::{DialogContext, DialogId, MediaAssociation, PeerLink};
use crate::rsip_ext::{call_id, call_leg_id, is_success};
use crate::Result;
use rsip::prelude::*;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl EventDispatcher {
    /// Resolve an INVITE response on a dialog without context: another branch
    /// of a forked request. Returns `None` when the branch was taken into its
    /// call and the response should be processed further.
    pub(super) async fn resolve_fork(
        &self,
        event: &ResponseEvent,
        dialog: &DialogId,
    ) -> Result<Option<Outcome>> {
        let response = &event.response;
        let store = self.gateway.store();
        let call_id = call_id(response)?;
        debug!(%dialog, status = %response.status_code, "forked response detected");

        let Some(b2bua) = store.find_b2bua(&call_id) else {
            if !is_success(&response.status_code) {
                warn!(%dialog, "forked response without a call");
                return Ok(Some(Outcome::dropped("forked response without a call")));
            }
            let cseq = response.cseq_header()?.seq()?;
            info!(%dialog, "killing unwanted forked branch");
            self.stack.send_ack(dialog, cseq).await?;
            self.stack.send_bye(dialog, None).await?;
            return Ok(Some(Outcome::Handled));
        };

        let call_leg = call_leg_id(response)?;
        let Some(sibling) = b2bua.find_fork_sibling(&call_leg) else {
            info!(%dialog, %call_leg, b2bua = b2bua.id(), "fork arrived after its sibling was cleaned up");
            self.tear_down(&b2bua, ReasonCode::ForkTimedOut, "Fork timed out")
                .await;
            return Ok(Some(Outcome::Handled));
        };

        let ctx = DialogContext::attach(
            &b2bua,
            dialog.clone(),
            sibling.creating_transaction().cloned(),
            sibling.request().clone(),
        )?;
        if let Some(session) = sibling.media().session().cloned() {
            ctx.set_media(MediaAssociation::Shared {
                session,
                owner: sibling.id().clone(),
            });
        }
        // The peer points back at us once the ACK completes the handshake.
        if let Some(peer) = sibling.peer() {
            ctx.set_peer_link(PeerLink::HalfLinked(peer));
        }
        ctx.set_account(sibling.account());

        let ctx = Arc::new(ctx);
        if b2bua.add_dialog(ctx.clone()).is_err() || !store.attach_call_dialog(&b2bua, ctx) {
            warn!(%dialog, b2bua = b2bua.id(), "forked branch of a torn down call");
            return Ok(Some(Outcome::dropped("call torn down")));
        }
        debug!(%dialog, sibling = %sibling.id(), "forked branch attached");
        Ok(None)
    }
}
