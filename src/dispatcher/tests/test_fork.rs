use super::*;
use crate::dialog::PeerLink;
use crate::mock::Sent;
use crate::stack::DialogState;

#[tokio::test]
async fn test_unmatched_forked_success_is_killed() -> crate::Result<()> {
    let h = harness();
    let request = mock::invite("abc", "wan-tag");
    let branch = DialogId::new("abc", "wan-tag", "fork-2");
    let resp = mock::response(&request, StatusCode::OK, "fork-2");

    let outcome = h
        .dispatcher
        .dispatch(response_event(Listener::Wan, resp, None, Some(branch.clone())))
        .await?;
    assert_eq!(outcome, Outcome::Handled);

    let sent = h.stack.sent();
    assert_eq!(sent.len(), 2);
    assert!(matches!(&sent[0], Sent::Ack { dialog, cseq: 1 } if dialog == &branch));
    assert!(matches!(&sent[1], Sent::Bye { dialog, reason: None } if dialog == &branch));
    assert_eq!(h.gateway.store().dialog_count(), 0);
    assert!(h.call_control.responses.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unmatched_forked_provisional_dropped() -> crate::Result<()> {
    let h = harness();
    let request = mock::invite("abc", "wan-tag");
    let branch = DialogId::new("abc", "wan-tag", "fork-2");
    let resp = mock::response(&request, StatusCode::Ringing, "fork-2");
    let outcome = h
        .dispatcher
        .dispatch(response_event(Listener::Wan, resp, None, Some(branch)))
        .await?;
    assert!(matches!(outcome, Outcome::Dropped(_)));
    assert!(h.stack.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_fork_inherits_media_and_half_link() -> crate::Result<()> {
    let h = harness();
    let call = trunk_call(&h, "fork-call", vec![hop(1)]);
    let branch = DialogId::new("fork-call", "wan-tag", "fork-2");
    let resp = mock::response(&call.client.request, StatusCode::OK, "fork-2");

    let outcome = h
        .dispatcher
        .dispatch(response_event(
            Listener::Wan,
            resp,
            Some(call.client.clone()),
            Some(branch.clone()),
        ))
        .await?;
    // after resolution the response continues to call control
    assert_eq!(outcome, Outcome::Delegated);
    assert_eq!(h.call_control.responses.lock().unwrap().len(), 1);

    let forked = h.gateway.store().dialog(&branch).expect("fork context");
    assert_eq!(
        forked.media(),
        MediaAssociation::Shared {
            session: MediaSessionHandle::new("rtp-1"),
            owner: call.wan.id().clone(),
        }
    );
    assert_eq!(forked.peer_link(), PeerLink::HalfLinked(call.lan.id().clone()));
    assert_eq!(forked.call_leg_id(), call.wan.call_leg_id());
    assert!(forked.is_owned_by(&call.b2bua));
    // the peer still points at the first branch
    assert_eq!(call.lan.peer_link(), PeerLink::Linked(call.wan.id().clone()));

    let dialogs = call.b2bua.dialogs();
    assert_eq!(dialogs.len(), 3);
    assert_eq!(dialogs.iter().filter(|d| d.id() == &branch).count(), 1);

    // the ACK completes the association
    call.b2bua.complete_peer_link(&branch)?;
    assert_eq!(forked.peer_link(), PeerLink::Linked(call.lan.id().clone()));
    assert_eq!(call.lan.peer_link(), PeerLink::Linked(branch.clone()));
    let peer = call.b2bua.dialog(&call.lan.peer().unwrap()).unwrap();
    assert_eq!(peer.peer().as_ref(), Some(call.lan.id()));
    assert_eq!(
        forked.media(),
        MediaAssociation::Owned(MediaSessionHandle::new("rtp-1"))
    );
    assert_eq!(call.wan.media(), MediaAssociation::Unassociated);
    // the losing branch no longer claims the peer
    assert_eq!(call.wan.peer_link(), PeerLink::Unlinked);
    for ctx in call.b2bua.dialogs() {
        if let PeerLink::Linked(peer) = ctx.peer_link() {
            let back = call.b2bua.dialog(&peer).and_then(|p| p.peer());
            assert_eq!(back.as_ref(), Some(ctx.id()));
        }
    }

    // a second response on the now known branch is no fork
    let resp = mock::response(&call.client.request, StatusCode::OK, "fork-2");
    h.dispatcher
        .dispatch(response_event(Listener::Wan, resp, None, Some(branch)))
        .await?;
    assert_eq!(call.b2bua.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_late_fork_tears_down_call() -> crate::Result<()> {
    let h = harness();
    let call = trunk_call(&h, "late-fork", vec![hop(1)]);
    h.stack.set_dialog_state(call.lan.id(), DialogState::Confirmed);
    // the sibling lost its media session when it was cleaned up
    call.wan.set_media(MediaAssociation::Unassociated);

    let branch = DialogId::new("late-fork", "wan-tag", "fork-3");
    let resp = mock::response(&call.client.request, StatusCode::OK, "fork-3");
    let outcome = h
        .dispatcher
        .dispatch(response_event(Listener::Wan, resp, None, Some(branch.clone())))
        .await?;
    assert_eq!(outcome, Outcome::Handled);
    assert!(call.b2bua.is_torn_down());
    assert!(call.b2bua.is_empty());

    let byes = h.stack.byes();
    assert_eq!(byes.len(), 1);
    assert!(byes[0].1.as_ref().unwrap().contains("Fork timed out"));
    assert!(h.gateway.store().find_b2bua("late-fork").is_none());
    assert!(h.gateway.store().dialog(&branch).is_none());
    assert!(h.call_control.responses.lock().unwrap().is_empty());
    Ok(())
}
