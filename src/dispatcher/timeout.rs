use super::{EventDispatcher, Outcome, TimeoutEvent};
use crate::b2bua::{BackToBackUserAgent, ReasonCode};
use crate::rsip_ext::{add_sipfrag, make_response};
use crate::stack::TransactionState;
use crate::transaction::Operation;
use crate::Result;
use rsip::{Method, StatusCode};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl EventDispatcher {
    pub(super) async fn on_timeout(&self, event: TimeoutEvent) -> Result<Outcome> {
        let tx = &event.transaction;
        let b2bua = tx.dialog.as_ref().and_then(|d| self.owning_b2bua(d));
        debug!(key = %tx.key, method = %tx.request.method, "transaction timed out");

        match tx.request.method {
            Method::Options => match b2bua {
                Some(b2bua) => {
                    self.tear_down(
                        &b2bua,
                        ReasonCode::SessionTimerError,
                        "OPTIONS Session timer timed out.",
                    )
                    .await;
                    Ok(Outcome::Handled)
                }
                None => Ok(Outcome::dropped("options timeout outside a call")),
            },
            Method::Register => {
                self.registration.process_timeout(&event).await?;
                Ok(Outcome::Delegated)
            }
            Method::Bye => {
                if let Some(dialog) = tx.dialog.as_ref() {
                    self.stack.delete_dialog(dialog);
                }
                Ok(Outcome::Handled)
            }
            Method::Invite => self.on_invite_timeout(&event, b2bua).await,
            _ => Ok(Outcome::dropped("timeout not handled")),
        }
    }

    async fn on_invite_timeout(
        &self,
        event: &TimeoutEvent,
        b2bua: Option<Arc<BackToBackUserAgent>>,
    ) -> Result<Outcome> {
        let tx = &event.transaction;
        let store = self.gateway.store();
        let Some(ctx) = store.transaction(&tx.key) else {
            warn!(key = %tx.key, "invite timeout without transaction context");
            return Ok(Outcome::dropped("no transaction context"));
        };

        match ctx.operation() {
            Operation::SendInviteToProxy => {
                if let Some(b2bua) = b2bua {
                    self.tear_down(&b2bua, ReasonCode::CallSetupError, "Proxy is down")
                        .await;
                }
                Ok(Outcome::Handled)
            }
            op if op.fails_over() => {
                if self.stack.transaction_state(&tx.key) != TransactionState::Terminated {
                    self.stack.terminate_transaction(&tx.key);
                }
                if ctx.remaining_hops() > 0 {
                    let Some(b2bua) = b2bua else {
                        warn!(key = %tx.key, "cannot fail over: no call");
                        return Ok(Outcome::dropped("no call to fail over"));
                    };
                    b2bua
                        .resend_invite_to_trunk(store, self.auth.as_ref(), tx)
                        .await?;
                    return Ok(Outcome::Handled);
                }

                info!(key = %tx.key, "no trunk hop left");
                if let Some(b2bua) = b2bua.as_ref() {
                    b2bua.send_bye_to_moh_server().await;
                }
                if let Some(server) = ctx.server_transaction() {
                    if self.stack.transaction_state(&server.key) != TransactionState::Terminated {
                        let mut response = make_response(
                            &server.request,
                            StatusCode::RequestTimeout,
                            None,
                            None,
                        )?;
                        let domain = ctx
                            .account()
                            .map(|a| a.proxy_domain.as_str())
                            .unwrap_or_default();
                        add_sipfrag(&mut response, &format!("Trunk Domain : {}", domain));
                        self.stack.send_response(&server.key, response).await?;
                    }
                }
                store.detach_transaction(&tx.key);
                Ok(Outcome::Handled)
            }
            op => {
                debug!(operation = ?op, "timed out, releasing moh leg");
                if let Some(b2bua) = b2bua {
                    b2bua.send_bye_to_moh_server().await;
                }
                Ok(Outcome::Handled)
            }
        }
    }
}
