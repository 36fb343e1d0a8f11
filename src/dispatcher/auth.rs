use super::{EventDispatcher, Outcome, ResponseEvent};
use crate::b2bua::ReasonCode;
use crate::dialog::authenticate::RetryBudget;
use crate::gateway::{AccountState, AlarmCode};
use crate::rsip_ext::{call_id, copy_challenge_headers, cseq_method, has_to_tag, make_response};
use crate::stack::{DialogState, Listener, TransactionState};
use crate::Result;
use rsip::Method;
use tracing::{debug, info, warn};

impl EventDispatcher {
    /// Answer a 401/407. LAN challenges are relayed to the server transaction
    /// they belong to; trunk challenges are retried with the account's
    /// credential, or end the call on a repeated failure.
    pub(super) async fn handle_challenge(&self, event: &ResponseEvent) -> Result<Outcome> {
        let store = self.gateway.store();
        let Some(client) = event.transaction.as_ref() else {
            warn!("cannot process challenge: no client transaction");
            return Ok(Outcome::dropped("no client transaction"));
        };
        let Some(tx_ctx) = store.transaction(&client.key) else {
            warn!(key = %client.key, "cannot process challenge: no transaction context");
            return Ok(Outcome::dropped("no transaction context"));
        };

        if event.listener == Listener::Lan {
            let Some(server) = tx_ctx.server_transaction() else {
                return Ok(Outcome::dropped("no server transaction to relay challenge"));
            };
            let mut relayed = make_response(
                &server.request,
                event.response.status_code.clone(),
                None,
                None,
            )?;
            copy_challenge_headers(&event.response, &mut relayed);
            debug!(server = %server.key, "relaying lan challenge");
            self.stack.send_response(&server.key, relayed).await?;
            return Ok(Outcome::Handled);
        }

        let Some(account) = tx_ctx.account().cloned() else {
            warn!(key = %client.key, "cannot process challenge: no trunk account");
            return Ok(Outcome::dropped("no trunk account"));
        };
        let call_id = call_id(&event.response)?;
        let method = cseq_method(&event.response)?;

        let failures = account.increment_failure_count(&call_id);
        let credential = match account.credential.as_ref() {
            Some(credential) if failures <= 1 && account.has_usable_credential() => credential,
            _ => {
                info!(
                    account = %account.sip_domain,
                    %call_id,
                    %method,
                    failures,
                    "could not authenticate with trunk"
                );
                account.set_state(AccountState::AuthenticationFailed);
                account.remove_failure_counter(&call_id);
                if let Some(b2bua) = event.dialog.as_ref().and_then(|d| self.owning_b2bua(d)) {
                    self.tear_down(
                        &b2bua,
                        ReasonCode::AuthenticationFailure,
                        "Could not authenticate request",
                    )
                    .await;
                }
                if account.claim_alarm() {
                    self.gateway
                        .raise_alarm(AlarmCode::AuthenticationFailed, &account.sip_domain);
                }
                return Ok(Outcome::Handled);
            }
        };

        let budget = if method == Method::Register {
            RetryBudget::Limited(0)
        } else {
            RetryBudget::Unlimited
        };
        let retry = self
            .auth
            .handle_challenge(&event.response, client, credential, budget)
            .await?;
        tx_ctx.set_client_transaction(retry.clone());
        if self.stack.transaction_state(&client.key) != TransactionState::Terminated {
            self.stack.terminate_transaction(&client.key);
        }
        store.detach_transaction(&client.key);
        store.attach_transaction(retry.key.clone(), tx_ctx.clone());

        let Some(dialog) = event.dialog.as_ref() else {
            self.stack.send_request(&retry).await?;
            return Ok(Outcome::Handled);
        };

        let Some(b2bua) = self.owning_b2bua(dialog) else {
            self.stack.send_request(&retry).await?;
            return Ok(Outcome::Handled);
        };
        let ctx = match b2bua.adopt_retry_dialog(store, dialog, &retry) {
            Ok(ctx) => ctx,
            Err(e) if b2bua.is_torn_down() => {
                warn!(%dialog, error = %e, "challenge retry of a torn down call");
                store.detach_transaction(&retry.key);
                return Ok(Outcome::dropped("call torn down"));
            }
            Err(e) => return Err(e),
        };

        if self.stack.dialog_state(dialog) == Some(DialogState::Confirmed) {
            if has_to_tag(&retry.request)? {
                self.stack.send_in_dialog(ctx.id(), &retry).await?;
            }
        } else {
            self.stack.send_request(&retry).await?;
        }

        if ctx.start_session_timer(
            self.stack.clone(),
            self.gateway.config().session_timer_interval,
        ) {
            debug!(dialog = %ctx.id(), "session timer started");
        }
        Ok(Outcome::Handled)
    }
}
