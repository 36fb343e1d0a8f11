//! Single ingress for protocol events.
//!
//! The underlying stack reports every request, response, timeout and
//! lifecycle notification as a [`SipEvent`]. [`EventDispatcher::dispatch`]
//! runs the admission checks against the gateway run state and routes the
//! event to challenge handling, fork resolution, failover, or one of the
//! call-control and registration collaborators.
//!
//! Each event is an isolated unit of work: a fault while processing one event
//! is returned as [`Error::SystemFault`] and never affects other calls.
use crate::b2bua::{BackToBackUserAgent, ReasonCode};
use crate::dialog::authenticate::{AuthenticationHelper, DigestAuthenticator};
use crate::dialog::DialogId;
use crate::gateway::{Gateway, GatewayState};
use crate::rsip_ext::{
    call_id, cseq_method, has_to_tag, is_challenge, is_success, make_response, top_via_sender,
    warning_header,
};
use crate::stack::{ClientTransaction, DialogState, Listener, ServerTransaction, SipStack};
use crate::transaction::{Operation, TransactionKey};
use crate::{Error, Result};
use async_trait::async_trait;
use rsip::{Method, Request, Response, StatusCode, Transport};
use std::sync::Arc;
use tracing::{debug, info, warn};

mod auth;
mod event_loop;
mod fork;
mod timeout;

#[cfg(test)]
mod tests;

pub use event_loop::{EventLoop, EventReceiver, EventSender};

#[derive(Clone, Debug)]
pub struct RequestEvent {
    pub listener: Listener,
    pub request: Request,
}

#[derive(Clone, Debug)]
pub struct ResponseEvent {
    pub listener: Listener,
    pub response: Response,
    /// Client transaction the response matched, if any.
    pub transaction: Option<ClientTransaction>,
    /// Dialog the response belongs to, as seen by the stack.
    pub dialog: Option<DialogId>,
}

#[derive(Clone, Debug)]
pub struct TimeoutEvent {
    pub transaction: ClientTransaction,
}

#[derive(Clone, Debug)]
pub struct TransactionTerminatedEvent {
    pub key: TransactionKey,
    pub request: Request,
    pub dialog: Option<DialogId>,
}

#[derive(Clone, Debug)]
pub enum SipEvent {
    Request(RequestEvent),
    Response(ResponseEvent),
    Timeout(TimeoutEvent),
    DialogTerminated(DialogId),
    TransactionTerminated(TransactionTerminatedEvent),
    TransportError {
        host: String,
        port: u16,
        transport: Transport,
    },
}

impl SipEvent {
    /// Call-ID the event belongs to. Empty for events outside any call.
    pub fn call_id(&self) -> String {
        let call_id = match self {
            SipEvent::Request(e) => call_id(&e.request).ok(),
            SipEvent::Response(e) => call_id(&e.response).ok(),
            SipEvent::Timeout(e) => call_id(&e.transaction.request).ok(),
            SipEvent::DialogTerminated(id) => Some(id.call_id.clone()),
            SipEvent::TransactionTerminated(e) => call_id(&e.request).ok(),
            SipEvent::TransportError { .. } => None,
        };
        call_id.unwrap_or_default()
    }
}

/// What the dispatcher did with one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    Delegated,
    Rejected(StatusCode),
    Dropped(String),
}

impl Outcome {
    fn dropped(reason: &str) -> Self {
        Outcome::Dropped(reason.to_string())
    }
}

/// Method-specific routing of INVITE-family dialogs.
#[async_trait]
pub trait CallControlManager: Send + Sync {
    async fn process_request(&self, tx: ServerTransaction) -> Result<()>;
    async fn process_response(&self, event: &ResponseEvent) -> Result<()>;
}

/// Trunk registration flows.
#[async_trait]
pub trait RegistrationManager: Send + Sync {
    async fn process_response(&self, event: &ResponseEvent) -> Result<()>;
    async fn process_timeout(&self, event: &TimeoutEvent) -> Result<()>;
}

pub struct EventDispatcher {
    gateway: Arc<Gateway>,
    stack: Arc<dyn SipStack>,
    call_control: Arc<dyn CallControlManager>,
    registration: Arc<dyn RegistrationManager>,
    auth: Arc<dyn AuthenticationHelper>,
}

impl EventDispatcher {
    pub fn new(
        gateway: Arc<Gateway>,
        stack: Arc<dyn SipStack>,
        call_control: Arc<dyn CallControlManager>,
        registration: Arc<dyn RegistrationManager>,
    ) -> Self {
        let auth = Arc::new(DigestAuthenticator::new(stack.clone()));
        Self {
            gateway,
            stack,
            call_control,
            registration,
            auth,
        }
    }

    pub fn with_authentication_helper(mut self, auth: Arc<dyn AuthenticationHelper>) -> Self {
        self.auth = auth;
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Authorize a new request of an already challenged call before it is
    /// sent, so call control does not pay another challenge round trip.
    pub fn authorize(&self, request: &mut Request) -> Result<bool> {
        self.auth.authorize(request)
    }

    pub async fn dispatch(&self, event: SipEvent) -> Result<Outcome> {
        let result = match event {
            SipEvent::Request(e) => self.on_request(e).await,
            SipEvent::Response(e) => self.on_response(e).await,
            SipEvent::Timeout(e) => self.on_timeout(e).await,
            SipEvent::DialogTerminated(id) => Ok(self.on_dialog_terminated(&id)),
            SipEvent::TransactionTerminated(e) => self.on_transaction_terminated(e),
            SipEvent::TransportError {
                host,
                port,
                transport,
            } => {
                warn!(%host, port, %transport, "transport error");
                Ok(Outcome::Handled)
            }
        };
        result.map_err(Error::into_system_fault)
    }

    async fn on_request(&self, event: RequestEvent) -> Result<Outcome> {
        let RequestEvent { listener, request } = event;
        debug!(%listener, method = %request.method, uri = %request.uri, "request received");

        match self.gateway.state() {
            GatewayState::Stopping => return Ok(Outcome::dropped("gateway stopping")),
            GatewayState::Initializing => {
                return self
                    .reject(
                        listener,
                        &request,
                        StatusCode::ServiceUnavailable,
                        Some("Gateway is initializing -- try later"),
                    )
                    .await;
            }
            GatewayState::Running => {}
        }

        if listener == Listener::Lan
            && request.method == Method::Invite
            && !self.is_sent_by_proxy(&request)?
        {
            return self
                .reject(
                    listener,
                    &request,
                    StatusCode::Forbidden,
                    Some("Request not issued from proxy server"),
                )
                .await;
        }

        match request.method {
            Method::Invite
            | Method::Ack
            | Method::Cancel
            | Method::Bye
            | Method::Options
            | Method::Refer
            | Method::PRack => {
                let key = self.stack.new_server_transaction(listener, &request)?;
                self.call_control
                    .process_request(ServerTransaction {
                        key,
                        listener,
                        request,
                    })
                    .await?;
                Ok(Outcome::Delegated)
            }
            _ => {
                self.reject(listener, &request, StatusCode::MethodNotAllowed, None)
                    .await
            }
        }
    }

    fn is_sent_by_proxy(&self, request: &Request) -> Result<bool> {
        let (received, host) = top_via_sender(request)?;
        if let Some(received) = received {
            if !self.gateway.is_address_from_proxy(&received) {
                return Ok(false);
            }
        }
        Ok(self.gateway.is_address_from_proxy(&host))
    }

    async fn reject(
        &self,
        listener: Listener,
        request: &Request,
        status: StatusCode,
        warning: Option<&str>,
    ) -> Result<Outcome> {
        if request.method == Method::Ack {
            return Ok(Outcome::dropped("cannot reject ack"));
        }
        info!(%listener, method = %request.method, %status, ?warning, "rejecting request");
        let key = self.stack.new_server_transaction(listener, request)?;
        let headers = warning.map(|text| vec![warning_header(text)]);
        let response = make_response(request, status.clone(), headers, None)?;
        self.stack.send_response(&key, response).await?;
        Ok(Outcome::Rejected(status))
    }

    async fn on_response(&self, event: ResponseEvent) -> Result<Outcome> {
        if self.gateway.state() == GatewayState::Stopping {
            return Ok(Outcome::dropped("gateway stopping"));
        }
        debug!(
            listener = %event.listener,
            status = %event.response.status_code,
            dialog = ?event.dialog,
            "response received"
        );

        let result = self.process_response(&event).await;
        if let Err(e) = &result {
            warn!(error = %e, "unexpected error processing response");
            if let Some(b2bua) = event.dialog.as_ref().and_then(|d| self.owning_b2bua(d)) {
                self.tear_down(&b2bua, ReasonCode::ProtocolError, "Error processing response")
                    .await;
            }
        }
        result
    }

    async fn process_response(&self, event: &ResponseEvent) -> Result<Outcome> {
        let response = &event.response;
        let method = cseq_method(response)?;

        if method == Method::Invite {
            if let Some(dialog) = event.dialog.as_ref() {
                if self.gateway.store().dialog(dialog).is_none() {
                    if let Some(outcome) = self.resolve_fork(event, dialog).await? {
                        return Ok(outcome);
                    }
                }
            }
        }

        if is_challenge(&response.status_code) {
            return self.handle_challenge(event).await;
        }

        let account = event
            .transaction
            .as_ref()
            .and_then(|tx| self.gateway.store().transaction(&tx.key))
            .and_then(|ctx| ctx.account().cloned());
        if let Some(account) = account {
            if is_success(&response.status_code) {
                account.remove_failure_counter(&call_id(response)?);
                if method == Method::Register && account.is_alarm_sent() {
                    info!(account = %account.sip_domain, "trunk account authenticated again");
                    account.reset_alarm();
                }
            }
        }

        match method {
            Method::Register => {
                self.registration.process_response(event).await?;
                Ok(Outcome::Delegated)
            }
            Method::Invite | Method::Cancel | Method::Bye | Method::Refer | Method::Options => {
                self.call_control.process_response(event).await?;
                Ok(Outcome::Delegated)
            }
            other => {
                warn!(method = %other, "dropping response");
                Ok(Outcome::Dropped(format!("unhandled {} response", other)))
            }
        }
    }

    fn on_dialog_terminated(&self, id: &DialogId) -> Outcome {
        let Some(ctx) = self.gateway.store().detach_dialog(id) else {
            return Outcome::dropped("no dialog context");
        };
        ctx.cancel_session_timer();
        if let Some(b2bua) = ctx.b2bua() {
            b2bua.remove_dialog(id);
            if b2bua.is_empty() {
                self.gateway.store().release_b2bua(&b2bua);
            }
        }
        debug!(%id, "dialog terminated");
        Outcome::Handled
    }

    fn on_transaction_terminated(&self, event: TransactionTerminatedEvent) -> Result<Outcome> {
        let ctx = self.gateway.store().detach_transaction(&event.key);
        if event.request.method != Method::Invite || has_to_tag(&event.request)? {
            return Ok(Outcome::Handled);
        }
        let confirmed = event
            .dialog
            .as_ref()
            .map(|d| self.stack.dialog_state(d) == Some(DialogState::Confirmed))
            .unwrap_or(false);
        let to_trunk = ctx.map(|c| c.operation()) == Some(Operation::SendInviteToTrunk);
        if confirmed && to_trunk {
            let count = self.gateway.increment_established_calls();
            info!(key = %event.key, established_calls = count, "trunk call established");
        }
        Ok(Outcome::Handled)
    }

    fn owning_b2bua(&self, dialog: &DialogId) -> Option<Arc<BackToBackUserAgent>> {
        self.gateway.store().dialog(dialog).and_then(|ctx| ctx.b2bua())
    }

    /// Tear the call down and release it from the store.
    async fn tear_down(&self, b2bua: &Arc<BackToBackUserAgent>, reason: ReasonCode, text: &str) {
        if b2bua.tear_down(self.gateway.initiator(), reason, text).await {
            self.gateway.store().release_b2bua(b2bua);
        }
    }
}
