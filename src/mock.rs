//! In-memory stack and message builders shared by the unit tests.
use crate::dialog::DialogId;
use crate::resolver::Hop;
use crate::stack::{
    ClientTransaction, DialogState, Listener, SipStack, TransactionState,
};
use crate::transaction::{TransactionKey, TransactionRole};
use crate::Result;
use async_trait::async_trait;
use rsip::headers::*;
use rsip::{Method, Request, Response, StatusCode};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Clone, Debug)]
pub enum Sent {
    Response {
        key: TransactionKey,
        response: Response,
    },
    Request {
        tx: ClientTransaction,
    },
    InDialog {
        dialog: DialogId,
        tx: ClientTransaction,
    },
    Ack {
        dialog: DialogId,
        cseq: u32,
    },
    Bye {
        dialog: DialogId,
        reason: Option<String>,
    },
    Options {
        dialog: DialogId,
    },
    Terminate(TransactionKey),
    DeleteDialog(DialogId),
}

/// Records every outbound operation instead of sending it.
#[derive(Default)]
pub struct MockStack {
    sent: Mutex<Vec<Sent>>,
    dialog_states: Mutex<HashMap<DialogId, DialogState>>,
    terminated: Mutex<HashSet<TransactionKey>>,
    next_dialogs: Mutex<VecDeque<DialogId>>,
}

impl MockStack {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn set_dialog_state(&self, dialog: &DialogId, state: DialogState) {
        self.dialog_states
            .lock()
            .unwrap()
            .insert(dialog.clone(), state);
    }

    pub fn set_terminated(&self, key: &TransactionKey) {
        self.terminated.lock().unwrap().insert(key.clone());
    }

    /// Dialog reported for the next client transaction created.
    pub fn push_next_dialog(&self, dialog: DialogId) {
        self.next_dialogs.lock().unwrap().push_back(dialog);
    }

    pub fn responses(&self) -> Vec<(TransactionKey, Response)> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Response { key, response } => Some((key, response)),
                _ => None,
            })
            .collect()
    }

    pub fn requests(&self) -> Vec<ClientTransaction> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Request { tx } => Some(tx),
                _ => None,
            })
            .collect()
    }

    pub fn byes(&self) -> Vec<(DialogId, Option<String>)> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Bye { dialog, reason } => Some((dialog, reason)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, sent: Sent) {
        self.sent.lock().unwrap().push(sent);
    }
}

#[async_trait]
impl SipStack for MockStack {
    fn new_server_transaction(
        &self,
        _listener: Listener,
        request: &Request,
    ) -> Result<TransactionKey> {
        TransactionKey::from_request(request, TransactionRole::Server)
    }

    fn new_client_transaction(
        &self,
        listener: Listener,
        request: Request,
        hop: Option<Hop>,
    ) -> Result<ClientTransaction> {
        let dialog = match self.next_dialogs.lock().unwrap().pop_front() {
            Some(dialog) => Some(dialog),
            None => DialogId::from_uac_request(&request).ok(),
        };
        Ok(ClientTransaction {
            key: TransactionKey::from_request(&request, TransactionRole::Client)?,
            listener,
            request,
            dialog,
            destination: hop,
        })
    }

    async fn send_response(&self, server: &TransactionKey, response: Response) -> Result<()> {
        self.record(Sent::Response {
            key: server.clone(),
            response,
        });
        Ok(())
    }

    async fn send_request(&self, tx: &ClientTransaction) -> Result<()> {
        self.record(Sent::Request { tx: tx.clone() });
        Ok(())
    }

    async fn send_in_dialog(&self, dialog: &DialogId, tx: &ClientTransaction) -> Result<()> {
        self.record(Sent::InDialog {
            dialog: dialog.clone(),
            tx: tx.clone(),
        });
        Ok(())
    }

    async fn send_ack(&self, dialog: &DialogId, cseq: u32) -> Result<()> {
        self.record(Sent::Ack {
            dialog: dialog.clone(),
            cseq,
        });
        Ok(())
    }

    async fn send_bye(&self, dialog: &DialogId, reason: Option<String>) -> Result<()> {
        self.record(Sent::Bye {
            dialog: dialog.clone(),
            reason,
        });
        Ok(())
    }

    async fn send_options(&self, dialog: &DialogId) -> Result<()> {
        self.record(Sent::Options {
            dialog: dialog.clone(),
        });
        Ok(())
    }

    fn terminate_transaction(&self, key: &TransactionKey) {
        self.terminated.lock().unwrap().insert(key.clone());
        self.record(Sent::Terminate(key.clone()));
    }

    fn delete_dialog(&self, dialog: &DialogId) {
        self.record(Sent::DeleteDialog(dialog.clone()));
    }

    fn dialog_state(&self, dialog: &DialogId) -> Option<DialogState> {
        self.dialog_states.lock().unwrap().get(dialog).copied()
    }

    fn transaction_state(&self, key: &TransactionKey) -> TransactionState {
        if self.terminated.lock().unwrap().contains(key) {
            TransactionState::Terminated
        } else {
            TransactionState::Proceeding
        }
    }
}

pub fn request(method: Method, call_id: &str, from_tag: &str, to_tag: Option<&str>) -> Request {
    let to = match to_tag {
        Some(tag) => format!("<sip:bob@trunk.example.net>;tag={}", tag),
        None => "<sip:bob@trunk.example.net>".to_string(),
    };
    Request {
        method: method.clone(),
        uri: rsip::Uri::try_from("sip:bob@trunk.example.net").unwrap(),
        headers: vec![
            Via::new(&format!(
                "SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK{}",
                crate::transaction::random_text(10)
            ))
            .into(),
            CSeq::new(&format!("1 {}", method)).into(),
            From::new(&format!("<sip:alice@lan.example.com>;tag={}", from_tag)).into(),
            To::new(&to).into(),
            CallId::new(call_id).into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: vec![],
    }
}

pub fn invite(call_id: &str, from_tag: &str) -> Request {
    request(Method::Invite, call_id, from_tag, None)
}

/// Response to `request` with `to_tag` on the To header.
pub fn response(request: &Request, status: StatusCode, to_tag: &str) -> Response {
    let mut headers: Vec<rsip::Header> = request
        .headers
        .iter()
        .filter(|h| {
            matches!(
                h,
                rsip::Header::Via(_)
                    | rsip::Header::From(_)
                    | rsip::Header::CallId(_)
                    | rsip::Header::CSeq(_)
            )
        })
        .cloned()
        .collect();
    headers.push(To::new(&format!("<sip:bob@trunk.example.net>;tag={}", to_tag)).into());
    Response {
        status_code: status,
        version: rsip::Version::V2,
        headers: headers.into(),
        body: vec![],
    }
}

pub fn challenge(request: &Request, status: StatusCode) -> Response {
    let mut resp = response(request, status.clone(), "chal");
    let value = r#"Digest realm="trunk.example.net", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", algorithm=MD5, qop="auth""#;
    let header: rsip::Header = if status == StatusCode::ProxyAuthenticationRequired {
        ProxyAuthenticate::new(value).into()
    } else {
        WwwAuthenticate::new(value).into()
    };
    resp.headers.push(header);
    resp
}
