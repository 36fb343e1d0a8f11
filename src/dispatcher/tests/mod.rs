use super::*;
use crate::dialog::authenticate::Credential;
use crate::dialog::{DialogContext, MediaAssociation, MediaSessionHandle};
use crate::gateway::{AlarmCode, AlarmSink, GatewayBuilder, TrunkAccount};
use crate::mock::{self, MockStack};
use crate::resolver::Hop;
use crate::transaction::TransactionContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

mod test_fork;

#[derive(Default)]
struct RecordingCallControl {
    requests: Mutex<Vec<ServerTransaction>>,
    responses: Mutex<Vec<ResponseEvent>>,
    fail_responses: AtomicBool,
}

#[async_trait]
impl CallControlManager for RecordingCallControl {
    async fn process_request(&self, tx: ServerTransaction) -> Result<()> {
        self.requests.lock().unwrap().push(tx);
        Ok(())
    }

    async fn process_response(&self, event: &ResponseEvent) -> Result<()> {
        if self.fail_responses.load(Ordering::Acquire) {
            return Err(Error::Error("call control failed".to_string()));
        }
        self.responses.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingRegistration {
    responses: Mutex<Vec<ResponseEvent>>,
    timeouts: Mutex<Vec<TimeoutEvent>>,
}

#[async_trait]
impl RegistrationManager for RecordingRegistration {
    async fn process_response(&self, event: &ResponseEvent) -> Result<()> {
        self.responses.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn process_timeout(&self, event: &TimeoutEvent) -> Result<()> {
        self.timeouts.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingAlarms(Mutex<Vec<(AlarmCode, String)>>);

impl AlarmSink for RecordingAlarms {
    fn raise_alarm(&self, code: AlarmCode, detail: &str) {
        self.0.lock().unwrap().push((code, detail.to_string()));
    }
}

impl RecordingAlarms {
    fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

const PROXY_ADDR: &str = "10.0.0.2";

struct Harness {
    gateway: Arc<Gateway>,
    stack: Arc<MockStack>,
    call_control: Arc<RecordingCallControl>,
    registration: Arc<RecordingRegistration>,
    alarms: Arc<RecordingAlarms>,
    dispatcher: EventDispatcher,
}

fn harness() -> Harness {
    let harness = idle_harness();
    harness.gateway.start().expect("start gateway");
    harness
}

/// Harness whose gateway is still initializing.
fn idle_harness() -> Harness {
    let stack = Arc::new(MockStack::default());
    let alarms = Arc::new(RecordingAlarms::default());
    let gateway = GatewayBuilder::new()
        .with_proxy_address(PROXY_ADDR)
        .with_alarm_sink(alarms.clone())
        .with_initiator("gw-test")
        .try_build()
        .expect("build gateway");
    let call_control = Arc::new(RecordingCallControl::default());
    let registration = Arc::new(RecordingRegistration::default());
    let dispatcher = EventDispatcher::new(
        gateway.clone(),
        stack.clone(),
        call_control.clone(),
        registration.clone(),
    );
    Harness {
        gateway,
        stack,
        call_control,
        registration,
        alarms,
        dispatcher,
    }
}

fn trunk_account(password: Option<&str>) -> Arc<TrunkAccount> {
    Arc::new(TrunkAccount::new(
        "proxy.trunk.example.net",
        "trunk.example.net",
        password.map(|p| Credential {
            username: "gateway".to_string(),
            password: p.to_string(),
            realm: None,
        }),
    ))
}

fn hop(last: u8) -> Hop {
    Hop::new(
        format!("198.51.100.{}:5060", last).parse().unwrap(),
        rsip::Transport::Udp,
    )
}

/// One bridged call: the LAN leg from the proxy and its WAN leg to a trunk.
struct Call {
    b2bua: Arc<BackToBackUserAgent>,
    lan: Arc<DialogContext>,
    wan: Arc<DialogContext>,
    server: ServerTransaction,
    client: ClientTransaction,
    account: Arc<TrunkAccount>,
}

fn trunk_call(h: &Harness, call_id: &str, hops: Vec<Hop>) -> Call {
    let store = h.gateway.store();
    let stack: Arc<dyn SipStack> = h.stack.clone();
    let account = trunk_account(Some("secret"));
    let b2bua = BackToBackUserAgent::new(stack.clone());

    let lan_call_id = format!("{}-lan", call_id);
    let lan_request = mock::invite(&lan_call_id, "lan-tag");
    let server = ServerTransaction {
        key: stack
            .new_server_transaction(Listener::Lan, &lan_request)
            .unwrap(),
        listener: Listener::Lan,
        request: lan_request.clone(),
    };
    let lan = Arc::new(
        DialogContext::attach(
            &b2bua,
            DialogId::new(&lan_call_id, "gw-tag", "lan-tag"),
            Some(server.key.clone()),
            lan_request,
        )
        .unwrap(),
    );

    let wan_request = mock::invite(call_id, "wan-tag");
    let client = stack
        .new_client_transaction(Listener::Wan, wan_request.clone(), hops.first().cloned())
        .unwrap();
    let wan_dialog = client.dialog.clone().unwrap();
    let wan = Arc::new(
        DialogContext::attach(&b2bua, wan_dialog, Some(client.key.clone()), wan_request).unwrap(),
    );
    wan.set_media(MediaAssociation::Owned(MediaSessionHandle::new("rtp-1")));
    wan.set_account(Some(account.clone()));

    b2bua.add_dialog(lan.clone()).unwrap();
    b2bua.add_dialog(wan.clone()).unwrap();
    b2bua.link_peers(lan.id(), wan.id()).unwrap();
    store.attach_dialog(lan.clone());
    store.attach_dialog(wan.clone());
    store.register_b2bua(&lan_call_id, b2bua.clone());
    store.register_b2bua(call_id, b2bua.clone());

    let alternates: Vec<Hop> = hops.into_iter().skip(1).collect();
    store.attach_transaction(
        client.key.clone(),
        Arc::new(TransactionContext::for_trunk_invite(
            server.clone(),
            client.clone(),
            account.clone(),
            alternates,
        )),
    );
    Call {
        b2bua,
        lan,
        wan,
        server,
        client,
        account,
    }
}

fn response_event(
    listener: Listener,
    response: Response,
    transaction: Option<ClientTransaction>,
    dialog: Option<DialogId>,
) -> SipEvent {
    SipEvent::Response(ResponseEvent {
        listener,
        response,
        transaction,
        dialog,
    })
}
