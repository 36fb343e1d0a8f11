use super::{EventDispatcher, SipEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type EventSender = UnboundedSender<SipEvent>;
pub type EventReceiver = UnboundedReceiver<SipEvent>;

type LaneTable = Arc<Mutex<HashMap<String, EventSender>>>;

/// Feeds protocol events to the dispatcher, one lane per Call-ID.
///
/// Events of one call are processed in arrival order by the lane's task;
/// different calls proceed concurrently. An idle lane exits and is re-created
/// by the next event of its call.
pub struct EventLoop {
    dispatcher: Arc<EventDispatcher>,
    lanes: LaneTable,
    idle_timeout: Duration,
    cancel_token: CancellationToken,
}

impl EventLoop {
    pub fn new(dispatcher: Arc<EventDispatcher>, cancel_token: CancellationToken) -> Self {
        let idle_timeout = dispatcher.gateway().config().lane_idle_timeout;
        Self {
            dispatcher,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout,
            cancel_token,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.lock().unwrap().len()
    }

    pub async fn serve(&self, mut receiver: EventReceiver) {
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                event = receiver.recv() => match event {
                    Some(event) => self.route(event),
                    None => break,
                },
            }
        }
        info!("event loop stopped");
    }

    fn route(&self, event: SipEvent) {
        let call_id = event.call_id();
        let mut lanes = self.lanes.lock().unwrap();
        let event = match lanes.get(&call_id) {
            Some(sender) => match sender.send(event) {
                Ok(()) => return,
                // the lane exited between lookups
                Err(e) => e.0,
            },
            None => event,
        };

        let (sender, receiver) = unbounded_channel();
        if sender.send(event).is_err() {
            return;
        }
        lanes.insert(call_id.clone(), sender);
        debug!(%call_id, "lane created");
        tokio::spawn(run_lane(
            call_id,
            receiver,
            self.dispatcher.clone(),
            self.lanes.clone(),
            self.idle_timeout,
            self.cancel_token.child_token(),
        ));
    }
}

async fn run_lane(
    call_id: String,
    mut receiver: EventReceiver,
    dispatcher: Arc<EventDispatcher>,
    lanes: LaneTable,
    idle_timeout: Duration,
    cancel_token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel_token.cancelled() => break,
            next = tokio::time::timeout(idle_timeout, receiver.recv()) => next,
        };
        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                let pending = {
                    let mut lanes = lanes.lock().unwrap();
                    match receiver.try_recv() {
                        Ok(event) => Some(event),
                        Err(_) => {
                            lanes.remove(&call_id);
                            receiver.close();
                            None
                        }
                    }
                };
                match pending {
                    Some(event) => event,
                    None => break,
                }
            }
        };
        match dispatcher.dispatch(event).await {
            Ok(outcome) => debug!(%call_id, ?outcome, "event processed"),
            Err(e) => warn!(%call_id, error = %e, "event processing failed"),
        }
    }
    debug!(%call_id, "lane exited");
}
