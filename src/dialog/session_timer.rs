use super::DialogId;
use crate::stack::SipStack;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Periodic OPTIONS keepalive on an established dialog.
///
/// A keepalive that times out comes back to the dispatcher as an OPTIONS timeout
/// and tears the call down. Dropping the timer cancels it.
pub struct SessionTimer {
    cancel_token: CancellationToken,
}

impl SessionTimer {
    pub fn start(dialog: DialogId, stack: Arc<dyn SipStack>, interval: Duration) -> Self {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = stack.send_options(&dialog).await {
                            warn!(%dialog, error = %e, "session timer keepalive failed");
                        }
                    }
                }
            }
            debug!(%dialog, "session timer stopped");
        });
        Self { cancel_token }
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
