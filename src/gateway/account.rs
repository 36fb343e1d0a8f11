use crate::dialog::authenticate::Credential;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountState {
    Ok,
    AuthenticationFailed,
}

/// One configured trunk provider account and its authentication bookkeeping.
pub struct TrunkAccount {
    /// Domain the trunk's proxies are resolved from.
    pub proxy_domain: String,
    /// Domain used in From/To and alarm reports.
    pub sip_domain: String,
    pub credential: Option<Credential>,
    state: Mutex<AccountState>,
    failure_counts: Mutex<HashMap<String, u32>>,
    alarm_sent: AtomicBool,
}

impl std::fmt::Debug for TrunkAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrunkAccount")
            .field("proxy_domain", &self.proxy_domain)
            .field("sip_domain", &self.sip_domain)
            .field("state", &self.state())
            .finish()
    }
}

impl TrunkAccount {
    pub fn new(proxy_domain: &str, sip_domain: &str, credential: Option<Credential>) -> Self {
        Self {
            proxy_domain: proxy_domain.to_string(),
            sip_domain: sip_domain.to_string(),
            credential,
            state: Mutex::new(AccountState::Ok),
            failure_counts: Mutex::new(HashMap::new()),
            alarm_sent: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> AccountState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: AccountState) {
        *self.state.lock().unwrap() = state;
    }

    /// Record one more authentication failure for `call_id` and return the new count.
    pub fn increment_failure_count(&self, call_id: &str) -> u32 {
        let mut counts = self.failure_counts.lock().unwrap();
        let count = counts.entry(call_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn failure_count(&self, call_id: &str) -> u32 {
        self.failure_counts
            .lock()
            .unwrap()
            .get(call_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn remove_failure_counter(&self, call_id: &str) {
        self.failure_counts.lock().unwrap().remove(call_id);
    }

    pub fn has_usable_credential(&self) -> bool {
        self.credential
            .as_ref()
            .map(|c| !c.password.is_empty())
            .unwrap_or(false)
    }

    pub fn is_alarm_sent(&self) -> bool {
        self.alarm_sent.load(Ordering::Acquire)
    }

    /// Returns true for exactly one caller until [`TrunkAccount::reset_alarm`].
    pub fn claim_alarm(&self) -> bool {
        self.alarm_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Called when the account authenticates again after a failure episode.
    pub fn reset_alarm(&self) {
        self.set_state(AccountState::Ok);
        self.alarm_sent.store(false, Ordering::Release);
    }
}
