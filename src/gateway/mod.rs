//! Process-wide gateway context.
//!
//! [`Gateway`] is passed explicitly to the dispatcher. It carries the run
//! state, the trunk account registry, the alarm sink, the established-call
//! counter and the [`ContextStore`] of transaction, dialog and call metadata.
//!
//! # Lifecycle
//!
//! ```text
//! Initializing --start()--> Running --stop()--> Stopping
//! ```
//!
//! `stop()` is final: a stopped gateway cannot be started again.
use crate::resolver::{Hop, HopResolver, LookupSource};
use crate::{Error, Result};
use rsip::Domain;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info};

pub mod account;
pub mod store;

pub use account::{AccountState, TrunkAccount};
pub use store::ContextStore;

pub const DEFAULT_SESSION_TIMER_INTERVAL: Duration = Duration::from_secs(1800);
pub const DEFAULT_LANE_IDLE_TIMEOUT: Duration = Duration::from_secs(32);
pub const DEFAULT_INITIATOR: &str = "sipbridge";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayState {
    Initializing,
    Running,
    Stopping,
}

impl GatewayState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => GatewayState::Initializing,
            1 => GatewayState::Running,
            _ => GatewayState::Stopping,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AlarmCode {
    AuthenticationFailed,
}

impl std::fmt::Display for AlarmCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlarmCode::AuthenticationFailed => write!(f, "TRUNK_AUTHENTICATION_FAILED"),
        }
    }
}

/// Operator-facing alarm delivery. Fire and forget.
pub trait AlarmSink: Send + Sync {
    fn raise_alarm(&self, code: AlarmCode, detail: &str);
}

/// Emits alarms as `tracing` error events.
#[derive(Debug, Default)]
pub struct LogAlarmSink;

impl AlarmSink for LogAlarmSink {
    fn raise_alarm(&self, code: AlarmCode, detail: &str) {
        error!(%code, detail, "alarm raised");
    }
}

pub struct GatewayConfig {
    /// Hosts (addresses or names) the local proxy sends from.
    pub proxy_addresses: Vec<String>,
    pub accounts: Vec<Arc<TrunkAccount>>,
    pub session_timer_interval: Duration,
    pub lane_idle_timeout: Duration,
    /// User name carried in the Reason header of gateway-initiated teardowns.
    pub initiator: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            proxy_addresses: Vec::new(),
            accounts: Vec::new(),
            session_timer_interval: DEFAULT_SESSION_TIMER_INTERVAL,
            lane_idle_timeout: DEFAULT_LANE_IDLE_TIMEOUT,
            initiator: DEFAULT_INITIATOR.to_string(),
        }
    }
}

pub struct Gateway {
    config: GatewayConfig,
    state: AtomicU8,
    accounts: RwLock<HashMap<String, Arc<TrunkAccount>>>,
    alarm_sink: Arc<dyn AlarmSink>,
    resolver: HopResolver,
    established_calls: AtomicU64,
    store: ContextStore,
}

impl Gateway {
    pub fn state(&self) -> GatewayState {
        GatewayState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn start(&self) -> Result<()> {
        match self.state.compare_exchange(
            GatewayState::Initializing as u8,
            GatewayState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                info!(accounts = self.accounts.read().unwrap().len(), "gateway running");
                Ok(())
            }
            Err(current) => Err(Error::Error(format!(
                "cannot start gateway in state {:?}",
                GatewayState::from_u8(current)
            ))),
        }
    }

    pub fn stop(&self) {
        let previous = self.state.swap(GatewayState::Stopping as u8, Ordering::AcqRel);
        if previous != GatewayState::Stopping as u8 {
            info!(
                established_calls = self.established_call_count(),
                "gateway stopping"
            );
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    pub fn initiator(&self) -> &str {
        &self.config.initiator
    }

    /// Whether `host` is one of the configured proxy addresses.
    pub fn is_address_from_proxy(&self, host: &str) -> bool {
        self.config.proxy_addresses.iter().any(|a| a == host)
    }

    pub fn add_account(&self, account: Arc<TrunkAccount>) {
        self.accounts
            .write()
            .unwrap()
            .insert(account.sip_domain.clone(), account);
    }

    pub fn account(&self, sip_domain: &str) -> Option<Arc<TrunkAccount>> {
        self.accounts.read().unwrap().get(sip_domain).cloned()
    }

    pub fn accounts(&self) -> Vec<Arc<TrunkAccount>> {
        self.accounts.read().unwrap().values().cloned().collect()
    }

    pub fn raise_alarm(&self, code: AlarmCode, detail: &str) {
        self.alarm_sink.raise_alarm(code, detail);
    }

    pub fn increment_established_calls(&self) -> u64 {
        self.established_calls.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn established_call_count(&self) -> u64 {
        self.established_calls.load(Ordering::Relaxed)
    }

    /// Ordered candidate hops of `account`'s proxy domain.
    pub async fn resolve_trunk_hops(&self, account: &TrunkAccount) -> Result<Vec<Hop>> {
        let domain = Domain::from(account.proxy_domain.clone());
        self.resolver.resolve(&domain, None, None, false).await
    }
}

/// Builder for [`Gateway`]
///
/// ```rust,no_run
/// use sipbridge::GatewayBuilder;
///
/// # fn example() -> sipbridge::Result<()> {
/// let gateway = GatewayBuilder::new()
///     .with_proxy_address("10.0.0.2")
///     .with_initiator("gw-1")
///     .try_build()?;
/// gateway.start()?;
/// # Ok(())
/// # }
/// ```
pub struct GatewayBuilder {
    config: GatewayConfig,
    alarm_sink: Option<Arc<dyn AlarmSink>>,
    lookup: Option<Arc<dyn LookupSource>>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            alarm_sink: None,
            lookup: None,
        }
    }

    pub fn with_config(&mut self, config: GatewayConfig) -> &mut Self {
        self.config = config;
        self
    }

    pub fn with_proxy_address(&mut self, host: &str) -> &mut Self {
        self.config.proxy_addresses.push(host.to_string());
        self
    }

    pub fn with_account(&mut self, account: Arc<TrunkAccount>) -> &mut Self {
        self.config.accounts.push(account);
        self
    }

    pub fn with_alarm_sink(&mut self, sink: Arc<dyn AlarmSink>) -> &mut Self {
        self.alarm_sink = Some(sink);
        self
    }

    pub fn with_lookup_source(&mut self, source: Arc<dyn LookupSource>) -> &mut Self {
        self.lookup = Some(source);
        self
    }

    pub fn with_session_timer_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.session_timer_interval = interval;
        self
    }

    pub fn with_lane_idle_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.lane_idle_timeout = timeout;
        self
    }

    pub fn with_initiator(&mut self, initiator: &str) -> &mut Self {
        self.config.initiator = initiator.to_string();
        self
    }

    pub fn build(&mut self) -> Arc<Gateway> {
        let config = std::mem::take(&mut self.config);
        let accounts = config
            .accounts
            .iter()
            .map(|a| (a.sip_domain.clone(), a.clone()))
            .collect();
        let resolver = match self.lookup.take() {
            Some(source) => HopResolver::new(source),
            None => HopResolver::default(),
        };
        Arc::new(Gateway {
            config,
            state: AtomicU8::new(GatewayState::Initializing as u8),
            accounts: RwLock::new(accounts),
            alarm_sink: self
                .alarm_sink
                .take()
                .unwrap_or_else(|| Arc::new(LogAlarmSink)),
            resolver,
            established_calls: AtomicU64::new(0),
            store: ContextStore::new(),
        })
    }

    pub fn try_build(&mut self) -> Result<Arc<Gateway>> {
        if self.config.proxy_addresses.is_empty() {
            return Err(Error::Configuration(
                "at least one proxy address is required".to_string(),
            ));
        }
        if self.config.session_timer_interval.is_zero() {
            return Err(Error::Configuration(
                "session timer interval must be positive".to_string(),
            ));
        }
        Ok(self.build())
    }
}
