//! Signaling core of a SIP trunk gateway.
//!
//! The gateway acts as a back-to-back user agent between a local proxy (the
//! LAN side) and one or more SIP trunk providers (the WAN side). Every protocol
//! event delivered by the underlying stack enters through
//! [`dispatcher::EventDispatcher`], which consults the [`gateway::Gateway`] run
//! state and routes the event to challenge handling, fork resolution, failover,
//! or the call-control and registration collaborators.
pub mod b2bua;
pub mod dialog;
pub mod dispatcher;
mod error;
pub mod gateway;
#[cfg(test)]
pub(crate) mod mock;
pub mod resolver;
pub mod rsip_ext;
pub mod stack;
pub mod transaction;

pub use b2bua::{BackToBackUserAgent, ReasonCode};
pub use dispatcher::{EventDispatcher, EventLoop, Outcome, SipEvent};
pub use error::{Error, Result};
pub use gateway::{Gateway, GatewayBuilder, GatewayState};
