//! soarlink - action dispatch core for incident-response connectors
//!
//! Attaches a process to the platform's STOMP broker, turns queued action,
//! function, inbound and low-code messages into typed events, runs the
//! registered handlers on a bounded worker pool, and reports status and
//! results back with exactly one final reply and one acknowledgement per
//! message.

pub mod app;
pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod guard;
pub mod registry;
pub mod rest;
pub mod runtime;
pub mod stomp;
pub mod test_actions;
pub mod utils;

pub use dispatch::{Component, Debounce, Handled, HandlerError, HandlerResult, Invocation, Yield};
pub use event::{ChannelKey, TypedEvent};
pub use runtime::{Runtime, RuntimeError, RuntimeHandle};
