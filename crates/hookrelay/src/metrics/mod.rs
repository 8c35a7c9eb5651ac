//! Metrics emitted by the relay.

pub mod events;
