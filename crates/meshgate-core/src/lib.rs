//! meshgate-core — wire format, crypto engine, domain event types, and
//! configuration. Every other meshgate crate depends on this one.

pub mod broadcast;
pub mod config;
pub mod crypto;
pub mod domain;
pub mod metrics;
pub mod wire;

pub use domain::{
    Channel, ChannelRole, HwModel, MessageEvent, NodeEvent, NodeId, NodeRole, PositionEvent,
    ProcessedEvent, TelemetryEvent, TracerouteEvent,
};
