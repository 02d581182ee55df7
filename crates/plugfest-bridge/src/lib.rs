//! Plugfest Bridge - Device sessions for Plugfest CoAP lighting devices
//!
//! A [`PlugfestBridge`] template discovers devices and hands one bridge
//! instance per device to the host [`Registry`]. Each instance owns a
//! [`DeviceSession`] that keeps a local mirror of the device state in sync
//! through observe, optional polling and queued writes.

pub mod bridge;
pub mod color;
pub mod error;
pub mod listener;
pub mod model;
pub mod models;
pub mod queue;
pub mod session;

pub use bridge::{Bridge, BridgeConfig, PlugfestBridge, Registry};
pub use error::{BridgeError, Result};
pub use listener::{SharedListener, DEFAULT_SERVER_PORT};
pub use model::{GenericModel, ModelKind, Projection};
pub use models::PlugfestLight;
pub use queue::{Completion, QueuePolicy, WriteQueue};
pub use session::{DeviceSession, PushHandle, SessionEvent, SessionOptions};
