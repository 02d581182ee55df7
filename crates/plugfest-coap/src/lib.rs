//! Plugfest CoAP - Transport boundary for the Plugfest bridge
//!
//! The bridge talks to devices through the [`Transport`] trait: one-shot
//! requests and observe streams. The optional inbound-notification mode
//! receives requests through a [`ListenerBinder`]. UDP implementations of
//! both are provided; message encoding is delegated to `coap-lite`.

#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod server;
pub mod timeout;
pub mod transport;
pub mod udp;

pub use server::{InboundRequest, ListenerBinder, UdpBinder};
pub use timeout::TimeoutTransport;
pub use transport::{
    Method, Observation, ObservationFeed, Request, Transport, TransportError, TransportErrorKind,
};
pub use udp::UdpTransport;
