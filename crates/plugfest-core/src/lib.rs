//! Plugfest Core - Core types, resource-description parsing, and device state
//!
//! This crate provides the foundational types for the Plugfest bridge:
//! - CoAP URL parsing and resolution
//! - Link-format and JSON hypermedia parsing for resource discovery
//! - Device identity and metadata derived at discovery time
//! - Device state snapshots with shallow-merge change detection

pub mod device;
pub mod links;
pub mod state;
pub mod url;

pub use device::{
    DeviceIdentity, DeviceMeta, ThingId, CONFIG_CONTENT_TYPE, DEFAULT_DISPLAY_NAME,
    LIGHTING_CONTENT_TYPE, THING_NAMESPACE,
};
pub use links::{
    classify, parse_hypermedia, parse_link_format, ContentFormat, HypermediaItem, Link, Payload,
    ResourceDescriptor, REGISTERED_FORMATS, RESOURCE_LIST_FORMAT,
};
pub use state::{DeviceState, StateMap};
pub use url::{CoapUrl, UrlError, DEFAULT_COAP_PORT, WELL_KNOWN_CORE};
