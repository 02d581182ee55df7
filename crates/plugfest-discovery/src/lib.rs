//! Plugfest Discovery - Link-following discovery of CoAP lighting devices
//!
//! Discovery starts at an origin's `/.well-known/core` and follows:
//! - link-format entries advertising the machine-readable resource list format
//! - JSON hypermedia items with a lighting `about` link (and optional `config`)
//!
//! Every qualifying device has its state read once before it is reported.

pub mod crawler;
pub mod fetch;

pub use crawler::{
    CrawlSummary, Crawler, CrawlerConfig, DiscoveredDevice, DiscoveryError,
};
