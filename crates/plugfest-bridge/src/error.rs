//! Bridge error taxonomy

use plugfest_coap::TransportError;
use plugfest_discovery::DiscoveryError;
use thiserror::Error;

/// Errors surfaced by bridges and device sessions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Required configuration is missing or unusable; raised before any network activity
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A body did not contain usable data
    #[error("parse error: {0}")]
    Parse(String),

    /// The operation needs a connected device
    #[error("not connected")]
    NotConnected,

    #[error("listener error: {0}")]
    Listener(String),
}

impl From<DiscoveryError> for BridgeError {
    fn from(e: DiscoveryError) -> Self {
        match e {
            DiscoveryError::Configuration(message) => BridgeError::Configuration(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
