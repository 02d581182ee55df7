//! Device identity types for discovered lighting devices

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::links::HypermediaItem;
use crate::url::CoapUrl;

/// Media type of a lighting state resource
pub const LIGHTING_CONTENT_TYPE: &str = "application/lighting+json";

/// Media type of a lighting config resource
pub const CONFIG_CONTENT_TYPE: &str = "application/lighting-config+json";

/// Namespace all thing identifiers are minted under
pub const THING_NAMESPACE: &str = "Plugfest";

/// Display name used when a device does not supply one
pub const DEFAULT_DISPLAY_NAME: &str = "Plugfest";

/// Stable thing identifier, e.g. `urn:iotdb:thing:Plugfest:lamp-0042`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThingId(pub String);

impl ThingId {
    /// Mint an identifier from a unique token within [`THING_NAMESPACE`]
    pub fn from_token(token: &str) -> Self {
        Self(format!("urn:iotdb:thing:{}:{}", THING_NAMESPACE, token))
    }

    /// Derive the identifier for a device
    ///
    /// A device-supplied unique id is used verbatim. Otherwise the token
    /// is a hash of the device name, or of the state URL for unnamed
    /// devices, so rediscovery of the same device yields the same id.
    pub fn derive(unique_id: Option<&str>, name: Option<&str>, url: &CoapUrl) -> Self {
        if let Some(id) = unique_id.map(str::trim).filter(|id| !id.is_empty()) {
            return Self::from_token(id);
        }

        let source = match name {
            Some(name) => name.to_string(),
            None => url.to_string(),
        };
        let digest = Sha256::digest(source.as_bytes());
        Self::from_token(&hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ThingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a discovered device, fixed at discovery time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub thing_id: ThingId,
    /// Human-readable name supplied by the device
    pub name: Option<String>,
    /// Human-readable purpose supplied by the device
    pub purpose: Option<String>,
    /// State resource, used for reads and observes
    pub url: CoapUrl,
    /// Write resource; the state resource unless a config link was advertised
    pub config_url: CoapUrl,
    /// Whether `config_url` came from an advertised config link
    pub has_config: bool,
    pub content_type: String,
}

impl DeviceIdentity {
    /// Build an identity for a device with the given state resource
    pub fn new(url: CoapUrl) -> Self {
        Self {
            thing_id: ThingId::derive(None, None, &url),
            name: None,
            purpose: None,
            config_url: url.clone(),
            url,
            has_config: false,
            content_type: LIGHTING_CONTENT_TYPE.to_string(),
        }
    }

    /// Build an identity from a hypermedia item and its resolved URLs
    pub fn from_item(item: &HypermediaItem, url: CoapUrl, config_url: Option<CoapUrl>) -> Self {
        Self {
            thing_id: ThingId::derive(item.unique_id.as_deref(), item.name.as_deref(), &url),
            name: item.name.clone(),
            purpose: item.purpose.clone(),
            has_config: config_url.is_some(),
            config_url: config_url.unwrap_or_else(|| url.clone()),
            url,
            content_type: LIGHTING_CONTENT_TYPE.to_string(),
        }
    }

    /// Set a separate write resource
    pub fn with_config_url(mut self, config_url: CoapUrl) -> Self {
        self.config_url = config_url;
        self.has_config = true;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_DISPLAY_NAME)
    }

    /// Read-only metadata snapshot
    pub fn meta(&self) -> DeviceMeta {
        DeviceMeta {
            thing_id: self.thing_id.clone(),
            display_name: self.display_name().to_string(),
            content_type: self.content_type.clone(),
        }
    }
}

/// Metadata exposed to the host for a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMeta {
    pub thing_id: ThingId,
    pub display_name: String,
    pub content_type: String,
}
