//! Resource-description parsing for discovery
//!
//! Two dialects show up while crawling a device network:
//! - CoRE link-format (`</path>;ct=65201,...`), as served by `.well-known/core`
//! - JSON hypermedia documents carrying `_embedded.item` entries with
//!   `about` (readable state) and `config` (writable state) links
//!
//! Parsing never fails: a body that lacks the expected structure simply
//! yields nothing usable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::device::{CONFIG_CONTENT_TYPE, LIGHTING_CONTENT_TYPE};
use crate::url::{CoapUrl, UrlError};

/// Content-format code for a machine-readable resource list worth recursing into
pub const RESOURCE_LIST_FORMAT: u16 = 65201;

/// Content-format codes reserved by this integration (all text payloads)
pub const REGISTERED_FORMATS: [u16; 4] = [65201, 65202, 65203, 65204];

/// Classification of a content-format code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    /// Machine-readable resource list (65201)
    ResourceList,
    /// One of the other reserved opaque-text registrations
    Registered(u16),
    /// Any other code
    Other(u16),
}

impl ContentFormat {
    pub fn from_code(code: u16) -> Self {
        if code == RESOURCE_LIST_FORMAT {
            Self::ResourceList
        } else if REGISTERED_FORMATS.contains(&code) {
            Self::Registered(code)
        } else {
            Self::Other(code)
        }
    }
}

/// One entry of a link-format document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Link target, absolute or relative to the document
    pub url: String,
    /// Numeric `ct` attribute, if present and numeric
    pub content_format: Option<u16>,
    /// Remaining link attributes (`rt`, `if`, `title`, ...)
    pub attributes: BTreeMap<String, String>,
}

impl ResourceDescriptor {
    /// Whether this entry points at another resource list
    pub fn is_resource_list(&self) -> bool {
        self.content_format.map(ContentFormat::from_code) == Some(ContentFormat::ResourceList)
    }
}

/// A typed link inside a hypermedia item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    #[serde(rename = "type")]
    pub media_type: Option<String>,
    pub href: Option<String>,
}

impl Link {
    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            media_type: obj.get("type").and_then(Value::as_str).map(str::to_string),
            href: obj.get("href").and_then(Value::as_str).map(str::to_string),
        })
    }

    fn has_type(&self, media_type: &str) -> bool {
        self.media_type.as_deref() == Some(media_type)
    }
}

/// One `_embedded.item` entry of a hypermedia document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HypermediaItem {
    /// `_links.about`: current-state resource
    pub about: Option<Link>,
    /// `_links.config`: write resource
    pub config: Option<Link>,
    /// `_base`: resolution base for this item's links
    pub base: Option<String>,
    pub name: Option<String>,
    pub purpose: Option<String>,
    /// Vendor-supplied unique id (`id`, else `uuid`)
    pub unique_id: Option<String>,
}

impl HypermediaItem {
    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let links = obj.get("_links").and_then(Value::as_object);
        let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);

        Some(Self {
            about: links.and_then(|l| l.get("about")).and_then(Link::from_value),
            config: links.and_then(|l| l.get("config")).and_then(Link::from_value),
            base: text("_base").filter(|b| !b.is_empty()),
            name: text("name"),
            purpose: text("purpose"),
            unique_id: text("id").or_else(|| text("uuid")),
        })
    }

    /// Carries an `about` link of the recognized lighting type
    pub fn is_device(&self) -> bool {
        self.about_href().is_some()
    }

    /// Carries a `config` link of the recognized config type
    pub fn has_config(&self) -> bool {
        self.config_href().is_some()
    }

    pub fn about_href(&self) -> Option<&str> {
        self.about
            .as_ref()
            .filter(|l| l.has_type(LIGHTING_CONTENT_TYPE))
            .and_then(|l| l.href.as_deref())
    }

    pub fn config_href(&self) -> Option<&str> {
        self.config
            .as_ref()
            .filter(|l| l.has_type(CONFIG_CONTENT_TYPE))
            .and_then(|l| l.href.as_deref())
    }

    /// Resolution base: `_base` if declared, else the document's root
    pub fn resolve_base(&self, document: &CoapUrl) -> Result<CoapUrl, UrlError> {
        match &self.base {
            Some(base) => document.resolve(base),
            None => Ok(document.root()),
        }
    }

    /// Absolute URL of the state resource
    pub fn about_url(&self, document: &CoapUrl) -> Option<Result<CoapUrl, UrlError>> {
        let href = self.about_href()?;
        Some(self.resolve_base(document).and_then(|base| base.resolve(href)))
    }

    /// Absolute URL of the config resource
    pub fn config_url(&self, document: &CoapUrl) -> Option<Result<CoapUrl, UrlError>> {
        let href = self.config_href()?;
        Some(self.resolve_base(document).and_then(|base| base.resolve(href)))
    }
}

/// A classified discovery response body
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    LinkFormat(Vec<ResourceDescriptor>),
    Hypermedia(Vec<HypermediaItem>),
    Unrecognized,
}

/// Sniff the first non-whitespace character and parse accordingly
pub fn classify(body: &str) -> Payload {
    match body.trim_start().chars().next() {
        Some('<') => Payload::LinkFormat(parse_link_format(body)),
        Some('{') => Payload::Hypermedia(parse_hypermedia(body)),
        _ => Payload::Unrecognized,
    }
}

/// Parse a CoRE link-format document
///
/// Duplicate targets keep their first occurrence.
pub fn parse_link_format(body: &str) -> Vec<ResourceDescriptor> {
    let mut descriptors: Vec<ResourceDescriptor> = Vec::new();

    for entry in split_unquoted(body, ',') {
        let entry = entry.trim();
        let Some(rest) = entry.strip_prefix('<') else {
            continue;
        };
        let Some(end) = rest.find('>') else {
            continue;
        };
        let url = rest[..end].trim().to_string();
        if url.is_empty() || descriptors.iter().any(|d| d.url == url) {
            continue;
        }

        let mut content_format = None;
        let mut attributes = BTreeMap::new();
        for param in split_unquoted(&rest[end + 1..], ';') {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            let (key, value) = match param.split_once('=') {
                Some((key, value)) => (key.trim(), unquote(value.trim())),
                None => (param, String::new()),
            };
            if key == "ct" {
                content_format = value
                    .split_whitespace()
                    .next()
                    .and_then(|code| code.parse::<u16>().ok());
            } else {
                attributes.insert(key.to_string(), value);
            }
        }

        descriptors.push(ResourceDescriptor {
            url,
            content_format,
            attributes,
        });
    }

    descriptors
}

/// Parse the `_embedded.item` entries of a JSON hypermedia document
pub fn parse_hypermedia(body: &str) -> Vec<HypermediaItem> {
    let document: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "Ignoring malformed hypermedia document");
            return Vec::new();
        }
    };

    match document.pointer("/_embedded/item") {
        Some(Value::Array(items)) => items.iter().filter_map(HypermediaItem::from_value).collect(),
        Some(item @ Value::Object(_)) => HypermediaItem::from_value(item).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Split on `sep` outside of `<...>` and double quotes
fn split_unquoted(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut start = 0;

    for (idx, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            c if c == sep && !in_quotes && !in_angle => {
                parts.push(&input[start..idx]);
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORE: &str = r#"</lights>;ct=65201;rt="core.rd",</hello>;ct=0,</.well-known/core>;ct=40,</lights>;ct=0"#;

    const DOCUMENT: &str = r#"{
        "_embedded": {
            "item": [
                {
                    "name": "Desk Lamp",
                    "purpose": "reading",
                    "id": "lamp-0042",
                    "_links": {
                        "about": { "href": "/lamp/state", "type": "application/lighting+json" },
                        "config": { "href": "/lamp/config", "type": "application/lighting-config+json" }
                    }
                },
                {
                    "name": "Thermostat",
                    "_links": {
                        "about": { "href": "/temp", "type": "application/thermostat+json" }
                    }
                }
            ]
        }
    }"#;

    #[test]
    fn test_parse_link_format() {
        let links = parse_link_format(CORE);
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].url, "/lights");
        assert_eq!(links[0].content_format, Some(65201));
        assert_eq!(links[0].attributes.get("rt").map(String::as_str), Some("core.rd"));
        assert!(links[0].is_resource_list());
        assert!(!links[1].is_resource_list());
        assert_eq!(links[2].content_format, Some(40));
    }

    #[test]
    fn test_parse_link_format_tolerates_garbage() {
        let links = parse_link_format(r#"<a>;ct=abc, junk, <>;ct=1, <b>;title="x,y";ct="65201 0""#);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].url, "a");
        assert_eq!(links[0].content_format, None);
        assert_eq!(links[1].url, "b");
        assert_eq!(links[1].attributes.get("title").map(String::as_str), Some("x,y"));
        assert_eq!(links[1].content_format, Some(65201));
    }

    #[test]
    fn test_content_format_classification() {
        assert_eq!(ContentFormat::from_code(65201), ContentFormat::ResourceList);
        assert_eq!(ContentFormat::from_code(65203), ContentFormat::Registered(65203));
        assert_eq!(ContentFormat::from_code(50), ContentFormat::Other(50));
    }

    #[test]
    fn test_parse_hypermedia() {
        let items = parse_hypermedia(DOCUMENT);
        assert_eq!(items.len(), 2);

        let lamp = &items[0];
        assert!(lamp.is_device());
        assert!(lamp.has_config());
        assert_eq!(lamp.name.as_deref(), Some("Desk Lamp"));
        assert_eq!(lamp.purpose.as_deref(), Some("reading"));
        assert_eq!(lamp.unique_id.as_deref(), Some("lamp-0042"));

        // Wrong about type: not a device
        assert!(!items[1].is_device());
        assert!(items[1].about_url(&CoapUrl::parse("coap://h/").unwrap()).is_none());
    }

    #[test]
    fn test_item_url_resolution() {
        let items = parse_hypermedia(DOCUMENT);
        let doc = CoapUrl::parse("coap://10.0.0.5:5683/lights").unwrap();

        let about = items[0].about_url(&doc).unwrap().unwrap();
        assert_eq!(about.to_string(), "coap://10.0.0.5:5683/lamp/state");

        let config = items[0].config_url(&doc).unwrap().unwrap();
        assert_eq!(config.to_string(), "coap://10.0.0.5:5683/lamp/config");
    }

    #[test]
    fn test_item_declared_base() {
        let body = r#"{"_embedded":{"item":{"_base":"coap://10.0.0.9:61616/",
            "_links":{"about":{"href":"state","type":"application/lighting+json"}}}}}"#;
        let items = parse_hypermedia(body);
        assert_eq!(items.len(), 1);

        let doc = CoapUrl::parse("coap://10.0.0.5/lights").unwrap();
        let about = items[0].about_url(&doc).unwrap().unwrap();
        assert_eq!(about.to_string(), "coap://10.0.0.9:61616/state");
    }

    #[test]
    fn test_parse_hypermedia_missing_fields() {
        assert!(parse_hypermedia("{").is_empty());
        assert!(parse_hypermedia("{}").is_empty());
        assert!(parse_hypermedia(r#"{"_embedded":{"item":[1, "x", {}]}}"#)
            .iter()
            .all(|item| !item.is_device()));
    }

    #[test]
    fn test_classify() {
        assert!(matches!(classify("  \n</a>;ct=65201"), Payload::LinkFormat(l) if l.len() == 1));
        assert!(matches!(classify(DOCUMENT), Payload::Hypermedia(i) if i.len() == 2));
        assert_eq!(classify("hello world"), Payload::Unrecognized);
        assert_eq!(classify(""), Payload::Unrecognized);
    }
}
