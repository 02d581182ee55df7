//! Per-resource fetch steps used by the crawler

use plugfest_coap::{Transport, TransportError};
use plugfest_core::{
    classify, ContentFormat, CoapUrl, DeviceIdentity, DeviceState, HypermediaItem, Payload,
};
use tracing::{debug, trace, warn};

/// What a fetched resource contributed to the crawl
#[derive(Debug, Default, PartialEq)]
pub struct Expansion {
    /// Further resource lists to download
    pub resources: Vec<CoapUrl>,
    /// Devices whose state should be read
    pub devices: Vec<DeviceIdentity>,
}

/// Download one discovery resource and classify what it points at
pub async fn fetch_resource(
    transport: &dyn Transport,
    url: &CoapUrl,
) -> Result<Expansion, TransportError> {
    debug!(url = %url, "Downloading resource");
    let body = transport.get(url).await?;
    Ok(expand(url, &body))
}

/// Read a device's state resource for its initial snapshot
///
/// `Ok(None)` means the device answered with something other than a
/// JSON object.
pub async fn fetch_state(
    transport: &dyn Transport,
    identity: &DeviceIdentity,
) -> Result<Option<DeviceState>, TransportError> {
    let body = transport.get(&identity.url).await?;
    Ok(DeviceState::parse(&body))
}

/// Interpret a discovery body fetched from `url`
pub fn expand(url: &CoapUrl, body: &str) -> Expansion {
    match classify(body) {
        Payload::LinkFormat(descriptors) => {
            let mut expansion = Expansion::default();
            for descriptor in descriptors {
                match descriptor.content_format.map(ContentFormat::from_code) {
                    Some(ContentFormat::ResourceList) => {}
                    Some(ContentFormat::Registered(code)) => {
                        trace!(url = %url, href = %descriptor.url, ct = code, "Skipping registered text resource");
                        continue;
                    }
                    _ => continue,
                }
                match url.resolve(&descriptor.url) {
                    Ok(resource) => expansion.resources.push(resource),
                    Err(e) => {
                        warn!(url = %url, href = %descriptor.url, error = %e, "Unusable link target")
                    }
                }
            }
            expansion
        }
        Payload::Hypermedia(items) => Expansion {
            resources: Vec::new(),
            devices: devices_in(url, &items),
        },
        Payload::Unrecognized => {
            debug!(url = %url, "Ignoring unrecognized payload");
            Expansion::default()
        }
    }
}

/// Devices described by the items of one hypermedia document
///
/// A config link on the device's own item is its write resource. When the
/// document describes a single device, a config link on a sibling item is
/// paired with it.
pub fn devices_in(document: &CoapUrl, items: &[HypermediaItem]) -> Vec<DeviceIdentity> {
    let device_items: Vec<&HypermediaItem> = items.iter().filter(|i| i.is_device()).collect();
    if device_items.is_empty() {
        debug!(url = %document, items = items.len(), "Document describes no devices");
        return Vec::new();
    }

    let sibling_config = if device_items.len() == 1 {
        items
            .iter()
            .find(|i| !i.is_device() && i.has_config())
            .and_then(|i| i.config_url(document))
    } else {
        None
    };

    let mut devices = Vec::new();
    for item in device_items {
        let url = match item.about_url(document) {
            Some(Ok(url)) => url,
            Some(Err(e)) => {
                warn!(url = %document, error = %e, "Unusable about link");
                continue;
            }
            None => continue,
        };

        let config = match item.config_url(document).or_else(|| sibling_config.clone()) {
            Some(Ok(config)) => Some(config),
            Some(Err(e)) => {
                warn!(url = %document, error = %e, "Unusable config link, writing to state resource");
                None
            }
            None => None,
        };

        devices.push(DeviceIdentity::from_item(item, url, config));
    }
    devices
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugfest_core::parse_hypermedia;

    fn doc() -> CoapUrl {
        CoapUrl::parse("coap://10.0.0.5/ostate").unwrap()
    }

    #[test]
    fn test_expand_link_format_follows_resource_lists_only() {
        let body = "</a>;ct=65201, </b>;ct=65202, <c>;ct=65201, <coap://other/d>;ct=65201, </e>";
        let expansion = expand(&CoapUrl::parse("coap://h/x/index").unwrap(), body);
        let urls: Vec<String> = expansion.resources.iter().map(|u| u.to_string()).collect();
        assert_eq!(urls, vec!["coap://h/a", "coap://h/x/c", "coap://other/d"]);
        assert!(expansion.devices.is_empty());
    }

    #[test]
    fn test_expand_unrecognized() {
        assert_eq!(expand(&doc(), "hello"), Expansion::default());
        assert_eq!(expand(&doc(), ""), Expansion::default());
    }

    #[test]
    fn test_item_with_config_on_same_item() {
        let items = parse_hypermedia(
            r#"{"_embedded":{"item":[{
                "name":"Lamp","id":"lamp-1",
                "_links":{
                    "about":{"type":"application/lighting+json","href":"/lamp/state"},
                    "config":{"type":"application/lighting-config+json","href":"/lamp/config"}
                }}]}}"#,
        );
        let devices = devices_in(&doc(), &items);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].url.to_string(), "coap://10.0.0.5/lamp/state");
        assert_eq!(devices[0].config_url.to_string(), "coap://10.0.0.5/lamp/config");
        assert!(devices[0].has_config);
        assert_eq!(devices[0].thing_id.as_str(), "urn:iotdb:thing:Plugfest:lamp-1");
    }

    #[test]
    fn test_sibling_config_is_paired() {
        let items = parse_hypermedia(
            r#"{"_embedded":{"item":[
                {"name":"Lamp","_links":{"about":{"type":"application/lighting+json","href":"/state"}}},
                {"_base":"coap://10.0.0.9/","_links":{"config":{"type":"application/lighting-config+json","href":"/config"}}}
            ]}}"#,
        );
        let devices = devices_in(&doc(), &items);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].config_url.to_string(), "coap://10.0.0.9/config");
    }

    #[test]
    fn test_wrong_about_type_yields_nothing() {
        let items = parse_hypermedia(
            r#"{"_embedded":{"item":[
                {"_links":{"about":{"type":"text/plain","href":"/state"}}},
                {"_links":{"config":{"type":"application/lighting-config+json","href":"/config"}}}
            ]}}"#,
        );
        assert!(devices_in(&doc(), &items).is_empty());
    }

    #[test]
    fn test_sibling_config_not_paired_with_many_devices() {
        let items = parse_hypermedia(
            r#"{"_embedded":{"item":[
                {"name":"A","_links":{"about":{"type":"application/lighting+json","href":"/a"}}},
                {"name":"B","_links":{"about":{"type":"application/lighting+json","href":"/b"}}},
                {"_links":{"config":{"type":"application/lighting-config+json","href":"/config"}}}
            ]}}"#,
        );
        let devices = devices_in(&doc(), &items);
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| !d.has_config && d.config_url == d.url));
    }
}
