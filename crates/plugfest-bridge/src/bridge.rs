//! Device-adapter capability interface and the Plugfest implementation
//!
//! A bridge is either a template, which only knows how to discover, or an
//! instance bound to one discovered device. Discovery hands every new
//! instance to the host's [`Registry`].

use async_trait::async_trait;
use plugfest_coap::{TimeoutTransport, Transport};
use plugfest_core::{DeviceMeta, StateMap};
use plugfest_discovery::{Crawler, CrawlerConfig, DiscoveredDevice};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::listener::{SharedListener, DEFAULT_SERVER_PORT};
use crate::model::ModelKind;
use crate::queue::QueuePolicy;
use crate::session::{DeviceSession, PushHandle, SessionEvent, SessionOptions};

/// Capabilities every device adapter exposes to the host
#[async_trait]
pub trait Bridge: Send + Sync {
    fn name(&self) -> &str;

    /// Start discovering devices, reporting each to `registry`
    ///
    /// Configuration errors are returned before any network activity;
    /// otherwise the returned task runs until the crawl is exhausted.
    fn discover(&self, registry: Arc<dyn Registry>) -> Result<JoinHandle<()>>;

    async fn connect(&self);

    fn disconnect(&self);

    /// Queue a write of cooked values
    fn push(&self, payload: StateMap) -> PushHandle;

    /// Read the device now; returns the cooked state
    async fn pull(&self) -> Result<StateMap>;

    fn meta(&self) -> Option<DeviceMeta>;

    fn reachable(&self) -> bool;

    fn subscribe(&self) -> Option<broadcast::Receiver<SessionEvent>>;

    /// Cooked view of the last known state
    fn state(&self) -> Option<StateMap>;
}

/// Host-side receiver of discovered devices
pub trait Registry: Send + Sync {
    fn discovered(&self, bridge: Arc<dyn Bridge>);
}

/// `[bridge]` configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Any URL on the gateway; discovery starts at its well-known resource list
    pub url: Option<String>,
    /// Poll interval in seconds, 0 disables polling
    pub poll: u64,
    /// Host advertised to devices for the inbound listener
    pub server_host: Option<String>,
    pub server_port: u16,
    /// Use the inbound listener for devices with a config resource
    pub server: bool,
    /// Log every new device instance
    pub verbose: bool,
    pub model: ModelKind,
    pub queue: QueuePolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: None,
            poll: 30,
            server_host: None,
            server_port: DEFAULT_SERVER_PORT,
            server: true,
            verbose: true,
            model: ModelKind::default(),
            queue: QueuePolicy::default(),
        }
    }
}

impl BridgeConfig {
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll > 0).then(|| Duration::from_secs(self.poll))
    }
}

/// What every instance of one template shares
#[derive(Clone)]
struct Settings {
    config: BridgeConfig,
    crawler: CrawlerConfig,
    transport: Arc<dyn Transport>,
    listener: Option<SharedListener>,
}

impl Settings {
    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            poll: self.config.poll_interval(),
            projection: self.config.model.projection(),
            listener: self.listener.clone().filter(|_| self.config.server),
            queue_policy: self.config.queue,
        }
    }

    fn instance(&self, device: DiscoveredDevice) -> PlugfestBridge {
        let transport: Arc<dyn Transport> = Arc::new(TimeoutTransport::new(
            self.transport.clone(),
            self.crawler.fetch_timeout(),
        ));
        let session = DeviceSession::new(
            device.identity,
            device.state,
            transport,
            self.session_options(),
        );
        PlugfestBridge {
            settings: self.clone(),
            session: Some(session),
        }
    }
}

/// Bridge for Plugfest CoAP lighting devices
pub struct PlugfestBridge {
    settings: Settings,
    session: Option<DeviceSession>,
}

impl PlugfestBridge {
    /// A template bridge, used to start discovery
    pub fn new(config: BridgeConfig, crawler: CrawlerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            settings: Settings {
                config,
                crawler,
                transport,
                listener: None,
            },
            session: None,
        }
    }

    /// Share an inbound-notification listener with every instance
    pub fn with_listener(mut self, listener: SharedListener) -> Self {
        self.settings.listener = Some(listener);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.settings.config
    }

    /// An instance bound to `device`
    pub fn instance(&self, device: DiscoveredDevice) -> Self {
        self.settings.instance(device)
    }

    pub fn session(&self) -> Option<&DeviceSession> {
        self.session.as_ref()
    }
}

#[async_trait]
impl Bridge for PlugfestBridge {
    fn name(&self) -> &str {
        "PlugfestBridge"
    }

    fn discover(&self, registry: Arc<dyn Registry>) -> Result<JoinHandle<()>> {
        let crawler = Crawler::new(self.settings.transport.clone(), self.settings.crawler.clone());
        let mut devices = crawler.discover(self.settings.config.url.as_deref())?;
        info!(url = ?self.settings.config.url, "Discovery started");

        let settings = self.settings.clone();
        Ok(tokio::spawn(async move {
            while let Some(device) = devices.recv().await {
                let bridge = settings.instance(device);
                if settings.config.verbose {
                    if let Some(meta) = bridge.meta() {
                        info!(thing_id = %meta.thing_id, name = %meta.display_name, "New device");
                    }
                }
                registry.discovered(Arc::new(bridge));
            }
            debug!("Discovery finished");
        }))
    }

    async fn connect(&self) {
        if let Some(session) = &self.session {
            session.connect().await;
        }
    }

    fn disconnect(&self) {
        if let Some(session) = &self.session {
            session.disconnect();
        }
    }

    fn push(&self, payload: StateMap) -> PushHandle {
        match &self.session {
            Some(session) => session.push(payload),
            None => PushHandle::failed(BridgeError::NotConnected),
        }
    }

    async fn pull(&self) -> Result<StateMap> {
        match &self.session {
            Some(session) => session.pull().await,
            None => Err(BridgeError::NotConnected),
        }
    }

    fn meta(&self) -> Option<DeviceMeta> {
        self.session.as_ref().and_then(DeviceSession::meta)
    }

    fn reachable(&self) -> bool {
        self.session.as_ref().is_some_and(DeviceSession::reachable)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<SessionEvent>> {
        self.session.as_ref().and_then(DeviceSession::subscribe)
    }

    fn state(&self) -> Option<StateMap> {
        self.session
            .as_ref()
            .filter(|session| session.reachable())
            .map(DeviceSession::state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use plugfest_coap::mock::MockTransport;
    use serde_json::{json, Value};

    const LAMP_DOC: &str = r#"{"_embedded":{"item":[{
        "name":"Lamp","id":"lamp-1",
        "_links":{"about":{"type":"application/lighting+json","href":"/lamp/state"}}
    }]}}"#;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Arc<dyn Bridge>>>);

    impl Registry for Collect {
        fn discovered(&self, bridge: Arc<dyn Bridge>) {
            self.0.lock().push(bridge);
        }
    }

    fn template(mock: &Arc<MockTransport>, url: Option<&str>) -> PlugfestBridge {
        let config = BridgeConfig {
            url: url.map(str::to_string),
            poll: 0,
            ..Default::default()
        };
        let transport: Arc<dyn Transport> = mock.clone();
        PlugfestBridge::new(config, CrawlerConfig::default(), transport)
    }

    fn map(value: Value) -> StateMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_discover_without_url_fails_before_network() {
        let mock = Arc::new(MockTransport::new());
        let registry = Arc::new(Collect::default());

        let result = template(&mock, None).discover(registry.clone());
        assert!(matches!(result, Err(BridgeError::Configuration(_))));
        assert_eq!(mock.call_count(), 0);
        assert!(registry.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_template_has_no_device() {
        let mock = Arc::new(MockTransport::new());
        let bridge = template(&mock, Some("coap://h"));

        assert_eq!(bridge.name(), "PlugfestBridge");
        assert_eq!(bridge.meta(), None);
        assert!(!bridge.reachable());
        assert!(bridge.state().is_none());
        assert_eq!(bridge.pull().await, Err(BridgeError::NotConnected));
        assert_eq!(
            bridge.push(map(json!({"on": true}))).await,
            Err(BridgeError::NotConnected)
        );
        bridge.connect().await;
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovered_instance_syncs_with_device() {
        let mock = Arc::new(MockTransport::new());
        mock.respond("coap://h/.well-known/core", "</ostate>;ct=65201");
        mock.respond("coap://h/ostate", LAMP_DOC);
        mock.respond(
            "coap://h/lamp/state",
            r#"{"on":true,"hue":120.0,"saturation":1.0,"brightness":1.0}"#,
        );

        let registry = Arc::new(Collect::default());
        template(&mock, Some("coap://h/anything"))
            .discover(registry.clone())
            .unwrap()
            .await
            .unwrap();

        let bridge = registry.0.lock().pop().unwrap();
        let meta = bridge.meta().unwrap();
        assert_eq!(meta.thing_id.as_str(), "urn:iotdb:thing:Plugfest:lamp-1");
        assert_eq!(meta.display_name, "Lamp");
        assert!(bridge.reachable());

        // The light model adds the host-facing color
        let state = bridge.state().unwrap();
        assert_eq!(state.get("rgb"), Some(&json!("#00FF00")));

        bridge.connect().await;
        bridge.push(map(json!({"on": false}))).await.unwrap();
        let writes = mock.calls_to("coap://h/lamp/state");
        let body = writes
            .iter()
            .filter_map(|c| c.request.body())
            .next_back()
            .unwrap();
        assert_eq!(body, r#"{"on":false}"#);

        bridge.disconnect();
        assert!(!bridge.reachable());
        assert!(bridge.state().is_none());
    }

    #[test]
    fn test_config_defaults() {
        let config: BridgeConfig = serde_json::from_value(json!({"url": "coap://h"})).unwrap();
        assert_eq!(config.poll_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.server_port, 22000);
        assert!(config.server);
        assert_eq!(config.model, ModelKind::Light);

        let config = BridgeConfig {
            poll: 0,
            ..Default::default()
        };
        assert_eq!(config.poll_interval(), None);
    }
}
