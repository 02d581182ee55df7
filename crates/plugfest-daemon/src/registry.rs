//! In-process registry of discovered devices

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use plugfest_bridge::session::SessionEvent;
use plugfest_bridge::{Bridge, Registry};
use plugfest_core::{DeviceMeta, ThingId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A device known to the daemon
#[derive(Clone)]
pub struct DeviceRecord {
    pub bridge: Arc<dyn Bridge>,
    pub meta: DeviceMeta,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Owns one bridge instance per thing id
pub struct DeviceRegistry {
    devices: RwLock<HashMap<ThingId, DeviceRecord>>,
    /// Events from every session
    events: broadcast::Sender<SessionEvent>,
}

impl DeviceRegistry {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(100);
        Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// All known devices, ordered by thing id
    pub fn devices(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<DeviceRecord> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.meta.thing_id.cmp(&b.meta.thing_id));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Disconnect every device
    pub fn shutdown(&self) {
        let devices: Vec<DeviceRecord> = self.devices.write().drain().map(|(_, r)| r).collect();
        for record in devices {
            record.bridge.disconnect();
        }
    }

    /// Connect a newly accepted bridge and forward its events
    fn start(&self, bridge: Arc<dyn Bridge>) {
        let Some(mut rx) = bridge.subscribe() else {
            return;
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let _ = events.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        tokio::spawn(async move {
            bridge.connect().await;
        });
    }
}

impl Registry for DeviceRegistry {
    fn discovered(&self, bridge: Arc<dyn Bridge>) {
        let Some(meta) = bridge.meta() else {
            debug!("Ignoring bridge without a device");
            return;
        };
        let now = Utc::now();

        {
            let mut devices = self.devices.write();
            match devices.get_mut(&meta.thing_id) {
                Some(record) if record.bridge.reachable() => {
                    record.last_seen = now;
                    debug!(thing_id = %meta.thing_id, "Device rediscovered, keeping session");
                    return;
                }
                Some(record) => {
                    info!(thing_id = %meta.thing_id, "Device rediscovered, replacing session");
                    record.bridge = bridge.clone();
                    record.meta = meta;
                    record.last_seen = now;
                }
                None => {
                    info!(thing_id = %meta.thing_id, name = %meta.display_name, "Device registered");
                    devices.insert(
                        meta.thing_id.clone(),
                        DeviceRecord {
                            bridge: bridge.clone(),
                            meta,
                            first_seen: now,
                            last_seen: now,
                        },
                    );
                }
            }
        }

        self.start(bridge);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use plugfest_bridge::{BridgeError, PushHandle, Result};
    use plugfest_core::StateMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct FakeBridge {
        meta: DeviceMeta,
        reachable: AtomicBool,
        connects: AtomicUsize,
        events: broadcast::Sender<SessionEvent>,
    }

    impl FakeBridge {
        fn new(token: &str) -> Arc<Self> {
            let (events, _) = broadcast::channel(8);
            Arc::new(Self {
                meta: DeviceMeta {
                    thing_id: ThingId::from_token(token),
                    display_name: token.to_string(),
                    content_type: "application/lighting+json".to_string(),
                },
                reachable: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                events,
            })
        }
    }

    #[async_trait]
    impl Bridge for FakeBridge {
        fn name(&self) -> &str {
            "FakeBridge"
        }

        fn discover(&self, _registry: Arc<dyn Registry>) -> Result<JoinHandle<()>> {
            Err(BridgeError::Configuration("not a template".into()))
        }

        async fn connect(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn disconnect(&self) {
            self.reachable.store(false, Ordering::SeqCst);
        }

        fn push(&self, _payload: StateMap) -> PushHandle {
            unimplemented!()
        }

        async fn pull(&self) -> Result<StateMap> {
            Err(BridgeError::NotConnected)
        }

        fn meta(&self) -> Option<DeviceMeta> {
            Some(self.meta.clone())
        }

        fn reachable(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }

        fn subscribe(&self) -> Option<broadcast::Receiver<SessionEvent>> {
            Some(self.events.subscribe())
        }

        fn state(&self) -> Option<StateMap> {
            None
        }
    }

    fn record(registry: &DeviceRegistry, token: &str) -> DeviceRecord {
        let thing_id = ThingId::from_token(token);
        registry
            .devices()
            .into_iter()
            .find(|r| r.meta.thing_id == thing_id)
            .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_new_device_is_registered_and_connected() {
        let registry = DeviceRegistry::new();
        let lamp = FakeBridge::new("lamp");

        registry.discovered(lamp.clone());
        settle().await;

        assert_eq!(registry.len(), 1);
        assert_eq!(lamp.connects.load(Ordering::SeqCst), 1);
        let record = record(&registry, "lamp");
        assert_eq!(record.meta.display_name, "lamp");
        assert_eq!(record.first_seen, record.last_seen);
    }

    #[tokio::test]
    async fn test_reachable_device_keeps_its_session() {
        let registry = DeviceRegistry::new();
        let first = FakeBridge::new("lamp");
        let second = FakeBridge::new("lamp");

        registry.discovered(first.clone());
        registry.discovered(second.clone());
        settle().await;

        assert_eq!(registry.len(), 1);
        assert_eq!(first.connects.load(Ordering::SeqCst), 1);
        assert_eq!(second.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_device_is_replaced() {
        let registry = DeviceRegistry::new();
        let first = FakeBridge::new("lamp");
        let second = FakeBridge::new("lamp");

        registry.discovered(first.clone());
        first.disconnect();
        registry.discovered(second.clone());
        settle().await;

        assert_eq!(registry.len(), 1);
        assert_eq!(second.connects.load(Ordering::SeqCst), 1);
        let record = record(&registry, "lamp");
        assert!(record.bridge.reachable());
        assert!(record.first_seen <= record.last_seen);
    }

    #[tokio::test]
    async fn test_events_are_forwarded() {
        let registry = DeviceRegistry::new();
        let mut events = registry.subscribe();
        let lamp = FakeBridge::new("lamp");
        registry.discovered(lamp.clone());
        settle().await;

        let event = SessionEvent::Disconnected {
            thing_id: ThingId::from_token("lamp"),
        };
        lamp.events.send(event.clone()).unwrap();
        assert_eq!(events.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_everything() {
        let registry = DeviceRegistry::new();
        let a = FakeBridge::new("a");
        let b = FakeBridge::new("b");
        registry.discovered(a.clone());
        registry.discovered(b.clone());
        assert_eq!(
            registry
                .devices()
                .iter()
                .map(|r| r.meta.display_name.as_str())
                .collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        registry.shutdown();
        assert!(registry.is_empty());
        assert!(!a.reachable());
        assert!(!b.reachable());
    }
}
