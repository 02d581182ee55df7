//! Process-wide inbound notification listener
//!
//! Devices that advertise a config resource are told to observe a route on
//! this listener instead of being written to directly. One listener serves
//! every session: the first session to need it binds the port, concurrent
//! sessions wait for that bind, and a failed bind is retried by the next
//! session that asks.

use parking_lot::Mutex;
use plugfest_coap::{InboundRequest, ListenerBinder, UdpBinder};
use plugfest_core::{DeviceState, ThingId, CONFIG_CONTENT_TYPE};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

/// Default listener port
pub const DEFAULT_SERVER_PORT: u16 = 22000;

/// Route prefix for per-session state streams
const ROUTE_PREFIX: &str = "/ostate";

#[derive(Clone)]
struct Route {
    thing_id: ThingId,
    state: watch::Receiver<DeviceState>,
    cancel: CancellationToken,
}

struct Bound {
    base_url: String,
    routes: Mutex<HashMap<String, Route>>,
}

struct Inner {
    binder: Arc<dyn ListenerBinder>,
    host: Option<String>,
    port: u16,
    bound: OnceCell<Arc<Bound>>,
    next_route: AtomicUsize,
}

/// Handle to the shared listener; clones refer to the same listener
#[derive(Clone)]
pub struct SharedListener {
    inner: Arc<Inner>,
}

impl SharedListener {
    /// A listener that binds through `binder` on first use
    ///
    /// `host` is the address advertised to devices; when unset the first
    /// non-loopback IPv4 interface address is used.
    pub fn new(binder: Arc<dyn ListenerBinder>, host: Option<String>, port: u16) -> Self {
        Self {
            inner: Arc::new(Inner {
                binder,
                host,
                port,
                bound: OnceCell::new(),
                next_route: AtomicUsize::new(0),
            }),
        }
    }

    /// A CoAP over UDP listener
    pub fn udp(host: Option<String>, port: u16) -> Self {
        Self::new(Arc::new(UdpBinder::new()), host, port)
    }

    /// Advertised base URL, once bound
    pub fn base_url(&self) -> Option<String> {
        self.inner.bound.get().map(|bound| bound.base_url.clone())
    }

    pub fn is_bound(&self) -> bool {
        self.inner.bound.initialized()
    }

    /// Routes currently being served
    pub fn route_count(&self) -> usize {
        self.inner
            .bound
            .get()
            .map(|bound| bound.routes.lock().len())
            .unwrap_or(0)
    }

    /// Serve `state` on a fresh route until `cancel` fires
    ///
    /// Returns the route's absolute URL, to be handed to the device.
    pub async fn register(
        &self,
        thing_id: &ThingId,
        state: watch::Receiver<DeviceState>,
        cancel: CancellationToken,
    ) -> Result<String> {
        let bound = self.acquire().await?;

        let index = self.inner.next_route.fetch_add(1, Ordering::SeqCst) + 1;
        let path = format!("{}/{}", ROUTE_PREFIX, index);
        let url = format!("{}{}", bound.base_url, path);

        bound.routes.lock().insert(
            path.clone(),
            Route {
                thing_id: thing_id.clone(),
                state,
                cancel: cancel.clone(),
            },
        );
        info!(thing_id = %thing_id, update_url = %url, "Listening for CoAP requests");

        let routes = bound.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            routes.routes.lock().remove(&path);
            debug!(path = %path, "Route removed");
        });

        Ok(url)
    }

    async fn acquire(&self) -> Result<Arc<Bound>> {
        let inner = &self.inner;
        let bound = inner
            .bound
            .get_or_try_init(|| async {
                let requests = inner.binder.bind(inner.port).await.map_err(|e| {
                    warn!(port = inner.port, error = %e, "Could not create a CoAP server");
                    BridgeError::Listener(e.to_string())
                })?;

                let host = match &inner.host {
                    Some(host) => host.clone(),
                    None => external_ipv4().to_string(),
                };
                let bound = Arc::new(Bound {
                    base_url: format!("coap://{}:{}", host, inner.port),
                    routes: Mutex::new(HashMap::new()),
                });
                info!(url = %bound.base_url, "CoAP listener ready");

                tokio::spawn(dispatch(bound.clone(), requests));
                Ok::<_, BridgeError>(bound)
            })
            .await?;
        Ok(bound.clone())
    }
}

/// Registration document telling a device where to observe its desired state
pub fn registration_body(update_url: &str) -> Value {
    json!({
        "_base": null,
        "_embedded": null,
        "_forms": {
            "update": {
                "accept": CONFIG_CONTENT_TYPE,
                "href": "",
                "method": "PUT"
            }
        },
        "_links": null,
        "src": {
            "href": update_url,
            "type": null,
            "x": 1
        }
    })
}

async fn dispatch(bound: Arc<Bound>, mut requests: mpsc::Receiver<InboundRequest>) {
    while let Some(request) = requests.recv().await {
        let route = bound.routes.lock().get(&request.path).cloned();
        match route {
            Some(route) => {
                tokio::spawn(serve(request, route));
            }
            None => debug!(path = %request.path, "Ignoring request for unknown route"),
        }
    }
    debug!("CoAP listener closed");
}

/// Answer the current state, then stream changes for observers
async fn serve(request: InboundRequest, mut route: Route) {
    let snapshot = route.state.borrow_and_update().clone();
    if request.respond(line(&snapshot)).await.is_err() {
        return;
    }
    if !request.observe {
        return;
    }

    debug!(thing_id = %route.thing_id, path = %request.path, "Remote subscribed");
    loop {
        tokio::select! {
            _ = route.cancel.cancelled() => break,
            _ = request.closed() => break,
            changed = route.state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = route.state.borrow_and_update().clone();
                if request.respond(line(&snapshot)).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!(thing_id = %route.thing_id, path = %request.path, "Remote subscription ended");
}

fn line(state: &DeviceState) -> String {
    format!("{}\n", state.to_json())
}

/// First non-loopback IPv4 address, falling back to loopback
fn external_ipv4() -> Ipv4Addr {
    use network_interface::{NetworkInterface, NetworkInterfaceConfig};

    NetworkInterface::show()
        .unwrap_or_default()
        .into_iter()
        .flat_map(|iface| iface.addr.into_iter())
        .find_map(|addr| match addr {
            network_interface::Addr::V4(v4) if !v4.ip.is_loopback() => Some(v4.ip),
            _ => None,
        })
        .unwrap_or(Ipv4Addr::LOCALHOST)
}
