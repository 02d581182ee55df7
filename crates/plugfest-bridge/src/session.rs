//! Synchronization lifecycle for one device
//!
//! A connected session runs a single actor task that owns the device
//! state. The observe stream, the poll timer and on-demand pulls are
//! producers feeding its mailbox, and queued writes execute inside it one
//! at a time, so every merge happens in one place.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use plugfest_coap::{Request, Transport, TransportError};
use plugfest_core::{DeviceIdentity, DeviceMeta, DeviceState, StateMap, ThingId};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::listener::{registration_body, SharedListener};
use crate::model::{GenericModel, Projection};
use crate::queue::{QueuePolicy, WriteQueue};

/// Session events buffered per subscriber
const EVENT_BUFFER: usize = 64;

/// Delay before re-registering a failed or ended observation
const OBSERVE_RETRY: Duration = Duration::from_secs(30);

/// Change notifications from a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// State changed; `state` is the cooked view
    StateChanged { thing_id: ThingId, state: StateMap },
    /// The session was disconnected and the device forgotten
    Disconnected { thing_id: ThingId },
}

/// Per-session behavior
#[derive(Clone)]
pub struct SessionOptions {
    /// Plain read interval alongside the observation; `None` disables polling
    pub poll: Option<Duration>,
    pub projection: Arc<dyn Projection>,
    /// Inbound-notification listener, used for devices with a config resource
    pub listener: Option<SharedListener>,
    pub queue_policy: QueuePolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            poll: Some(Duration::from_secs(30)),
            projection: Arc::new(GenericModel),
            listener: None,
            queue_policy: QueuePolicy::default(),
        }
    }
}

/// Resolves with the outcome of one queued write
#[must_use = "a push reports its outcome only when awaited"]
pub struct PushHandle(oneshot::Receiver<Result<()>>);

impl PushHandle {
    pub(crate) fn failed(error: BridgeError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self(rx)
    }
}

impl Future for PushHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(BridgeError::NotConnected)))
    }
}

/// Where an update came from, for logging
#[derive(Debug, Clone, Copy)]
enum Source {
    Observe,
    Poll,
    Pull,
}

enum Command {
    Update {
        result: std::result::Result<String, TransportError>,
        source: Source,
        reply: Option<oneshot::Sender<Result<StateMap>>>,
    },
    Push {
        payload: StateMap,
        key: Option<String>,
        done: oneshot::Sender<Result<()>>,
    },
}

/// How a queued write reaches the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// `PUT` the raw payload to the config resource
    Direct,
    /// Publish to the listener route the device observes
    Listener,
}

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

struct Inner {
    /// The device; `None` once forgotten
    identity: Option<DeviceIdentity>,
    running: Option<Running>,
    events: Option<broadcast::Sender<SessionEvent>>,
}

/// Synchronization session for one discovered device
pub struct DeviceSession {
    transport: Arc<dyn Transport>,
    options: SessionOptions,
    inner: Mutex<Inner>,
    /// Raw state; receivers only wake for locally pushed changes
    state: Arc<watch::Sender<DeviceState>>,
    /// Held while cancelling and while the actor publishes a merge
    gate: Arc<Mutex<()>>,
}

impl DeviceSession {
    /// Create a disconnected session seeded with the state read at discovery
    pub fn new(
        identity: DeviceIdentity,
        state: DeviceState,
        transport: Arc<dyn Transport>,
        options: SessionOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (state, _) = watch::channel(state);
        Self {
            transport,
            options,
            inner: Mutex::new(Inner {
                identity: Some(identity),
                running: None,
                events: Some(events),
            }),
            state: Arc::new(state),
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Start synchronizing
    ///
    /// Reads the current state, registers an observation and, when
    /// configured, arms the poll timer. Restarts a running session; does
    /// nothing once the device has been forgotten.
    pub async fn connect(&self) {
        let (identity, events) = {
            let mut inner = self.inner.lock();
            let (Some(identity), Some(events)) = (inner.identity.clone(), inner.events.clone())
            else {
                debug!("Device forgotten, not connecting");
                return;
            };
            if let Some(running) = inner.running.take() {
                info!(thing_id = %identity.thing_id, "Restarting session");
                let _gate = self.gate.lock();
                running.cancel.cancel();
            }
            (identity, events)
        };

        let cancel = CancellationToken::new();
        let mode = self.register_listener(&identity, &cancel).await;

        let (commands, mailbox) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock();
            if inner.identity.is_none() {
                // Disconnected while registering
                cancel.cancel();
                return;
            }
            if let Some(previous) = inner.running.replace(Running {
                commands: commands.clone(),
                cancel: cancel.clone(),
            }) {
                let _gate = self.gate.lock();
                previous.cancel.cancel();
            }
        }

        let actor = SessionActor {
            identity: identity.clone(),
            transport: self.transport.clone(),
            projection: self.options.projection.clone(),
            state: self.state.borrow().clone(),
            published: self.state.clone(),
            gate: self.gate.clone(),
            queue: WriteQueue::new(self.options.queue_policy),
            mode,
            events,
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run(mailbox));

        tokio::spawn(observe_loop(
            self.transport.clone(),
            identity.clone(),
            commands.clone(),
            cancel.clone(),
        ));
        if let Some(period) = self.options.poll.filter(|p| !p.is_zero()) {
            tokio::spawn(poll_loop(
                self.transport.clone(),
                identity.clone(),
                period,
                commands,
                cancel,
            ));
        }

        info!(
            thing_id = %identity.thing_id,
            url = %identity.url,
            listener = (mode == WriteMode::Listener),
            "Connected"
        );

        if let Err(e) = self.pull().await {
            debug!(thing_id = %identity.thing_id, error = %e, "Initial read failed, keeping last known state");
        }
    }

    /// Read the device once and merge the result
    ///
    /// Returns the cooked state after the merge.
    pub async fn pull(&self) -> Result<StateMap> {
        let (url, commands) = {
            let inner = self.inner.lock();
            match (&inner.identity, &inner.running) {
                (Some(identity), Some(running)) => {
                    (identity.url.clone(), running.commands.clone())
                }
                _ => return Err(BridgeError::NotConnected),
            }
        };

        let result = self.transport.get(&url).await;
        let (reply, outcome) = oneshot::channel();
        commands
            .send(Command::Update {
                result,
                source: Source::Pull,
                reply: Some(reply),
            })
            .map_err(|_| BridgeError::NotConnected)?;
        outcome.await.unwrap_or(Err(BridgeError::NotConnected))
    }

    /// Queue a write of cooked values
    ///
    /// Fails immediately with [`BridgeError::NotConnected`] unless the
    /// session is connected; otherwise the handle resolves once the write
    /// has executed.
    pub fn push(&self, payload: StateMap) -> PushHandle {
        self.push_keyed(payload, None)
    }

    /// Queue a write that may supersede a pending one with the same key
    pub fn push_keyed(&self, payload: StateMap, key: Option<String>) -> PushHandle {
        let commands = {
            let inner = self.inner.lock();
            match (&inner.identity, &inner.running) {
                (Some(_), Some(running)) => running.commands.clone(),
                _ => return PushHandle::failed(BridgeError::NotConnected),
            }
        };

        if let Err(e) = self.options.projection.validate(&payload) {
            return PushHandle::failed(e);
        }

        let (done, handle) = oneshot::channel();
        // A closed mailbox drops `done`, which the handle reports as NotConnected
        let _ = commands.send(Command::Push { payload, key, done });
        PushHandle(handle)
    }

    /// Stop synchronizing and forget the device
    ///
    /// Observers get one `Disconnected` event; repeated calls do nothing.
    pub fn disconnect(&self) {
        let (identity, running, events) = {
            let mut inner = self.inner.lock();
            let Some(identity) = inner.identity.take() else {
                return;
            };
            (identity, inner.running.take(), inner.events.take())
        };

        if let Some(running) = running {
            let _gate = self.gate.lock();
            running.cancel.cancel();
        }
        if let Some(events) = events {
            let _ = events.send(SessionEvent::Disconnected {
                thing_id: identity.thing_id.clone(),
            });
        }
        info!(thing_id = %identity.thing_id, "Disconnected, device forgotten");
    }

    /// Identity metadata; `None` once the device has been forgotten
    pub fn meta(&self) -> Option<DeviceMeta> {
        self.inner.lock().identity.as_ref().map(DeviceIdentity::meta)
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.inner.lock().identity.clone()
    }

    /// Whether the device is still attached, regardless of transient failures
    pub fn reachable(&self) -> bool {
        self.inner.lock().identity.is_some()
    }

    pub fn is_connected(&self) -> bool {
        let inner = self.inner.lock();
        inner.identity.is_some() && inner.running.is_some()
    }

    /// Subscribe to change notifications; `None` once forgotten
    pub fn subscribe(&self) -> Option<broadcast::Receiver<SessionEvent>> {
        self.inner.lock().events.as_ref().map(broadcast::Sender::subscribe)
    }

    /// Cooked view of the last known state
    pub fn state(&self) -> StateMap {
        self.options.projection.cook(self.state.borrow().as_map())
    }

    /// Raw last known state
    pub fn raw_state(&self) -> DeviceState {
        self.state.borrow().clone()
    }

    /// Serve this session on the shared listener when the device has a
    /// config resource, and tell the device where to look
    async fn register_listener(
        &self,
        identity: &DeviceIdentity,
        cancel: &CancellationToken,
    ) -> WriteMode {
        let Some(listener) = &self.options.listener else {
            return WriteMode::Direct;
        };
        if !identity.has_config {
            return WriteMode::Direct;
        }

        let route = cancel.child_token();
        let update_url = match listener
            .register(&identity.thing_id, self.state.subscribe(), route.clone())
            .await
        {
            Ok(url) => url,
            Err(e) => {
                warn!(thing_id = %identity.thing_id, error = %e, "Listener unavailable, writing directly");
                return WriteMode::Direct;
            }
        };

        let request = Request::put_json(&registration_body(&update_url));
        match self.transport.request(&identity.config_url, request).await {
            Ok(_) => {
                debug!(thing_id = %identity.thing_id, config_url = %identity.config_url, update_url = %update_url, "Registered with device");
                WriteMode::Listener
            }
            Err(e) => {
                warn!(thing_id = %identity.thing_id, config_url = %identity.config_url, error = %e, "Registration failed, writing directly");
                route.cancel();
                WriteMode::Direct
            }
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Some(running) = self.inner.get_mut().running.take() {
            running.cancel.cancel();
        }
    }
}

/// Owns the device state while a session is connected
struct SessionActor {
    identity: DeviceIdentity,
    transport: Arc<dyn Transport>,
    projection: Arc<dyn Projection>,
    state: DeviceState,
    published: Arc<watch::Sender<DeviceState>>,
    gate: Arc<Mutex<()>>,
    queue: WriteQueue<StateMap>,
    mode: WriteMode,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
}

type WriteFuture = BoxFuture<'static, Result<()>>;

impl SessionActor {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Command>) {
        let mut in_flight: Option<WriteFuture> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = next_completion(&mut in_flight) => {
                    in_flight = None;
                    self.queue.finish(result);
                }
                command = mailbox.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }

            if in_flight.is_none() && !self.cancel.is_cancelled() {
                if let Some(payload) = self.queue.start_next() {
                    in_flight = Some(self.execute(payload));
                }
            }
        }

        // Late deliveries and unfinished writes are dropped
        self.queue.fail_all(BridgeError::NotConnected);
        debug!(thing_id = %self.identity.thing_id, "Session stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Update {
                result,
                source,
                reply,
            } => {
                let outcome = if self.cancel.is_cancelled() {
                    debug!(thing_id = %self.identity.thing_id, source = ?source, "Dropping update after disconnect");
                    Err(BridgeError::NotConnected)
                } else {
                    self.apply(result, source)
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Command::Push { payload, key, done } => {
                if self.cancel.is_cancelled() {
                    let _ = done.send(Err(BridgeError::NotConnected));
                    return;
                }
                let logged = Value::Object(payload.clone());
                info!(thing_id = %self.identity.thing_id, payload = %logged, "Push");
                self.queue.push(payload, key, done);
            }
        }
    }

    /// Merge a read result into the state
    fn apply(
        &mut self,
        result: std::result::Result<String, TransportError>,
        source: Source,
    ) -> Result<StateMap> {
        let body = result.map_err(|e| {
            warn!(thing_id = %self.identity.thing_id, url = %self.identity.url, source = ?source, error = %e, "Network error");
            BridgeError::from(e)
        })?;

        let update = DeviceState::parse(&body).ok_or_else(|| {
            warn!(thing_id = %self.identity.thing_id, source = ?source, "Ignoring state that is not a JSON object");
            BridgeError::Parse(format!("not a JSON object: {}", body.trim()))
        })?;

        let _gate = self.gate.lock();
        if self.cancel.is_cancelled() {
            return Err(BridgeError::NotConnected);
        }
        if self.state.merge(update.as_map()) {
            debug!(thing_id = %self.identity.thing_id, source = ?source, "State changed");
            let state = self.state.clone();
            // Keep the snapshot current without waking listener subscribers
            self.published.send_if_modified(|published| {
                *published = state;
                false
            });
            self.notify();
        }
        Ok(self.cooked())
    }

    /// Apply a queued write locally and start sending it to the device
    fn execute(&mut self, cooked: StateMap) -> WriteFuture {
        let raw = self.projection.uncook(&cooked);

        {
            let _gate = self.gate.lock();
            if self.cancel.is_cancelled() {
                return Box::pin(async { Err(BridgeError::NotConnected) });
            }
            if self.state.merge(&raw) {
                self.published.send_replace(self.state.clone());
                self.notify();
            }
        }

        match self.mode {
            WriteMode::Listener => Box::pin(async { Ok(()) }),
            WriteMode::Direct => {
                let transport = self.transport.clone();
                let url = self.identity.config_url.clone();
                let request = Request::put_json(&Value::Object(raw));
                Box::pin(async move {
                    transport.request(&url, request).await?;
                    Ok(())
                })
            }
        }
    }

    fn notify(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.events.send(SessionEvent::StateChanged {
            thing_id: self.identity.thing_id.clone(),
            state: self.cooked(),
        });
    }

    fn cooked(&self) -> StateMap {
        self.projection.cook(self.state.as_map())
    }
}

async fn next_completion(in_flight: &mut Option<WriteFuture>) -> Result<()> {
    match in_flight {
        Some(write) => write.await,
        None => std::future::pending().await,
    }
}

/// Keep an observation registered and forward its updates
async fn observe_loop(
    transport: Arc<dyn Transport>,
    identity: DeviceIdentity,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
) {
    loop {
        let registered = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            registered = transport.observe(&identity.url) => registered,
        };

        match registered {
            Ok(mut observation) => {
                debug!(thing_id = %identity.thing_id, url = %identity.url, "Observing");
                loop {
                    let update = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        update = observation.next() => update,
                    };
                    let Some(result) = update else {
                        break;
                    };
                    let command = Command::Update {
                        result,
                        source: Source::Observe,
                        reply: None,
                    };
                    if commands.send(command).is_err() {
                        return;
                    }
                }
                debug!(thing_id = %identity.thing_id, "Observation ended");
            }
            Err(e) => {
                warn!(thing_id = %identity.thing_id, url = %identity.url, error = %e, "Observe registration failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(OBSERVE_RETRY) => {}
        }
    }
}

/// Periodic plain reads, as a fallback to the observation
async fn poll_loop(
    transport: Arc<dyn Transport>,
    identity: DeviceIdentity,
    period: Duration,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = transport.get(&identity.url) => result,
        };
        let command = Command::Update {
            result,
            source: Source::Poll,
            reply: None,
        };
        if commands.send(command).is_err() {
            return;
        }
    }
}
