//! Inbound request listener
//!
//! Used by the bridge's inbound-notification mode: devices are told to
//! fetch (and observe) a route on the bridge, and each request they make
//! arrives here as an [`InboundRequest`]. The handler answers with one or
//! more bodies; for observe requests every body after the first goes out
//! as a notification.

use async_trait::async_trait;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::transport::{Method, TransportError, JSON_CONTENT_FORMAT};
use crate::udp::{decode_uint, encode_uint};

/// Pending inbound requests before the accept loop waits
const ACCEPT_BUFFER: usize = 32;

/// Responses queued per request
const RESPONSE_BUFFER: usize = 8;

/// Recently seen message ids, for dropping retransmissions
const DEDUP_WINDOW: usize = 64;

/// Observe sequence numbers are 24 bits
const OBSERVE_SEQUENCE_MASK: u32 = 0x00ff_ffff;

/// A request received by the listener
///
/// Dropping it without responding answers `4.04 Not Found`.
#[derive(Debug)]
pub struct InboundRequest {
    /// Request path, always starting with `/`
    pub path: String,
    pub method: Method,
    /// Whether the client asked to observe
    pub observe: bool,
    pub payload: Vec<u8>,
    responses: mpsc::Sender<String>,
}

impl InboundRequest {
    /// A request plus the receiving end of its responses
    pub fn new(
        path: impl Into<String>,
        method: Method,
        observe: bool,
        payload: Vec<u8>,
    ) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        (
            Self {
                path: path.into(),
                method,
                observe,
                payload,
                responses: tx,
            },
            rx,
        )
    }

    /// Send a response body
    ///
    /// Fails with a `Closed` error once the exchange is over: the client
    /// deregistered, reset the stream, or the request was not an observe.
    pub async fn respond(&self, body: impl Into<String>) -> Result<(), TransportError> {
        self.responses
            .send(body.into())
            .await
            .map_err(|_| TransportError::closed(format!("exchange for {} ended", self.path)))
    }

    pub fn is_closed(&self) -> bool {
        self.responses.is_closed()
    }

    /// Resolves once no further responses will be delivered
    pub async fn closed(&self) {
        self.responses.closed().await
    }
}

/// Something that can accept inbound requests on a port
#[async_trait]
pub trait ListenerBinder: Send + Sync {
    async fn bind(&self, port: u16) -> Result<mpsc::Receiver<InboundRequest>, TransportError>;
}

/// CoAP over UDP [`ListenerBinder`]
#[derive(Debug, Default, Clone)]
pub struct UdpBinder;

impl UdpBinder {
    pub fn new() -> Self {
        Self
    }

    /// Bind `addr` and start serving; returns the bound address
    pub async fn serve(
        &self,
        addr: SocketAddr,
    ) -> Result<(SocketAddr, mpsc::Receiver<InboundRequest>), TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        let (tx, rx) = mpsc::channel(ACCEPT_BUFFER);

        info!(addr = %local, "CoAP listener bound");
        tokio::spawn(Server::new(socket).run(tx));
        Ok((local, rx))
    }
}

#[async_trait]
impl ListenerBinder for UdpBinder {
    async fn bind(&self, port: u16) -> Result<mpsc::Receiver<InboundRequest>, TransportError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let (_, rx) = self.serve(addr).await?;
        Ok(rx)
    }
}

type StreamKey = (SocketAddr, Vec<u8>);

#[derive(Default)]
struct Streams {
    /// Live exchanges by client and token
    active: HashMap<StreamKey, CancellationToken>,
    /// Last notification message id sent on each stream
    sent: HashMap<(SocketAddr, u16), StreamKey>,
    recent: VecDeque<(SocketAddr, u16)>,
}

struct Server {
    socket: Arc<UdpSocket>,
    streams: Arc<Mutex<Streams>>,
    next_message_id: Arc<AtomicU16>,
}

impl Server {
    fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            streams: Arc::new(Mutex::new(Streams::default())),
            next_message_id: Arc::new(AtomicU16::new(rand::random())),
        }
    }

    async fn run(self, accept: mpsc::Sender<InboundRequest>) {
        let mut buf = vec![0u8; 1500];
        loop {
            let (len, from) = tokio::select! {
                _ = accept.closed() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "CoAP listener receive failed");
                        continue;
                    }
                },
            };

            let packet = match Packet::from_bytes(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(from = %from, error = ?e, "Dropping undecodable datagram");
                    continue;
                }
            };

            match packet.header.code {
                MessageClass::Request(kind) => {
                    if let Some(request) = self.accept(from, kind, &packet) {
                        if accept.send(request).await.is_err() {
                            break;
                        }
                    }
                }
                MessageClass::Empty if packet.header.get_type() == MessageType::Reset => {
                    self.reset(from, packet.header.message_id);
                }
                _ => trace!(from = %from, "Ignoring non-request message"),
            }
        }
        debug!("CoAP listener stopped");
    }

    /// Turn a request packet into an [`InboundRequest`] and start its responder
    fn accept(
        &self,
        from: SocketAddr,
        kind: RequestType,
        packet: &Packet,
    ) -> Option<InboundRequest> {
        let message_id = packet.header.message_id;
        let confirmable = packet.header.get_type() == MessageType::Confirmable;
        let token = packet.get_token().to_vec();
        let key = (from, token.clone());

        {
            let mut streams = self.streams.lock();
            if streams.recent.contains(&(from, message_id)) {
                trace!(from = %from, message_id, "Dropping retransmitted request");
                return None;
            }
            streams.recent.push_back((from, message_id));
            if streams.recent.len() > DEDUP_WINDOW {
                streams.recent.pop_front();
            }
        }

        let observe = packet
            .get_option(CoapOption::Observe)
            .and_then(|values| values.front())
            .map(|value| decode_uint(value));

        if observe == Some(1) {
            // Deregistration: end the stream and acknowledge
            if let Some(cancel) = self.streams.lock().active.remove(&key) {
                cancel.cancel();
            }
            debug!(from = %from, "Observer deregistered");
            let reply = response_packet(
                if confirmable { MessageType::Acknowledgement } else { MessageType::NonConfirmable },
                message_id,
                &token,
                ResponseType::Content,
                None,
                Vec::new(),
            );
            send(&self.socket, from, reply);
            return None;
        }

        let Some(method) = method_of(kind) else {
            debug!(from = %from, kind = ?kind, "Unsupported request method");
            return None;
        };

        let path = packet
            .get_option(CoapOption::UriPath)
            .map(|segments| {
                segments
                    .iter()
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default();
        let path = format!("/{}", path);
        let observing = observe == Some(0);

        let (request, responses) =
            InboundRequest::new(path.clone(), method, observing, packet.payload.clone());

        let cancel = CancellationToken::new();
        if observing {
            if let Some(previous) = self
                .streams
                .lock()
                .active
                .insert(key.clone(), cancel.clone())
            {
                previous.cancel();
            }
        }

        debug!(from = %from, path = %path, method = %method, observe = observing, "Inbound request");
        let responder = Responder {
            socket: self.socket.clone(),
            streams: self.streams.clone(),
            next_message_id: self.next_message_id.clone(),
            to: from,
            key,
            message_id,
            confirmable,
            observing,
        };
        tokio::spawn(responder.run(responses, cancel));
        Some(request)
    }

    fn reset(&self, from: SocketAddr, message_id: u16) {
        let mut streams = self.streams.lock();
        if let Some(key) = streams.sent.remove(&(from, message_id)) {
            if let Some(cancel) = streams.active.remove(&key) {
                debug!(from = %from, "Observer reset stream");
                cancel.cancel();
            }
        }
    }
}

/// Writes the responses for one exchange back to the client
struct Responder {
    socket: Arc<UdpSocket>,
    streams: Arc<Mutex<Streams>>,
    next_message_id: Arc<AtomicU16>,
    to: SocketAddr,
    key: StreamKey,
    message_id: u16,
    confirmable: bool,
    observing: bool,
}

impl Responder {
    async fn run(self, mut responses: mpsc::Receiver<String>, cancel: CancellationToken) {
        let mut sequence: u32 = 1;
        let mut first = true;
        let mut last_sent: Option<u16> = None;

        loop {
            let body = tokio::select! {
                _ = cancel.cancelled() => break,
                body = responses.recv() => body,
            };

            let Some(body) = body else {
                if first {
                    // Handler dropped the request without answering
                    let reply = response_packet(
                        self.first_type(),
                        self.message_id,
                        &self.key.1,
                        ResponseType::NotFound,
                        None,
                        Vec::new(),
                    );
                    send(&self.socket, self.to, reply);
                }
                break;
            };

            let observe = self.observing.then_some(sequence);
            let packet = if first {
                response_packet(
                    self.first_type(),
                    self.message_id,
                    &self.key.1,
                    ResponseType::Content,
                    observe,
                    body.into_bytes(),
                )
            } else {
                let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
                let mut streams = self.streams.lock();
                if let Some(previous) = last_sent.replace(message_id) {
                    streams.sent.remove(&(self.to, previous));
                }
                streams.sent.insert((self.to, message_id), self.key.clone());
                drop(streams);

                response_packet(
                    MessageType::NonConfirmable,
                    message_id,
                    &self.key.1,
                    ResponseType::Content,
                    observe,
                    body.into_bytes(),
                )
            };
            send(&self.socket, self.to, packet);

            first = false;
            sequence = (sequence + 1) & OBSERVE_SEQUENCE_MASK;
            if !self.observing {
                break;
            }
        }

        let mut streams = self.streams.lock();
        if let Some(last) = last_sent {
            streams.sent.remove(&(self.to, last));
        }
        if let Some(active) = streams.active.get(&self.key) {
            if active.is_cancelled() || !self.observing || cancel.is_cancelled() {
                streams.active.remove(&self.key);
            }
        }
        trace!(to = %self.to, "Exchange finished");
    }

    fn first_type(&self) -> MessageType {
        if self.confirmable {
            MessageType::Acknowledgement
        } else {
            MessageType::NonConfirmable
        }
    }
}

fn method_of(kind: RequestType) -> Option<Method> {
    match kind {
        RequestType::Get => Some(Method::Get),
        RequestType::Post => Some(Method::Post),
        RequestType::Put => Some(Method::Put),
        RequestType::Delete => Some(Method::Delete),
        _ => None,
    }
}

fn response_packet(
    kind: MessageType,
    message_id: u16,
    token: &[u8],
    status: ResponseType,
    observe: Option<u32>,
    payload: Vec<u8>,
) -> Packet {
    let mut packet = Packet::new();
    packet.header.set_type(kind);
    packet.header.code = MessageClass::Response(status);
    packet.header.message_id = message_id;
    packet.set_token(token.to_vec());
    if let Some(sequence) = observe {
        packet.add_option(CoapOption::Observe, encode_uint(sequence));
    }
    if !payload.is_empty() {
        packet.add_option(
            CoapOption::ContentFormat,
            encode_uint(u32::from(JSON_CONTENT_FORMAT)),
        );
    }
    packet.payload = payload;
    packet
}

/// Fire-and-forget datagram send
fn send(socket: &Arc<UdpSocket>, to: SocketAddr, packet: Packet) {
    let bytes = match packet.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(to = %to, error = ?e, "Failed to encode response");
            return;
        }
    };
    if let Err(e) = socket.try_send_to(&bytes, to) {
        let socket = socket.clone();
        if e.kind() == std::io::ErrorKind::WouldBlock {
            tokio::spawn(async move {
                if let Err(e) = socket.send_to(&bytes, to).await {
                    debug!(to = %to, error = %e, "Failed to send response");
                }
            });
        } else {
            debug!(to = %to, error = %e, "Failed to send response");
        }
    }
}
