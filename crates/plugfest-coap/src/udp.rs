//! CoAP over UDP client transport
//!
//! Each request binds its own ephemeral socket, sends a confirmable
//! message and waits for the matching response, retransmitting on the
//! CoAP ACK timeout. Separate (non-piggybacked) responses are
//! acknowledged. Observations keep their socket open and forward every
//! notification carrying the registration token.

use async_trait::async_trait;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use plugfest_core::CoapUrl;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use crate::transport::{
    Method, Observation, ObservationFeed, Request, Transport, TransportError, TransportErrorKind,
};

/// CoAP ACK_TIMEOUT (RFC 7252 section 4.8)
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// CoAP MAX_RETRANSMIT
pub const MAX_RETRANSMIT: u32 = 4;

/// Largest datagram we expect to receive
const MAX_DATAGRAM: usize = 1500;

/// Token length used for requests
const TOKEN_LEN: usize = 4;

/// Observe option value registering interest
const OBSERVE_REGISTER: u32 = 0;

/// Observe option value cancelling interest
const OBSERVE_DEREGISTER: u32 = 1;

/// CoAP over UDP [`Transport`]
pub struct UdpTransport {
    next_message_id: AtomicU16,
    ack_timeout: Duration,
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            next_message_id: AtomicU16::new(rand::thread_rng().gen()),
            ack_timeout: ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    fn message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve the URL's host and open a socket of the matching family
    async fn connect(url: &CoapUrl) -> Result<(UdpSocket, SocketAddr), TransportError> {
        if url.is_secure() {
            return Err(TransportError::new(
                TransportErrorKind::InvalidUrl,
                format!("DTLS is not supported: {}", url),
            ));
        }

        let target = tokio::net::lookup_host((url.host(), url.port()))
            .await?
            .next()
            .ok_or_else(|| TransportError::io(format!("cannot resolve {}", url.host())))?;

        let bind: SocketAddr = if target.is_ipv4() {
            "0.0.0.0:0".parse().map_err(|_| TransportError::io("bad bind address"))?
        } else {
            "[::]:0".parse().map_err(|_| TransportError::io("bad bind address"))?
        };
        let socket = UdpSocket::bind(bind).await?;
        Ok((socket, target))
    }

    /// Send a confirmable request and wait for its response packet
    async fn exchange(
        &self,
        socket: &UdpSocket,
        target: SocketAddr,
        packet: &Packet,
    ) -> Result<Packet, TransportError> {
        let bytes = packet
            .to_bytes()
            .map_err(|e| TransportError::codec(format!("{:?}", e)))?;
        let message_id = packet.header.message_id;
        let token = packet.get_token().to_vec();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut acknowledged = false;
        let mut wait = self.ack_timeout;

        for attempt in 0..=MAX_RETRANSMIT {
            if !acknowledged {
                trace!(target = %target, message_id, attempt, "Sending CoAP request");
                socket.send_to(&bytes, target).await?;
            }

            let deadline = Instant::now() + wait;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let (len, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
                    Ok(received) => received?,
                    Err(_) => break,
                };
                if from != target {
                    continue;
                }

                let response = match Packet::from_bytes(&buf[..len]) {
                    Ok(response) => response,
                    Err(e) => {
                        debug!(target = %target, error = ?e, "Dropping undecodable datagram");
                        continue;
                    }
                };

                match response.header.get_type() {
                    MessageType::Reset if response.header.message_id == message_id => {
                        return Err(TransportError::status("request reset by peer"));
                    }
                    MessageType::Acknowledgement
                        if response.header.message_id == message_id
                            && response.header.code == MessageClass::Empty =>
                    {
                        // Empty ACK: a separate response follows
                        acknowledged = true;
                        continue;
                    }
                    _ => {}
                }

                if response.get_token() != token.as_slice() {
                    continue;
                }

                if response.header.get_type() == MessageType::Confirmable {
                    send_empty_ack(socket, from, response.header.message_id).await;
                }
                return Ok(response);
            }

            if !acknowledged {
                wait *= 2;
            }
        }

        Err(TransportError::timeout(format!(
            "no response from {} after {} attempts",
            target,
            MAX_RETRANSMIT + 1
        )))
    }

    fn build_request(&self, url: &CoapUrl, request: &Request, observe: Option<u32>) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(request_type(request.method));
        packet.header.message_id = self.message_id();
        packet.set_token(random_token());

        if let Some(value) = observe {
            packet.add_option(CoapOption::Observe, encode_uint(value));
        }
        for segment in url.segments() {
            packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
        if let Some(code) = request.content_format {
            packet.add_option(CoapOption::ContentFormat, encode_uint(u32::from(code)));
        }
        if let Some(query) = url.query() {
            for part in query.split('&').filter(|p| !p.is_empty()) {
                packet.add_option(CoapOption::UriQuery, part.as_bytes().to_vec());
            }
        }
        if let Some(payload) = &request.payload {
            packet.payload = payload.clone();
        }
        packet
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn request(&self, url: &CoapUrl, request: Request) -> Result<String, TransportError> {
        let (socket, target) = Self::connect(url).await?;
        let packet = self.build_request(url, &request, None);

        debug!(url = %url, method = %request.method, "CoAP request");
        let response = self.exchange(&socket, target, &packet).await?;
        response_body(url, &response)
    }

    async fn observe(&self, url: &CoapUrl) -> Result<Observation, TransportError> {
        let (socket, target) = Self::connect(url).await?;
        let packet = self.build_request(url, &Request::get(), Some(OBSERVE_REGISTER));
        let token = packet.get_token().to_vec();

        debug!(url = %url, "CoAP observe registration");
        let first = self.exchange(&socket, target, &packet).await?;
        let body = response_body(url, &first)?;

        let (feed, observation) = Observation::channel();
        if !feed.send(Ok(body)).await {
            return Ok(observation);
        }

        let deregister = self.build_request(url, &Request::get(), Some(OBSERVE_DEREGISTER));
        tokio::spawn(run_observation(
            Arc::new(socket),
            target,
            url.clone(),
            token,
            deregister,
            feed,
        ));
        Ok(observation)
    }
}

/// Forward notifications until the observer goes away
async fn run_observation(
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    url: CoapUrl,
    token: Vec<u8>,
    mut deregister: Packet,
    feed: ObservationFeed,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = feed.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        let _ = feed.send(Err(e.into())).await;
                        return;
                    }
                };
                if from != target {
                    continue;
                }
                let Ok(packet) = Packet::from_bytes(&buf[..len]) else {
                    continue;
                };
                if packet.get_token() != token.as_slice() {
                    // Unknown exchange: reject so the server stops notifying
                    if packet.header.get_type() == MessageType::Confirmable {
                        send_reset(&socket, from, packet.header.message_id).await;
                    }
                    continue;
                }
                if packet.header.get_type() == MessageType::Confirmable {
                    send_empty_ack(&socket, from, packet.header.message_id).await;
                }

                let update = response_body(&url, &packet);
                if !feed.send(update).await {
                    break;
                }
            }
        }
    }

    // Reuse the registration token so the server can match the deregistration
    deregister.set_token(token);
    deregister.header.set_type(MessageType::NonConfirmable);
    if let Ok(bytes) = deregister.to_bytes() {
        if let Err(e) = socket.send_to(&bytes, target).await {
            debug!(url = %url, error = %e, "Failed to send observe deregistration");
        }
    }
    debug!(url = %url, "Observation ended");
}

fn response_body(url: &CoapUrl, packet: &Packet) -> Result<String, TransportError> {
    match packet.header.code {
        MessageClass::Response(status) if is_success(status) => {
            Ok(String::from_utf8_lossy(&packet.payload).into_owned())
        }
        MessageClass::Response(status) => {
            warn!(url = %url, status = ?status, "CoAP error response");
            Err(TransportError::status(format!("{:?} from {}", status, url)))
        }
        other => Err(TransportError::codec(format!(
            "unexpected message class {:?} from {}",
            other, url
        ))),
    }
}

fn is_success(status: ResponseType) -> bool {
    matches!(
        status,
        ResponseType::Created
            | ResponseType::Deleted
            | ResponseType::Valid
            | ResponseType::Changed
            | ResponseType::Content
    )
}

fn request_type(method: Method) -> RequestType {
    match method {
        Method::Get => RequestType::Get,
        Method::Post => RequestType::Post,
        Method::Put => RequestType::Put,
        Method::Delete => RequestType::Delete,
    }
}

fn random_token() -> Vec<u8> {
    let mut token = vec![0u8; TOKEN_LEN];
    rand::thread_rng().fill(&mut token[..]);
    token
}

/// Minimal big-endian encoding of an unsigned option value
pub(crate) fn encode_uint(value: u32) -> Vec<u8> {
    value
        .to_be_bytes()
        .iter()
        .skip_while(|b| **b == 0)
        .copied()
        .collect()
}

pub(crate) fn decode_uint(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

async fn send_empty_ack(socket: &UdpSocket, to: SocketAddr, message_id: u16) {
    send_empty(socket, to, message_id, MessageType::Acknowledgement).await;
}

async fn send_reset(socket: &UdpSocket, to: SocketAddr, message_id: u16) {
    send_empty(socket, to, message_id, MessageType::Reset).await;
}

async fn send_empty(socket: &UdpSocket, to: SocketAddr, message_id: u16, kind: MessageType) {
    let mut packet = Packet::new();
    packet.header.set_type(kind);
    packet.header.code = MessageClass::Empty;
    packet.header.message_id = message_id;
    if let Ok(bytes) = packet.to_bytes() {
        if let Err(e) = socket.send_to(&bytes, to).await {
            debug!(to = %to, error = %e, "Failed to send empty message");
        }
    }
}
