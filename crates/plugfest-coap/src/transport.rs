//! Transport abstraction consumed by discovery and device sessions

use async_trait::async_trait;
use plugfest_core::CoapUrl;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Content-format code for `application/json`
pub const JSON_CONTENT_FORMAT: u16 = 50;

/// Buffered updates per observation before the producer waits
const OBSERVATION_BUFFER: usize = 16;

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// A one-shot request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub payload: Option<Vec<u8>>,
    pub content_format: Option<u16>,
}

impl Request {
    pub fn get() -> Self {
        Self {
            method: Method::Get,
            payload: None,
            content_format: None,
        }
    }

    pub fn put(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            method: Method::Put,
            payload: Some(payload.into()),
            content_format: None,
        }
    }

    /// A `PUT` with a JSON body
    pub fn put_json(value: &serde_json::Value) -> Self {
        Self::put(value.to_string()).with_content_format(JSON_CONTENT_FORMAT)
    }

    pub fn with_content_format(mut self, code: u16) -> Self {
        self.content_format = Some(code);
        self
    }

    /// Payload as text, if any
    pub fn body(&self) -> Option<String> {
        self.payload
            .as_ref()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }
}

/// Broad category of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// No response within the allotted time
    Timeout,
    /// Socket or name resolution failure
    Io,
    /// Message could not be encoded or decoded
    Codec,
    /// Remote answered with a non-success response code
    Status,
    /// Channel or stream ended
    Closed,
    /// URL cannot be used by this transport
    InvalidUrl,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Io => "io",
            TransportErrorKind::Codec => "codec",
            TransportErrorKind::Status => "status",
            TransportErrorKind::Closed => "closed",
            TransportErrorKind::InvalidUrl => "invalid url",
        };
        f.write_str(name)
    }
}

/// A transport failure, surfaced as `(kind, message)`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Io, message)
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Codec, message)
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Status, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Closed, message)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

/// A continuing stream of representations from an observed resource
///
/// Dropping the observation cancels it.
#[derive(Debug)]
pub struct Observation {
    updates: mpsc::Receiver<Result<String, TransportError>>,
    cancel: CancellationToken,
}

/// Producer side of an [`Observation`]
#[derive(Debug, Clone)]
pub struct ObservationFeed {
    updates: mpsc::Sender<Result<String, TransportError>>,
    cancel: CancellationToken,
}

impl Observation {
    /// Create a connected feed/observation pair
    pub fn channel() -> (ObservationFeed, Observation) {
        let (tx, rx) = mpsc::channel(OBSERVATION_BUFFER);
        let cancel = CancellationToken::new();
        (
            ObservationFeed {
                updates: tx,
                cancel: cancel.clone(),
            },
            Observation {
                updates: rx,
                cancel,
            },
        )
    }

    /// Next representation; `None` once the stream has ended
    pub async fn next(&mut self) -> Option<Result<String, TransportError>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.updates.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ObservationFeed {
    /// Deliver an update; returns false once the observer has gone
    pub async fn send(&self, update: Result<String, TransportError>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.updates.send(update).await.is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.updates.is_closed()
    }

    /// Resolves when the observer cancels or drops the observation
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.updates.closed() => {}
        }
    }
}

/// Minimal request interface to CoAP resources
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a one-shot request and return the response body
    async fn request(&self, url: &CoapUrl, request: Request) -> Result<String, TransportError>;

    /// Register an observe relationship on a resource
    async fn observe(&self, url: &CoapUrl) -> Result<Observation, TransportError>;

    /// Plain read of a resource
    async fn get(&self, url: &CoapUrl) -> Result<String, TransportError> {
        self.request(url, Request::get()).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn request(&self, url: &CoapUrl, request: Request) -> Result<String, TransportError> {
        (**self).request(url, request).await
    }

    async fn observe(&self, url: &CoapUrl) -> Result<Observation, TransportError> {
        (**self).observe(url).await
    }
}
