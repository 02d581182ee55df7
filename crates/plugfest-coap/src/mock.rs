//! Scripted in-memory transport for tests
//!
//! Responses are looked up by exact URL string. Every call is logged so
//! tests can assert on what was (or was not) sent, and observers can be
//! fed updates on demand.

use async_trait::async_trait;
use parking_lot::Mutex;
use plugfest_core::CoapUrl;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::transport::{
    Method, Observation, ObservationFeed, Request, Transport, TransportError, TransportErrorKind,
};

/// A logged call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub url: String,
    pub request: Request,
    pub observe: bool,
}

#[derive(Default)]
struct Script {
    responses: HashMap<String, Result<String, TransportError>>,
    delays: HashMap<String, Duration>,
    observers: HashMap<String, Vec<ObservationFeed>>,
    calls: Vec<Call>,
}

/// In-memory [`Transport`] with scripted responses
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<Script>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer requests to `url` with `body`
    pub fn respond(&self, url: &str, body: &str) {
        self.script
            .lock()
            .responses
            .insert(url.to_string(), Ok(body.to_string()));
    }

    /// Fail requests to `url`
    pub fn fail(&self, url: &str, kind: TransportErrorKind) {
        self.script.lock().responses.insert(
            url.to_string(),
            Err(TransportError::new(kind, format!("scripted failure for {}", url))),
        );
    }

    /// Hold requests to `url` for `delay` before answering
    pub fn delay(&self, url: &str, delay: Duration) {
        self.script.lock().delays.insert(url.to_string(), delay);
    }

    /// Push a representation to every live observer of `url`
    ///
    /// Returns the number of observers that accepted it.
    pub async fn notify(&self, url: &str, body: &str) -> usize {
        let feeds: Vec<ObservationFeed> = {
            let mut script = self.script.lock();
            let feeds = script.observers.entry(url.to_string()).or_default();
            feeds.retain(|feed| !feed.is_cancelled());
            feeds.clone()
        };

        let mut delivered = 0;
        for feed in feeds {
            if feed.send(Ok(body.to_string())).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Live observers of `url`
    pub fn observer_count(&self, url: &str) -> usize {
        self.script
            .lock()
            .observers
            .get(url)
            .map(|feeds| feeds.iter().filter(|f| !f.is_cancelled()).count())
            .unwrap_or(0)
    }

    /// All calls in the order they were made
    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().calls.clone()
    }

    /// Calls made to one URL
    pub fn calls_to(&self, url: &str) -> Vec<Call> {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|c| c.url == url)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.script.lock().calls.len()
    }

    /// Highest number of requests that were outstanding at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, url: &CoapUrl, request: Request) -> Result<String, TransportError> {
        let key = url.to_string();
        let is_get = request.method == Method::Get;
        let (response, delay) = {
            let mut script = self.script.lock();
            script.calls.push(Call {
                url: key.clone(),
                request,
                observe: false,
            });
            (
                script.responses.get(&key).cloned(),
                script.delays.get(&key).copied(),
            )
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match response {
            Some(response) => response,
            // Writes to unscripted resources succeed with an empty body
            None if !is_get => Ok(String::new()),
            None => Err(TransportError::status(format!("4.04 Not Found: {}", key))),
        }
    }

    async fn observe(&self, url: &CoapUrl) -> Result<Observation, TransportError> {
        let key = url.to_string();
        let mut script = self.script.lock();
        script.calls.push(Call {
            url: key.clone(),
            request: Request::get(),
            observe: true,
        });

        if let Some(Err(e)) = script.responses.get(&key) {
            return Err(e.clone());
        }

        let (feed, observation) = Observation::channel();
        script.observers.entry(key).or_default().push(feed);
        Ok(observation)
    }
}
