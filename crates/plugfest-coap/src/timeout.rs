//! Per-fetch timeout for any transport
//!
//! Constrained devices go silent rather than refusing connections, so
//! every request is bounded to keep one unreachable resource from
//! stalling a crawl or a sync cycle.

use async_trait::async_trait;
use plugfest_core::CoapUrl;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::transport::{Observation, Request, Transport, TransportError};

/// Default per-fetch timeout
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Wraps a transport so that every request, and every observe
/// registration, fails with a timeout error after a fixed duration
pub struct TimeoutTransport<T> {
    inner: T,
    timeout: Duration,
}

impl<T> TimeoutTransport<T> {
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for TimeoutTransport<T> {
    async fn request(&self, url: &CoapUrl, request: Request) -> Result<String, TransportError> {
        match timeout(self.timeout, self.inner.request(url, request)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(url = %url, timeout_ms = self.timeout.as_millis() as u64, "Request timed out");
                Err(TransportError::timeout(format!(
                    "no response from {} within {:?}",
                    url, self.timeout
                )))
            }
        }
    }

    async fn observe(&self, url: &CoapUrl) -> Result<Observation, TransportError> {
        match timeout(self.timeout, self.inner.observe(url)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(format!(
                "observe registration on {} not acknowledged within {:?}",
                url, self.timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::transport::TransportErrorKind;

    #[tokio::test(start_paused = true)]
    async fn test_slow_request_times_out() {
        let mock = MockTransport::new();
        mock.respond("coap://h/slow", "{}");
        mock.delay("coap://h/slow", Duration::from_secs(60));
        mock.respond("coap://h/fast", "{}");

        let transport = TimeoutTransport::new(mock, Duration::from_secs(1));

        let error = transport
            .get(&CoapUrl::parse("coap://h/slow").unwrap())
            .await
            .unwrap_err();
        assert_eq!(error.kind, TransportErrorKind::Timeout);

        let body = transport
            .get(&CoapUrl::parse("coap://h/fast").unwrap())
            .await
            .unwrap();
        assert_eq!(body, "{}");
    }
}
