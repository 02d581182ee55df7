//! Breadth-first crawl of a CoAP resource graph

use plugfest_coap::timeout::DEFAULT_FETCH_TIMEOUT;
use plugfest_coap::{TimeoutTransport, Transport};
use plugfest_core::{CoapUrl, DeviceIdentity, DeviceState, UrlError};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::fetch::{fetch_resource, fetch_state, Expansion};

/// Devices buffered before the crawl waits for the consumer
const DEVICE_BUFFER: usize = 32;

/// Errors that abort discovery before it starts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<UrlError> for DiscoveryError {
    fn from(e: UrlError) -> Self {
        DiscoveryError::Configuration(e.to_string())
    }
}

/// Crawler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Resource fetches allowed in flight at once
    pub max_concurrent_fetches: usize,
    /// Per-fetch timeout in milliseconds
    pub fetch_timeout_ms: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 4,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT.as_millis() as u64,
        }
    }
}

impl CrawlerConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// A device found by the crawl, with its initial state
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub identity: DeviceIdentity,
    pub state: DeviceState,
}

/// Counters for one finished crawl
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    /// Distinct resources downloaded
    pub resources: usize,
    /// Devices reported
    pub devices: usize,
    /// Fetches that failed (each abandons one branch)
    pub failures: usize,
    /// Already-downloaded URLs that were skipped
    pub duplicates: usize,
}

enum Job {
    Resource(CoapUrl),
    State(DeviceIdentity),
}

enum Outcome {
    Expanded(CoapUrl, Expansion),
    Device(DiscoveredDevice),
    Skipped,
    Failed,
}

/// Link-following device crawler
///
/// Each call to [`Crawler::crawl`] keeps its own visited set, so repeated
/// discovery passes re-read everything.
#[derive(Clone)]
pub struct Crawler {
    transport: Arc<dyn Transport>,
    config: CrawlerConfig,
}

impl Crawler {
    /// Create a crawler; every fetch is bounded by the configured timeout
    pub fn new(transport: Arc<dyn Transport>, config: CrawlerConfig) -> Self {
        let transport: Arc<dyn Transport> =
            Arc::new(TimeoutTransport::new(transport, config.fetch_timeout()));
        Self { transport, config }
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    /// Resolve the crawl's starting point from a configured URL
    ///
    /// Only the origin of `root_url` is used; the crawl always begins at
    /// its well-known resource list.
    pub fn start_url(root_url: Option<&str>) -> Result<CoapUrl, DiscoveryError> {
        let root_url = root_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| DiscoveryError::Configuration("'url' is a required parameter".into()))?;
        Ok(CoapUrl::parse(root_url)?.well_known_core())
    }

    /// Start discovery from `root_url`
    ///
    /// Fails synchronously, before any request is made, when the URL is
    /// missing or unusable. Otherwise devices arrive on the returned
    /// channel as they are found; it closes when the crawl is exhausted.
    pub fn discover(
        &self,
        root_url: Option<&str>,
    ) -> Result<mpsc::Receiver<DiscoveredDevice>, DiscoveryError> {
        let start = Self::start_url(root_url)?;
        let (tx, rx) = mpsc::channel(DEVICE_BUFFER);

        let crawler = self.clone();
        tokio::spawn(async move {
            crawler.crawl(start, tx).await;
        });
        Ok(rx)
    }

    /// Crawl from `start` until the frontier is exhausted
    pub async fn crawl(&self, start: CoapUrl, devices: mpsc::Sender<DiscoveredDevice>) -> CrawlSummary {
        info!(url = %start, "Starting discovery");

        let limit = self.config.max_concurrent_fetches.max(1);
        let mut summary = CrawlSummary::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut announced: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<Job> = VecDeque::new();
        let mut tasks: JoinSet<Outcome> = JoinSet::new();

        visited.insert(start.to_string());
        frontier.push_back(Job::Resource(start));

        loop {
            while tasks.len() < limit {
                let Some(job) = frontier.pop_front() else {
                    break;
                };
                tasks.spawn(run_job(self.transport.clone(), job));
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            match joined {
                Ok(Outcome::Expanded(from, expansion)) => {
                    summary.resources += 1;
                    for url in expansion.resources {
                        if visited.insert(url.to_string()) {
                            frontier.push_back(Job::Resource(url));
                        } else {
                            summary.duplicates += 1;
                            debug!(url = %url, from = %from, "Already downloaded, skipping");
                        }
                    }
                    for identity in expansion.devices {
                        if announced.insert(identity.url.to_string()) {
                            frontier.push_back(Job::State(identity));
                        } else {
                            debug!(url = %identity.url, from = %from, "Device already found, skipping");
                        }
                    }
                }
                Ok(Outcome::Device(device)) => {
                    info!(
                        thing_id = %device.identity.thing_id,
                        name = device.identity.display_name(),
                        url = %device.identity.url,
                        "Found device"
                    );
                    summary.devices += 1;
                    if devices.send(device).await.is_err() {
                        debug!("Discovery consumer went away, stopping crawl");
                        tasks.abort_all();
                        break;
                    }
                }
                Ok(Outcome::Skipped) => {}
                Ok(Outcome::Failed) => summary.failures += 1,
                Err(e) => {
                    warn!(error = %e, "Discovery task failed");
                    summary.failures += 1;
                }
            }
        }

        info!(
            resources = summary.resources,
            devices = summary.devices,
            failures = summary.failures,
            duplicates = summary.duplicates,
            "Discovery pass complete"
        );
        summary
    }
}

async fn run_job(transport: Arc<dyn Transport>, job: Job) -> Outcome {
    match job {
        Job::Resource(url) => match fetch_resource(transport.as_ref(), &url).await {
            Ok(expansion) => Outcome::Expanded(url, expansion),
            Err(e) => {
                warn!(url = %url, error = %e, "Error downloading resource");
                Outcome::Failed
            }
        },
        Job::State(identity) => match fetch_state(transport.as_ref(), &identity).await {
            Ok(Some(state)) => Outcome::Device(DiscoveredDevice { identity, state }),
            Ok(None) => {
                warn!(url = %identity.url, "Device state is not a JSON object, skipping device");
                Outcome::Skipped
            }
            Err(e) => {
                warn!(url = %identity.url, error = %e, "Error reading device state");
                Outcome::Failed
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugfest_coap::mock::MockTransport;
    use plugfest_coap::TransportErrorKind;

    const LAMP_DOC: &str = r#"{"_embedded":{"item":[{
        "name":"Lamp","id":"lamp-1",
        "_links":{"about":{"type":"application/lighting+json","href":"/lamp/state"}}
    }]}}"#;

    fn crawler(mock: &Arc<MockTransport>, max_concurrent_fetches: usize) -> Crawler {
        let transport: Arc<dyn Transport> = mock.clone();
        Crawler::new(
            transport,
            CrawlerConfig {
                max_concurrent_fetches,
                ..Default::default()
            },
        )
    }

    async fn collect(crawler: &Crawler, root: &str) -> (CrawlSummary, Vec<DiscoveredDevice>) {
        let (tx, mut rx) = mpsc::channel(64);
        let start = Crawler::start_url(Some(root)).unwrap();
        let summary = crawler.crawl(start, tx).await;
        let mut devices = Vec::new();
        while let Some(device) = rx.recv().await {
            devices.push(device);
        }
        (summary, devices)
    }

    #[tokio::test]
    async fn test_missing_url_is_configuration_error() {
        let mock = Arc::new(MockTransport::new());
        let crawler = crawler(&mock, 4);

        assert!(matches!(
            crawler.discover(None),
            Err(DiscoveryError::Configuration(_))
        ));
        assert!(matches!(
            crawler.discover(Some("  ")),
            Err(DiscoveryError::Configuration(_))
        ));
        assert!(matches!(
            crawler.discover(Some("http://h/")),
            Err(DiscoveryError::Configuration(_))
        ));
        assert_eq!(mock.call_count(), 0);
    }

    #[test]
    fn test_start_url_uses_well_known_core() {
        let start = Crawler::start_url(Some("coap://10.0.0.5:5683/some/path")).unwrap();
        assert_eq!(start.to_string(), "coap://10.0.0.5:5683/.well-known/core");
    }

    #[test]
    fn test_start_url_with_non_ascii_is_configuration_error() {
        assert!(matches!(
            Crawler::start_url(Some("coap:/\u{e9}h")),
            Err(DiscoveryError::Configuration(_))
        ));
        assert!(matches!(
            Crawler::start_url(Some("\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}")),
            Err(DiscoveryError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_crawl_finds_device_with_state() {
        let mock = Arc::new(MockTransport::new());
        mock.respond("coap://h/.well-known/core", "</ostate>;ct=65201");
        mock.respond("coap://h/ostate", LAMP_DOC);
        mock.respond("coap://h/lamp/state", r#"{"on":true}"#);

        let (summary, devices) = collect(&crawler(&mock, 4), "coap://h").await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].identity.thing_id.as_str(), "urn:iotdb:thing:Plugfest:lamp-1");
        assert_eq!(devices[0].state.get("on"), Some(&serde_json::json!(true)));
        assert_eq!(summary.resources, 2);
        assert_eq!(summary.devices, 1);
    }

    #[tokio::test]
    async fn test_cycles_visit_each_url_once() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            "coap://h/.well-known/core",
            "</a>;ct=65201, </b>;ct=65201",
        );
        mock.respond("coap://h/a", "</b>;ct=65201, </.well-known/core>;ct=65201");
        mock.respond("coap://h/b", "</a>;ct=65201, </b>;ct=65201");

        let (summary, devices) = collect(&crawler(&mock, 2), "coap://h/").await;
        assert!(devices.is_empty());
        for url in ["coap://h/.well-known/core", "coap://h/a", "coap://h/b"] {
            assert_eq!(mock.calls_to(url).len(), 1, "{} fetched more than once", url);
        }
        assert_eq!(summary.resources, 3);
        assert!(summary.duplicates > 0);
    }

    #[tokio::test]
    async fn test_wrong_about_type_yields_no_devices() {
        let mock = Arc::new(MockTransport::new());
        mock.respond("coap://h/.well-known/core", "</ostate>;ct=65201");
        mock.respond(
            "coap://h/ostate",
            r#"{"_embedded":{"item":[{"_links":{"about":{"type":"text/plain","href":"/lamp/state"}}}]}}"#,
        );
        mock.respond("coap://h/lamp/state", r#"{"on":true}"#);

        let (_, devices) = collect(&crawler(&mock, 4), "coap://h").await;
        assert!(devices.is_empty());
        assert!(mock.calls_to("coap://h/lamp/state").is_empty());
    }

    #[tokio::test]
    async fn test_failed_branch_does_not_stop_siblings() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            "coap://h/.well-known/core",
            "</broken>;ct=65201, </ostate>;ct=65201",
        );
        mock.fail("coap://h/broken", TransportErrorKind::Io);
        mock.respond("coap://h/ostate", LAMP_DOC);
        mock.respond("coap://h/lamp/state", r#"{"on":false}"#);

        let (summary, devices) = collect(&crawler(&mock, 4), "coap://h").await;
        assert_eq!(devices.len(), 1);
        assert_eq!(summary.failures, 1);
    }

    #[tokio::test]
    async fn test_device_without_state_is_not_reported() {
        let mock = Arc::new(MockTransport::new());
        mock.respond("coap://h/.well-known/core", "</ostate>;ct=65201");
        mock.respond("coap://h/ostate", LAMP_DOC);
        mock.fail("coap://h/lamp/state", TransportErrorKind::Timeout);

        let (summary, devices) = collect(&crawler(&mock, 4), "coap://h").await;
        assert!(devices.is_empty());
        assert_eq!(summary.failures, 1);
    }

    #[tokio::test]
    async fn test_device_found_twice_is_reported_once() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            "coap://h/.well-known/core",
            "</one>;ct=65201, </two>;ct=65201",
        );
        mock.respond("coap://h/one", LAMP_DOC);
        mock.respond("coap://h/two", LAMP_DOC);
        mock.respond("coap://h/lamp/state", "{}");

        let (_, devices) = collect(&crawler(&mock, 4), "coap://h").await;
        assert_eq!(devices.len(), 1);
        assert_eq!(mock.calls_to("coap://h/lamp/state").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let mock = Arc::new(MockTransport::new());
        let links: Vec<String> = (0..6).map(|i| format!("</r{}>;ct=65201", i)).collect();
        mock.respond("coap://h/.well-known/core", &links.join(","));
        for i in 0..6 {
            let url = format!("coap://h/r{}", i);
            mock.respond(&url, "</>;ct=0");
            mock.delay(&url, Duration::from_millis(50));
        }

        let (summary, _) = collect(&crawler(&mock, 2), "coap://h").await;
        assert_eq!(summary.resources, 7);
        assert_eq!(mock.max_in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_resource_times_out() {
        let mock = Arc::new(MockTransport::new());
        mock.respond("coap://h/.well-known/core", "</slow>;ct=65201, </ostate>;ct=65201");
        mock.respond("coap://h/slow", "</x>;ct=65201");
        mock.delay("coap://h/slow", Duration::from_secs(3600));
        mock.respond("coap://h/ostate", LAMP_DOC);
        mock.respond("coap://h/lamp/state", "{}");

        let (summary, devices) = collect(&crawler(&mock, 4), "coap://h").await;
        assert_eq!(devices.len(), 1);
        assert_eq!(summary.failures, 1);
    }
}
