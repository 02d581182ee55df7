//! CoAP URL parsing and resolution
//!
//! Discovery walks a graph of `coap://` resources whose links may be
//! absolute, origin-relative (`/path`) or document-relative (`path`).
//! [`CoapUrl`] keeps the three parts the crawler needs apart: the origin
//! (scheme, host, port), the path and an optional query.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default CoAP UDP port
pub const DEFAULT_COAP_PORT: u16 = 5683;

/// Default CoAP over DTLS port
pub const DEFAULT_COAPS_PORT: u16 = 5684;

/// Well-known resource list path (RFC 6690)
pub const WELL_KNOWN_CORE: &str = "/.well-known/core";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    #[error("Unsupported URL scheme in {0}")]
    UnsupportedScheme(String),
    #[error("Missing host in {0}")]
    MissingHost(String),
    #[error("Invalid port in {0}")]
    InvalidPort(String),
}

/// An absolute `coap://` or `coaps://` URL
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CoapUrl {
    secure: bool,
    host: String,
    port: Option<u16>,
    path: String,
    query: Option<String>,
}

impl CoapUrl {
    /// Parse an absolute CoAP URL
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let input = input.trim();
        let (secure, rest) = if let Some(rest) = strip_scheme(input, "coap://") {
            (false, rest)
        } else if let Some(rest) = strip_scheme(input, "coaps://") {
            (true, rest)
        } else {
            return Err(UrlError::UnsupportedScheme(input.to_string()));
        };

        let (authority, path_and_query) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => match rest.find('?') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, ""),
            },
        };

        let (host, port) = split_authority(authority)
            .ok_or_else(|| UrlError::InvalidPort(input.to_string()))?;
        if host.is_empty() {
            return Err(UrlError::MissingHost(input.to_string()));
        }

        let (path, query) = split_path(path_and_query);

        Ok(Self {
            secure,
            host: host.to_string(),
            port,
            path,
            query,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, falling back to the scheme default
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.secure {
            DEFAULT_COAPS_PORT
        } else {
            DEFAULT_COAP_PORT
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Path segments, without empty segments
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }

    /// Scheme, host and port, without a trailing slash
    pub fn origin(&self) -> String {
        let scheme = if self.secure { "coaps" } else { "coap" };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => format!("{}://{}:{}", scheme, host, port),
            None => format!("{}://{}", scheme, host),
        }
    }

    /// Same origin with the path (and query) replaced
    pub fn with_path(&self, path_and_query: &str) -> Self {
        let (path, query) = split_path(path_and_query);
        Self {
            secure: self.secure,
            host: self.host.clone(),
            port: self.port,
            path,
            query,
        }
    }

    /// The root resource of this origin
    pub fn root(&self) -> Self {
        self.with_path("/")
    }

    /// The well-known resource list of this origin
    pub fn well_known_core(&self) -> Self {
        self.with_path(WELL_KNOWN_CORE)
    }

    /// Resolve a link target against this URL
    ///
    /// Absolute URLs are returned as-is, `/path` replaces the path, and
    /// anything else is joined to the directory of the current path.
    pub fn resolve(&self, href: &str) -> Result<Self, UrlError> {
        let href = href.trim();
        if href.contains("://") {
            return Self::parse(href);
        }
        if href.starts_with('/') {
            return Ok(self.with_path(href));
        }
        if href.is_empty() {
            return Ok(self.clone());
        }

        let dir = match self.path.rfind('/') {
            Some(idx) => &self.path[..=idx],
            None => "/",
        };
        Ok(self.with_path(&format!("{}{}", dir, href)))
    }
}

fn strip_scheme<'a>(input: &'a str, scheme: &str) -> Option<&'a str> {
    let prefix = input.get(..scheme.len())?;
    if prefix.eq_ignore_ascii_case(scheme) {
        input.get(scheme.len()..)
    } else {
        None
    }
}

/// Split `host[:port]` or `[v6]:port`
fn split_authority(authority: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let after = &rest[end + 1..];
        return match after.strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None if after.is_empty() => Some((host, None)),
            None => None,
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((authority, None)),
    }
}

fn split_path(path_and_query: &str) -> (String, Option<String>) {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (path_and_query, None),
    };
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    (path, query.filter(|q| !q.is_empty()))
}

impl fmt::Display for CoapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.origin(), self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

impl FromStr for CoapUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CoapUrl {
    type Error = UrlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CoapUrl> for String {
    fn from(url: CoapUrl) -> Self {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_port() {
        let url = CoapUrl::parse("coap://192.168.1.10:5683/lights/1").unwrap();
        assert_eq!(url.host(), "192.168.1.10");
        assert_eq!(url.port(), 5683);
        assert_eq!(url.path(), "/lights/1");
        assert_eq!(url.to_string(), "coap://192.168.1.10:5683/lights/1");
    }

    #[test]
    fn test_parse_defaults() {
        let url = CoapUrl::parse("coap://lamp.local").unwrap();
        assert_eq!(url.port(), DEFAULT_COAP_PORT);
        assert_eq!(url.path(), "/");
        assert_eq!(url.to_string(), "coap://lamp.local/");

        let secure = CoapUrl::parse("coaps://lamp.local/x").unwrap();
        assert!(secure.is_secure());
        assert_eq!(secure.port(), DEFAULT_COAPS_PORT);
    }

    #[test]
    fn test_parse_ipv6() {
        let url = CoapUrl::parse("coap://[fe80::1]:61616/state").unwrap();
        assert_eq!(url.host(), "fe80::1");
        assert_eq!(url.port(), 61616);
        assert_eq!(url.to_string(), "coap://[fe80::1]:61616/state");
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert_eq!(
            CoapUrl::parse("http://example.com/"),
            Err(UrlError::UnsupportedScheme("http://example.com/".to_string()))
        );
        assert!(matches!(
            CoapUrl::parse("coap://host:notaport/"),
            Err(UrlError::InvalidPort(_))
        ));
        assert!(matches!(
            CoapUrl::parse("coap:///path"),
            Err(UrlError::MissingHost(_))
        ));
    }

    #[test]
    fn test_parse_non_ascii_near_scheme() {
        assert_eq!(
            CoapUrl::parse("coap:/\u{e9}h"),
            Err(UrlError::UnsupportedScheme("coap:/\u{e9}h".to_string()))
        );
        assert!(matches!(
            CoapUrl::parse("\u{e9}\u{e9}\u{e9}\u{e9}"),
            Err(UrlError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            CoapUrl::parse("coaps:/\u{e9}"),
            Err(UrlError::UnsupportedScheme(_))
        ));
        assert!(matches!(CoapUrl::parse("coap"), Err(UrlError::UnsupportedScheme(_))));

        let url = CoapUrl::parse("COAP://l\u{e4}mpe/zimmer").unwrap();
        assert_eq!(url.host(), "l\u{e4}mpe");
        assert_eq!(url.path(), "/zimmer");
    }

    #[test]
    fn test_query_is_kept_apart() {
        let url = CoapUrl::parse("coap://h/core?rt=light").unwrap();
        assert_eq!(url.path(), "/core");
        assert_eq!(url.query(), Some("rt=light"));
        assert_eq!(url.to_string(), "coap://h/core?rt=light");
    }

    #[test]
    fn test_well_known_core() {
        let url = CoapUrl::parse("coap://h:1234/some/where").unwrap();
        assert_eq!(url.well_known_core().to_string(), "coap://h:1234/.well-known/core");
    }

    #[test]
    fn test_resolve() {
        let base = CoapUrl::parse("coap://h:1234/a/b").unwrap();
        assert_eq!(base.resolve("/c").unwrap().to_string(), "coap://h:1234/c");
        assert_eq!(base.resolve("c").unwrap().to_string(), "coap://h:1234/a/c");
        assert_eq!(
            base.resolve("coap://other/x").unwrap().to_string(),
            "coap://other/x"
        );
        assert_eq!(base.resolve("").unwrap(), base);
    }

    #[test]
    fn test_segments() {
        let url = CoapUrl::parse("coap://h/a//b/").unwrap();
        assert_eq!(url.segments().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
