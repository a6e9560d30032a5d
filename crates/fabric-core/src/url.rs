//! The universal, immutable, addressable descriptor.
//!
//! Every export, registration, subscription and routing decision in the
//! pipeline is keyed off a [`Url`]. It is deliberately hand-rolled rather
//! than built on a generic `url`-style crate: its string form doubles as a
//! cache key and must stay byte-for-byte deterministic across equal
//! parameter sets, and a handful of framework-specific fields (a bare
//! `username`, parameters instead of a query string) don't map cleanly onto
//! RFC 3986 parsing anyway.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::UrlParseError;

/// Parameter keys starting with `.` are hidden: never persisted to the
/// registry, never shown in the simplified form.
pub fn is_hidden_key(key: &str) -> bool {
    key.starts_with('.')
}

/// Immutable, addressable descriptor: scheme, host, port, path, parameters.
///
/// Cloning is cheap-ish (one `BTreeMap` clone); mutation always produces a
/// new value via [`Url::with_parameter`] / [`Url::without_parameter`] /
/// [`UrlBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Url {
    protocol: String,
    username: Option<String>,
    host: String,
    port: Option<u16>,
    path: String,
    // BTreeMap keeps the string form deterministic regardless of
    // insertion order, which is exactly what a cache-key representation
    // needs.
    parameters: BTreeMap<String, String>,
}

impl Url {
    /// Start building a url for `protocol://host`.
    #[must_use]
    pub fn builder(protocol: impl Into<String>, host: impl Into<String>) -> UrlBuilder {
        UrlBuilder {
            protocol: protocol.into(),
            username: None,
            host: host.into(),
            port: None,
            path: String::new(),
            parameters: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn address(&self) -> String {
        match self.port {
            Some(p) => format!("{}:{p}", self.host),
            None => self.host.clone(),
        }
    }

    /// Read a parameter, falling back to `default` when absent or empty.
    #[must_use]
    pub fn parameter<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.parameters
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
    }

    #[must_use]
    pub fn parameter_opt(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn parameter_bool(&self, key: &str, default: bool) -> bool {
        match self.parameters.get(key).map(String::as_str) {
            Some("true") => true,
            Some("false") => false,
            _ => default,
        }
    }

    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Produce a new `Url` with `key=value` set (overwriting any existing
    /// value), leaving `self` untouched.
    #[must_use]
    pub fn with_parameter(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.parameters.insert(key.into(), value.into());
        next
    }

    /// Produce a new `Url` with every key in `keys` absent.
    #[must_use]
    pub fn without_parameters(&self, keys: &[&str]) -> Self {
        let mut next = self.clone();
        for k in keys {
            next.parameters.remove(*k);
        }
        next
    }

    /// Produce a new `Url` with every hidden (`.`-prefixed) key removed.
    #[must_use]
    pub fn without_hidden_parameters(&self) -> Self {
        let mut next = self.clone();
        next.parameters.retain(|k, _| !is_hidden_key(k));
        next
    }

    /// Produce a new `Url` whose protocol is replaced.
    #[must_use]
    pub fn with_protocol(&self, protocol: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.protocol = protocol.into();
        next
    }

    /// `group/interface:version`, with `group/` and `:version` omitted when
    /// empty. `interface` defaults to the path when the `interface`
    /// parameter itself is absent.
    #[must_use]
    pub fn service_key(&self) -> String {
        let group = self.parameters.get("group").map(String::as_str).unwrap_or("");
        let interface = self
            .parameters
            .get("interface")
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .unwrap_or(&self.path);
        let version = self.parameters.get("version").map(String::as_str).unwrap_or("");

        let mut key = String::new();
        if !group.is_empty() {
            key.push_str(group);
            key.push('/');
        }
        key.push_str(interface);
        if !version.is_empty() {
            key.push(':');
            key.push_str(version);
        }
        key
    }

    /// Parse the canonical string form produced by [`Url::to_string`].
    ///
    /// # Errors
    /// Returns [`UrlParseError`] when the `scheme://` prefix is missing, the
    /// port is not numeric, or a `%XX` escape is malformed.
    pub fn parse(s: &str) -> Result<Self, UrlParseError> {
        let (protocol, rest) = s
            .split_once("://")
            .ok_or_else(|| UrlParseError::MissingProtocol(s.to_string()))?;

        let (authority_and_path, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };
        let (authority, path) = match authority_and_path.split_once('/') {
            Some((a, p)) => (a, p),
            None => (authority_and_path, ""),
        };

        let (username, hostport) = match authority.split_once('@') {
            Some((u, h)) => (Some(u.to_string()), h),
            None => (None, authority),
        };

        let (host, port) = match hostport.rsplit_once(':') {
            Some((h, p)) if !h.is_empty() => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| UrlParseError::InvalidPort(p.to_string()))?;
                (h.to_string(), Some(port))
            }
            _ => (hostport.to_string(), None),
        };

        let mut parameters = BTreeMap::new();
        if let Some(q) = query {
            if !q.is_empty() {
                for pair in q.split('&') {
                    let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                    parameters.insert(percent_decode(k)?, percent_decode(v)?);
                }
            }
        }

        Ok(Self {
            protocol: protocol.to_string(),
            username,
            host,
            port,
            path: percent_decode(path)?,
            parameters,
        })
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.protocol)?;
        if let Some(u) = &self.username {
            write!(f, "{u}@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(p) = self.port {
            write!(f, ":{p}")?;
        }
        write!(f, "/{}", percent_encode(&self.path))?;
        if !self.parameters.is_empty() {
            write!(f, "?")?;
            // BTreeMap iterates in sorted key order — this is what makes
            // the string form deterministic and cache-key-safe.
            for (i, (k, v)) in self.parameters.iter().enumerate() {
                if i > 0 {
                    write!(f, "&")?;
                }
                write!(f, "{}={}", percent_encode(k), percent_encode(v))?;
            }
        }
        Ok(())
    }
}

/// Builder for [`Url`].
pub struct UrlBuilder {
    protocol: String,
    username: Option<String>,
    host: String,
    port: Option<u16>,
    path: String,
    parameters: BTreeMap<String, String>,
}

impl UrlBuilder {
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    #[must_use]
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn build(self) -> Url {
        Url {
            protocol: self.protocol,
            username: self.username,
            host: self.host,
            port: self.port,
            path: self.path,
            parameters: self.parameters,
        }
    }
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn percent_decode(s: &str) -> Result<String, UrlParseError> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = s
                    .get(i + 1..i + 3)
                    .ok_or_else(|| UrlParseError::InvalidEncoding(s.to_string()))?;
                let byte = u8::from_str_radix(hex, 16)
                    .map_err(|_| UrlParseError::InvalidEncoding(s.to_string()))?;
                out.push(byte);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| UrlParseError::InvalidEncoding(s.to_string()))
}
