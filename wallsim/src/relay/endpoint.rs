use std::fmt::{Debug, Display};
use std::str::FromStr;

use anyhow::{Context as _, Result};

/// A `host:port` pair a relay dials.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct RelayEndpoint {
    host: String,
    port: u16,
}

impl RelayEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        // `[::1]` as found in an authority must be dialled as `::1`.
        let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            Some(inner) => inner.to_owned(),
            None => host,
        };
        Self { host, port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for RelayEndpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .with_context(|| format!("Endpoint `{s}` is not in host:port form"))?;
        if host.is_empty() {
            anyhow::bail!("Endpoint `{s}` has an empty host");
        }
        let port = port
            .parse()
            .with_context(|| format!("Invalid port in endpoint `{s}`"))?;
        Ok(Self::new(host, port))
    }
}

impl Display for RelayEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Debug for RelayEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}
