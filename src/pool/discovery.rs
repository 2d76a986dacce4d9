use crate::domain::HecError;
use rand::seq::IndexedRandom;
use std::fmt;
use url::Url;

#[cfg(test)]
use mockall::automock;

/// A HEC destination, e.g. `https://hec-1.example.com:8088`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn parse(raw: &str) -> Result<Self, HecError> {
        let url = Url::parse(raw)
            .map_err(|e| HecError::Transport(format!("invalid endpoint url '{raw}': {e}")))?;
        if url.host_str().is_none() {
            return Err(HecError::Transport(format!("endpoint url '{raw}' has no host")));
        }
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `host:port`, used to derive channel ids.
    pub fn destination(&self) -> String {
        let host = self.url.host_str().unwrap_or("unknown");
        match self.url.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Source of destinations for the channel pool.
#[cfg_attr(test, automock)]
pub trait Discoverer: Send + Sync {
    fn addrs(&self) -> Vec<Endpoint>;

    fn randomly_choose_addr(&self) -> Option<Endpoint>;
}

/// Fixed list of configured endpoints.
#[derive(Debug, Clone)]
pub struct StaticDiscoverer {
    endpoints: Vec<Endpoint>,
}

impl StaticDiscoverer {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }

    pub fn from_urls(urls: &[Url]) -> Self {
        Self::new(urls.iter().cloned().map(Endpoint::new).collect())
    }
}

impl Discoverer for StaticDiscoverer {
    fn addrs(&self) -> Vec<Endpoint> {
        self.endpoints.clone()
    }

    fn randomly_choose_addr(&self) -> Option<Endpoint> {
        self.endpoints.choose(&mut rand::rng()).cloned()
    }
}
