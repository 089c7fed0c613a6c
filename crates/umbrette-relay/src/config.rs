use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use umbrette_core::config;

/// Relay service configuration, read once from the environment at boot.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub addr: SocketAddr,
    pub database_url: String,
    /// Externally advertised base URL; the relay's own WebSocket URL is
    /// derived from it.
    pub local_domain: String,
    pub name: String,
    pub description: String,
    pub contact: Option<String>,
    /// Maximum number of filters accepted per REQ/COUNT request.
    pub max_filters: usize,
    /// Hard cap on events returned per query.
    pub query_limit: usize,
    /// Bound on a single backlog query, including stream consumption.
    pub query_timeout: Duration,
    pub max_event_bytes: usize,
    pub max_tags: usize,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        let addr = config::socket_addr_from_env("RELAY_ADDR", "127.0.0.1:8000")?;
        let database_url = config::env_or("DATABASE_URL", "sqlite://umbrette.db?mode=rwc");
        let local_domain = config::env_or(
            "LOCAL_DOMAIN",
            &format!("http://localhost:{}", addr.port()),
        );
        let name = config::env_or("RELAY_NAME", "umbrette");
        let description = config::env_or(
            "RELAY_DESCRIPTION",
            "A Nostr relay specializing in long-form content.",
        );
        let contact = config::optional_env("RELAY_CONTACT");
        let max_filters = config::usize_from_env("RELAY_MAX_FILTERS", 10)?;
        let query_limit = config::usize_from_env("RELAY_QUERY_LIMIT", 100)?;
        let query_timeout =
            Duration::from_millis(config::u64_from_env("RELAY_QUERY_TIMEOUT_MS", 1000)?);
        let max_event_bytes = config::usize_from_env("RELAY_MAX_EVENT_BYTES", 32 * 1024)?;
        let max_tags = config::usize_from_env("RELAY_MAX_TAGS", 200)?;

        Ok(Self {
            addr,
            database_url,
            local_domain,
            name,
            description,
            contact,
            max_filters,
            query_limit,
            query_timeout,
            max_event_bytes,
            max_tags,
        })
    }

    /// The relay's own WebSocket URL: `http` hosts advertise `ws`, `https`
    /// hosts advertise `wss`.
    pub fn relay_url(&self) -> String {
        let (scheme, host) = self
            .local_domain
            .split_once("://")
            .unwrap_or(("http", self.local_domain.as_str()));
        let scheme = if scheme == "https" { "wss" } else { "ws" };
        format!("{scheme}://{}", host.trim_end_matches('/'))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: ([127, 0, 0, 1], 8000).into(),
            database_url: "sqlite://umbrette.db?mode=rwc".into(),
            local_domain: "http://localhost:8000".into(),
            name: "umbrette".into(),
            description: "A Nostr relay specializing in long-form content.".into(),
            contact: None,
            max_filters: 10,
            query_limit: 100,
            query_timeout: Duration::from_secs(1),
            max_event_bytes: 32 * 1024,
            max_tags: 200,
        }
    }
}
