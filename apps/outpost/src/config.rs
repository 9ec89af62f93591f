use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use url::Url;

use crate::session::{Credentials, DIAL_TIMEOUT};

pub const DEFAULT_SERVER_URL: &str = "wss://127.0.0.1:8443/api/v1/agent/connect";
pub const DEFAULT_RELEASE_URL: &str =
    "https://github.com/outpost-agent/outpost/releases/latest/download/outpost";

#[derive(Debug, Parser)]
#[command(
    name = "outpost",
    author,
    version,
    about = "Remote-control agent for the Outpost control server"
)]
pub struct Cli {
    /// WebSocket endpoint of the control server.
    #[arg(long = "server", env = "OUTPOST_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
    pub server_url: String,

    /// Authentication token issued for this host.
    #[arg(long, env = "OUTPOST_TOKEN")]
    pub token: String,

    /// Server identifier this agent reports as.
    #[arg(long = "id", env = "OUTPOST_SERVER_ID")]
    pub server_id: String,

    /// Base64 Ed25519 public key that signs command directives. Leaving it
    /// empty makes the agent refuse every command.
    #[arg(long, env = "OUTPOST_TRUST_ANCHOR", default_value = "")]
    pub trust_anchor: String,

    /// Where self-updates download the latest agent binary from.
    #[arg(long, env = "OUTPOST_RELEASE_URL", default_value = DEFAULT_RELEASE_URL)]
    pub release_url: String,

    /// Seconds allowed for TCP connect plus the WebSocket upgrade.
    #[arg(
        long = "dial-timeout",
        env = "OUTPOST_DIAL_TIMEOUT",
        default_value_t = DIAL_TIMEOUT.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub dial_timeout_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid server URL {url}: {source}")]
    InvalidEndpoint {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("server URL must use ws:// or wss://, got {0}://")]
    UnsupportedScheme(String),
}

/// Everything the agent needs, fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub endpoint: Url,
    pub credentials: Credentials,
    pub trust_anchor: String,
    pub release_url: String,
    pub dial_timeout: Duration,
}

impl TryFrom<Cli> for AgentConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let endpoint = Url::parse(&cli.server_url).map_err(|source| ConfigError::InvalidEndpoint {
            url: cli.server_url.clone(),
            source,
        })?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(ConfigError::UnsupportedScheme(endpoint.scheme().to_string()));
        }
        Ok(Self {
            endpoint,
            credentials: Credentials {
                token: cli.token,
                server_id: cli.server_id,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            trust_anchor: cli.trust_anchor,
            release_url: cli.release_url,
            dial_timeout: Duration::from_secs(cli.dial_timeout_secs),
        })
    }
}
