//! Server Configuration
//!
//! Every setting comes from a command-line flag with a `PERUSE_*` environment
//! fallback. `ServerConfig::validate` runs before anything connects, and the
//! helper methods hand each component its own settings struct.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use peruse_core::{ConfigError, Did};
use peruse_events::{ConsumerConfig, DEFAULT_DISPATCH_CONCURRENCY};
use peruse_storage::ClickHouseConfig;

use crate::auth::AuthConfig;
use crate::extractor::NervanaConfig;
use crate::feeds::TopicFeedConfig;
use crate::identity::DirectoryConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Command-line arguments for the peruse binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "peruse", version, about = "Feed generator for the AT Protocol network")]
pub struct ServerConfig {
    /// Listen address; a bare `:port` binds every interface.
    #[arg(long, env = "PERUSE_HTTP_ADDR", default_value = ":8080")]
    pub http_addr: String,

    /// ClickHouse HTTP endpoint.
    #[arg(long, env = "PERUSE_CLICKHOUSE_ADDR")]
    pub clickhouse_addr: String,

    #[arg(long, env = "PERUSE_CLICKHOUSE_DATABASE")]
    pub clickhouse_database: String,

    #[arg(long, env = "PERUSE_CLICKHOUSE_USER")]
    pub clickhouse_user: String,

    #[arg(long, env = "PERUSE_CLICKHOUSE_PASS", hide_env_values = true)]
    pub clickhouse_pass: String,

    /// Account that publishes the feed generator records.
    #[arg(long, env = "PERUSE_FEED_OWNER_DID")]
    pub feed_owner_did: String,

    /// DID of this service; also the expected token audience.
    #[arg(long, env = "PERUSE_SERVICE_DID")]
    pub service_did: String,

    /// Public URL this service is reachable at.
    #[arg(long, env = "PERUSE_SERVICE_ENDPOINT")]
    pub service_endpoint: String,

    #[arg(long, env = "PERUSE_CHRONO_FEED_RKEY")]
    pub chrono_feed_rkey: String,

    #[arg(long, env = "PERUSE_SUGGESTED_FOLLOWS_RKEY")]
    pub suggested_follows_rkey: String,

    /// Entity extraction endpoint. Topic feeds see no entities without it.
    #[arg(long, env = "PERUSE_NERVANA_ENDPOINT")]
    pub nervana_endpoint: Option<String>,

    #[arg(long, env = "PERUSE_NERVANA_API_KEY", hide_env_values = true)]
    pub nervana_api_key: Option<String>,

    /// Relay serving JSON-framed `subscribeRepos` events. There is no default:
    /// the bundled frame decoder does not read the CBOR framing public relays send.
    #[arg(long, env = "PERUSE_RELAY_HOST")]
    pub relay_host: String,

    #[arg(long, env = "PERUSE_CURSOR_FILE")]
    pub cursor_file: PathBuf,

    #[arg(long, env = "PERUSE_CURSOR_CHECKPOINT_SECS", default_value_t = 5)]
    pub cursor_checkpoint_secs: u64,

    /// Records dispatched to feed modules at once.
    #[arg(long, env = "PERUSE_DISPATCH_CONCURRENCY", default_value_t = DEFAULT_DISPATCH_CONCURRENCY)]
    pub dispatch_concurrency: usize,

    #[arg(long, env = "PERUSE_PLC_URL", default_value = "https://plc.directory")]
    pub plc_url: String,

    #[arg(long, env = "PERUSE_PUBLIC_API_HOST", default_value = "https://public.api.bsky.app")]
    pub public_api_host: String,

    /// TOML file of `[[feed]]` topic feed definitions.
    #[arg(long, env = "PERUSE_TOPIC_FEEDS_FILE")]
    pub topic_feeds_file: Option<PathBuf>,

    #[arg(long, env = "PERUSE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

fn invalid(field: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

impl ServerConfig {
    /// Reject settings that would only fail later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        self.feed_owner()?;
        Did::parse(&self.service_did)
            .map_err(|e| invalid("service_did", &self.service_did, e.to_string()))?;

        if !self.service_endpoint.starts_with("https://") && !self.service_endpoint.starts_with("http://") {
            return Err(invalid(
                "service_endpoint",
                &self.service_endpoint,
                "must be an http(s) URL",
            ));
        }
        if !self.relay_host.starts_with("wss://") && !self.relay_host.starts_with("ws://") {
            return Err(invalid("relay_host", &self.relay_host, "must be a ws(s) URL"));
        }
        for (field, rkey) in [
            ("chrono_feed_rkey", &self.chrono_feed_rkey),
            ("suggested_follows_rkey", &self.suggested_follows_rkey),
        ] {
            if rkey.is_empty() || rkey.contains('/') {
                return Err(invalid(field, rkey, "must be a record key"));
            }
        }
        if self.chrono_feed_rkey == self.suggested_follows_rkey {
            return Err(invalid(
                "suggested_follows_rkey",
                &self.suggested_follows_rkey,
                "must differ from chrono_feed_rkey",
            ));
        }
        if self.cursor_checkpoint_secs == 0 {
            return Err(invalid("cursor_checkpoint_secs", "0", "must be positive"));
        }
        if self.dispatch_concurrency == 0 {
            return Err(invalid("dispatch_concurrency", "0", "must be positive"));
        }
        if self.nervana_endpoint.is_some() && self.nervana_api_key.is_none() {
            return Err(ConfigError::MissingRequired {
                field: "nervana_api_key".to_string(),
            });
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = match self.http_addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.http_addr.clone(),
        };
        addr.parse()
            .map_err(|e: std::net::AddrParseError| invalid("http_addr", &self.http_addr, e.to_string()))
    }

    pub fn feed_owner(&self) -> Result<Did, ConfigError> {
        Did::parse(&self.feed_owner_did)
            .map_err(|e| invalid("feed_owner_did", &self.feed_owner_did, e.to_string()))
    }

    pub fn clickhouse(&self) -> ClickHouseConfig {
        let url = if self.clickhouse_addr.contains("://") {
            self.clickhouse_addr.clone()
        } else {
            format!("http://{}", self.clickhouse_addr)
        };
        ClickHouseConfig {
            url,
            database: self.clickhouse_database.clone(),
            user: self.clickhouse_user.clone(),
            password: self.clickhouse_pass.clone(),
            ..ClickHouseConfig::default()
        }
    }

    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            relay_host: self.relay_host.clone(),
            checkpoint_interval: Duration::from_secs(self.cursor_checkpoint_secs),
            ..ConsumerConfig::default()
        }
    }

    pub fn directory(&self) -> DirectoryConfig {
        DirectoryConfig {
            plc_url: self.plc_url.clone(),
            public_api_host: self.public_api_host.clone(),
            ..DirectoryConfig::default()
        }
    }

    pub fn auth(&self) -> AuthConfig {
        AuthConfig {
            service_did: Some(self.service_did.clone()),
            ..AuthConfig::default()
        }
    }

    pub fn nervana(&self) -> Option<NervanaConfig> {
        match (&self.nervana_endpoint, &self.nervana_api_key) {
            (Some(endpoint), Some(key)) => Some(NervanaConfig::new(endpoint, key)),
            _ => None,
        }
    }

    pub fn topic_feeds(&self) -> Result<Vec<TopicFeedConfig>, ConfigError> {
        match &self.topic_feeds_file {
            Some(path) => TopicFeedConfig::load_all(path),
            None => Ok(Vec::new()),
        }
    }
}
