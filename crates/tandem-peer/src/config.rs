use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::net::IpAddr;
use tandem_media::DEFAULT_STREAM_CAPACITY;

use crate::error::Result;

/// What to do when some enumerated paths fail to bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindPolicy {
    /// Advertise whatever bound and report the rest alongside the offer
    #[default]
    ContinueAndReport,
    /// Close every opened listener and fail on the first failure
    AbortOnFirstFailure,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-route delivery channel capacity
    pub stream_capacity: usize,
    /// Write-channel capacity for outbound tracks
    pub track_capacity: usize,
    pub bind_policy: BindPolicy,
    pub include_loopback: bool,
    pub enable_ipv6: bool,
    /// Explicit local addresses; replaces interface enumeration when set
    pub bind_addresses: Vec<IpAddr>,
    pub recv_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            track_capacity: 64,
            bind_policy: BindPolicy::default(),
            include_loopback: false,
            enable_ipv6: true,
            bind_addresses: Vec::new(),
            recv_buffer_size: 1500,
        }
    }
}

impl Config {
    /// Load from an optional `tandem.{toml,json,yaml}` file, then `TANDEM_*`
    /// environment variables.
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(File::with_name("tandem").required(false))
            .add_source(
                Environment::with_prefix("TANDEM")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("bind_addresses"),
            );

        Self::from_builder(builder)
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: Config = builder.build()?.try_deserialize()?;

        if config.recv_buffer_size == 0 {
            tracing::warn!("recv_buffer_size is 0, falling back to 1500");
            return Ok(Config {
                recv_buffer_size: 1500,
                ..config
            });
        }

        Ok(config)
    }
}
