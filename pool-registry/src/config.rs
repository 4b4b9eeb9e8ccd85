//! Registry configuration.
//!
//! A [`Config`] is either assembled in code with the `with_*` methods or read
//! from string properties via [`Config::from_properties`]. Either way it is
//! validated before a registry joins.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;
use crate::member_set::MemberSetKind;

/// What a member wants to use the pool for. Operations that need a capability
/// that was not requested fail with a configuration error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub elections: bool,
    pub signals: bool,
    pub membership: bool,
    pub closed_world: bool,
    pub termination: bool,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            elections: true,
            signals: true,
            membership: true,
            closed_world: true,
            termination: true,
        }
    }

    pub fn with_elections(mut self) -> Self {
        self.elections = true;
        self
    }

    pub fn with_signals(mut self) -> Self {
        self.signals = true;
        self
    }

    pub fn with_membership(mut self) -> Self {
        self.membership = true;
        self
    }

    pub fn with_closed_world(mut self) -> Self {
        self.closed_world = true;
        self
    }

    pub fn with_termination(mut self) -> Self {
        self.termination = true;
        self
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pool_name: Option<String>,
    server_address: Option<String>,
    location: String,
    capabilities: Capabilities,
    pool_size: Option<u32>,
    heartbeat_interval: Duration,
    heartbeat_jitter: f64,
    gossip: bool,
    gossip_interval: Duration,
    gossip_spread: f64,
    tree: bool,
    peer_bootstrap: Option<bool>,
    event_push_interval: Duration,
    connect_timeout: Duration,
    purge_history: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_name: None,
            server_address: None,
            location: String::new(),
            capabilities: Capabilities::default(),
            pool_size: None,
            heartbeat_interval: Duration::from_secs(120),
            heartbeat_jitter: 0.1,
            gossip: false,
            gossip_interval: Duration::from_secs(1),
            gossip_spread: 2.0,
            tree: false,
            peer_bootstrap: None,
            event_push_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            purge_history: false,
        }
    }
}

impl Config {
    pub fn new(pool_name: impl Into<String>, server_address: impl Into<String>) -> Self {
        Self::default()
            .with_pool_name(pool_name)
            .at_server(server_address)
    }

    /// Reads a configuration from `registry.*` properties. Durations are
    /// given in milliseconds.
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();

        for (key, value) in properties {
            let value = value.as_ref().trim();

            match key.as_ref() {
                "registry.pool.name" => config.pool_name = Some(value.to_owned()),
                "registry.server.address" => config.server_address = Some(value.to_owned()),
                "registry.location" => config.location = value.to_owned(),
                "registry.pool.size" => {
                    config.pool_size = Some(parse("registry.pool.size", value)?)
                }
                "registry.heartbeat.interval" => {
                    config.heartbeat_interval = parse_millis("registry.heartbeat.interval", value)?
                }
                "registry.heartbeat.jitter" => {
                    config.heartbeat_jitter = parse("registry.heartbeat.jitter", value)?
                }
                "registry.gossip" => config.gossip = parse("registry.gossip", value)?,
                "registry.gossip.interval" => {
                    config.gossip_interval = parse_millis("registry.gossip.interval", value)?
                }
                "registry.gossip.spread" => {
                    config.gossip_spread = parse("registry.gossip.spread", value)?
                }
                "registry.tree" => config.tree = parse("registry.tree", value)?,
                "registry.peer.bootstrap" => {
                    config.peer_bootstrap = Some(parse("registry.peer.bootstrap", value)?)
                }
                "registry.push.interval" => {
                    config.event_push_interval = parse_millis("registry.push.interval", value)?
                }
                "registry.connect.timeout" => {
                    config.connect_timeout = parse_millis("registry.connect.timeout", value)?
                }
                "registry.purge.history" => {
                    config.purge_history = parse("registry.purge.history", value)?
                }
                "registry.capability.elections" => {
                    config.capabilities.elections = parse("registry.capability.elections", value)?
                }
                "registry.capability.signals" => {
                    config.capabilities.signals = parse("registry.capability.signals", value)?
                }
                "registry.capability.membership" => {
                    config.capabilities.membership =
                        parse("registry.capability.membership", value)?
                }
                "registry.capability.closed.world" => {
                    config.capabilities.closed_world =
                        parse("registry.capability.closed.world", value)?
                }
                "registry.capability.termination" => {
                    config.capabilities.termination =
                        parse("registry.capability.termination", value)?
                }
                other if other.starts_with("registry.") => {
                    warn!("Ignoring unknown property `{}`.", other)
                }
                _ => {}
            }
        }

        config.validate()?;

        Ok(config)
    }

    pub fn with_pool_name(mut self, pool_name: impl Into<String>) -> Self {
        self.pool_name = Some(pool_name.into());
        self
    }

    pub fn at_server(mut self, server_address: impl Into<String>) -> Self {
        self.server_address = Some(server_address.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Size of a closed world pool.
    pub fn with_pool_size(mut self, size: u32) -> Self {
        self.pool_size = Some(size);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Heartbeats are sent after `interval × (1 - jitter)` up to `interval`.
    pub fn with_heartbeat_jitter(mut self, jitter: f64) -> Self {
        self.heartbeat_jitter = jitter;
        self
    }

    pub fn with_gossip(mut self, interval: Duration) -> Self {
        self.gossip = true;
        self.gossip_interval = interval;
        self
    }

    /// Gossip rounds are `[0, spread × interval)` apart.
    pub fn with_gossip_spread(mut self, spread: f64) -> Self {
        self.gossip_spread = spread;
        self
    }

    pub fn with_tree(mut self) -> Self {
        self.tree = true;
        self
    }

    pub fn with_peer_bootstrap(mut self, enabled: bool) -> Self {
        self.peer_bootstrap = Some(enabled);
        self
    }

    pub fn with_event_push_interval(mut self, interval: Duration) -> Self {
        self.event_push_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_purge_history(mut self, purge: bool) -> Self {
        self.purge_history = purge;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_name.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("registry.pool.name"));
        }

        if self.server_address.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("registry.server.address"));
        }

        if self.gossip && self.tree {
            return Err(ConfigError::GossipAndTree);
        }

        match self.peer_bootstrap {
            Some(false) if self.gossip => {
                return Err(ConfigError::PeerBootstrap {
                    required: "enabled",
                    because: "registry.gossip",
                })
            }
            Some(true) if self.tree => {
                return Err(ConfigError::PeerBootstrap {
                    required: "disabled",
                    because: "registry.tree",
                })
            }
            _ => {}
        }

        if self.capabilities.closed_world && self.pool_size.map_or(true, |s| s == 0) {
            return Err(ConfigError::MissingPoolSize);
        }

        if !(0.0..1.0).contains(&self.heartbeat_jitter) {
            return Err(ConfigError::Invalid {
                key: "registry.heartbeat.jitter",
                value: self.heartbeat_jitter.to_string(),
            });
        }

        let longest_gossip_pause = self.gossip_interval.as_secs_f64() * self.gossip_spread;

        if !self.gossip_spread.is_finite()
            || self.gossip_spread <= 0.0
            || Duration::try_from_secs_f64(longest_gossip_pause).is_err()
        {
            return Err(ConfigError::Invalid {
                key: "registry.gossip.spread",
                value: self.gossip_spread.to_string(),
            });
        }

        Ok(())
    }

    pub fn pool_name(&self) -> &str {
        self.pool_name.as_deref().unwrap_or_default()
    }

    pub fn server_address(&self) -> &str {
        self.server_address.as_deref().unwrap_or_default()
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// The size of the pool if it is a closed world.
    pub fn pool_size(&self) -> Option<u32> {
        self.pool_size.filter(|_| self.capabilities.closed_world)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn heartbeat_jitter(&self) -> f64 {
        self.heartbeat_jitter
    }

    pub fn gossip(&self) -> bool {
        self.gossip
    }

    pub fn gossip_interval(&self) -> Duration {
        self.gossip_interval
    }

    pub fn gossip_spread(&self) -> f64 {
        self.gossip_spread
    }

    pub fn tree(&self) -> bool {
        self.tree
    }

    pub fn peer_bootstrap(&self) -> bool {
        self.peer_bootstrap.unwrap_or(!self.tree)
    }

    pub fn event_push_interval(&self) -> Duration {
        self.event_push_interval
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn purge_history(&self) -> bool {
        self.purge_history
    }

    pub(crate) fn member_set_kind(&self) -> MemberSetKind {
        if self.tree {
            MemberSetKind::Tree
        } else {
            MemberSetKind::List
        }
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_owned(),
    })
}

fn parse_millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse(key, value).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_are_read() {
        let config = Config::from_properties([
            ("registry.pool.name", "p"),
            ("registry.server.address", "server"),
            ("registry.heartbeat.interval", "250"),
            ("registry.gossip", "true"),
            ("registry.gossip.interval", " 50 "),
            ("registry.capability.elections", "true"),
            ("unrelated.key", "whatever"),
        ])
        .unwrap();

        assert_eq!(config.pool_name(), "p");
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(250));
        assert_eq!(config.gossip_interval(), Duration::from_millis(50));
        assert!(config.gossip());
        assert!(config.peer_bootstrap());
        assert!(config.capabilities().elections);
        assert!(!config.capabilities().signals);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = Config::from_properties([
            ("registry.pool.name", "p"),
            ("registry.server.address", "server"),
            ("registry.pool.size", "many"),
        ])
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "registry.pool.size",
                ..
            }
        ));
    }

    #[test]
    fn dissemination_settings_must_agree() {
        let base = Config::new("p", "server");

        assert!(matches!(
            base.clone().with_tree().with_gossip(Duration::from_secs(1)).validate(),
            Err(ConfigError::GossipAndTree)
        ));
        assert!(matches!(
            base.clone().with_tree().with_peer_bootstrap(true).validate(),
            Err(ConfigError::PeerBootstrap { .. })
        ));
        assert!(matches!(
            base.clone()
                .with_gossip(Duration::from_secs(1))
                .with_peer_bootstrap(false)
                .validate(),
            Err(ConfigError::PeerBootstrap { .. })
        ));

        let tree = base.with_tree();
        assert!(tree.validate().is_ok());
        assert!(!tree.peer_bootstrap());
    }

    #[test]
    fn gossip_spread_must_be_a_usable_factor() {
        let base = Config::new("p", "server").with_gossip(Duration::from_secs(1));

        for spread in [f64::INFINITY, f64::NAN, 1e300, 0.0, -1.0] {
            assert!(
                matches!(
                    base.clone().with_gossip_spread(spread).validate(),
                    Err(ConfigError::Invalid {
                        key: "registry.gossip.spread",
                        ..
                    })
                ),
                "spread {} was accepted",
                spread
            );
        }

        assert!(base.with_gossip_spread(0.5).validate().is_ok());
    }

    #[test]
    fn closed_world_needs_size() {
        let config = Config::new("p", "server")
            .with_capabilities(Capabilities::none().with_closed_world());

        assert!(matches!(config.validate(), Err(ConfigError::MissingPoolSize)));
        assert!(config.with_pool_size(3).validate().is_ok());
        assert!(matches!(
            Config::default().validate(),
            Err(ConfigError::Missing("registry.pool.name"))
        ));
    }
}
