// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber configuration - protocol constants and per-context settings.
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: Compile-time constants (default group, port, timeouts)
//! - **Level 2 (Dynamic)**: [`SubscriberConfig`] built once per context, with
//!   optional environment overrides
//!
//! # Example
//!
//! ```
//! use rmc_sub::config::SubscriberConfig;
//! use std::time::Duration;
//!
//! let config = SubscriberConfig::builder()
//!     .multicast_port(4723)
//!     .ack_timeout(Duration::from_millis(100))
//!     .build()
//!     .expect("valid config");
//! assert_eq!(config.max_connections, rmc_sub::config::MAX_CONNECTIONS);
//! ```

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::readiness::UserTag;

/// Default multicast group publishers distribute on.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 1);

/// Default multicast UDP port.
pub const DEFAULT_MULTICAST_PORT: u16 = 4723;

/// Default acknowledgement coalescing window.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(50);

/// Default number of unicast backchannel slots.
pub const MAX_CONNECTIONS: usize = 16;

/// Upper bound on reads performed for a single readiness notification.
///
/// Keeps one busy descriptor from starving the others in the same wait.
pub const MAX_READS_PER_EVENT: usize = 64;

/// Receive buffer size for one multicast datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Receive chunk size for unicast stream reads.
pub const STREAM_READ_CHUNK: usize = 16 * 1024;

/// How long shutdown waits for a backchannel to drain before closing it
/// with acknowledgements still queued.
pub const SHUTDOWN_LINGER: Duration = Duration::from_secs(2);

/// Immutable per-context settings.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Context id; `None` means "assign randomly on creation".
    pub context_id: Option<u32>,
    /// Multicast group to receive on.
    pub multicast_group: Ipv4Addr,
    /// Local interface used to join the group.
    pub multicast_iface: Ipv4Addr,
    /// Multicast UDP port.
    pub multicast_port: u16,
    /// Acknowledgement coalescing window.
    pub ack_timeout: Duration,
    /// Number of unicast slots in the connection index.
    pub max_connections: usize,
    /// Opaque value threaded through every readiness callback.
    pub user_tag: UserTag,
    /// Use the first received pid as delivery baseline for new publishers.
    pub join_mid_stream: bool,
    /// Enable SO_REUSEPORT on the multicast socket.
    pub reuse_port: bool,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            context_id: None,
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_iface: Ipv4Addr::UNSPECIFIED,
            multicast_port: DEFAULT_MULTICAST_PORT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_connections: MAX_CONNECTIONS,
            user_tag: UserTag::default(),
            join_mid_stream: false,
            reuse_port: false,
        }
    }
}

impl SubscriberConfig {
    /// Start building a configuration from defaults.
    pub fn builder() -> SubscriberConfigBuilder {
        SubscriberConfigBuilder {
            config: Self::default(),
        }
    }

    /// Check invariants that the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.ack_timeout.is_zero() {
            return Err(Error::Config("ack timeout must be non-zero".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if self.max_connections >= u32::MAX as usize {
            return Err(Error::Config(format!(
                "max_connections {} exceeds slot index range",
                self.max_connections
            )));
        }
        if !self.multicast_group.is_multicast() {
            return Err(Error::Config(format!(
                "{} is not a multicast group address",
                self.multicast_group
            )));
        }
        Ok(())
    }

    /// Context id to use, drawing a random non-zero one when none is configured.
    pub fn resolve_context_id(&self) -> u32 {
        match self.context_id {
            Some(id) if id != 0 => id,
            _ => loop {
                let id = fastrand::u32(..);
                if id != 0 {
                    break id;
                }
            },
        }
    }
}

/// Builder for [`SubscriberConfig`].
#[derive(Debug, Clone)]
pub struct SubscriberConfigBuilder {
    config: SubscriberConfig,
}

impl SubscriberConfigBuilder {
    /// Explicit context id (0 keeps random assignment).
    pub fn context_id(mut self, id: u32) -> Self {
        self.config.context_id = if id == 0 { None } else { Some(id) };
        self
    }

    pub fn multicast_group(mut self, group: Ipv4Addr) -> Self {
        self.config.multicast_group = group;
        self
    }

    pub fn multicast_iface(mut self, iface: Ipv4Addr) -> Self {
        self.config.multicast_iface = iface;
        self
    }

    pub fn multicast_port(mut self, port: u16) -> Self {
        self.config.multicast_port = port;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn user_tag(mut self, tag: UserTag) -> Self {
        self.config.user_tag = tag;
        self
    }

    pub fn join_mid_stream(mut self, enabled: bool) -> Self {
        self.config.join_mid_stream = enabled;
        self
    }

    pub fn reuse_port(mut self, enabled: bool) -> Self {
        self.config.reuse_port = enabled;
        self
    }

    /// Apply `RMC_MULTICAST_IF`, `RMC_ACK_TIMEOUT_MS` and `RMC_REUSEPORT`.
    ///
    /// Unparsable values are ignored with a debug log.
    pub fn env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(var) = lookup("RMC_MULTICAST_IF") {
            match var.parse::<Ipv4Addr>() {
                Ok(addr) => {
                    log::debug!("[CONFIG] Using RMC_MULTICAST_IF override: {}", addr);
                    self.config.multicast_iface = addr;
                }
                Err(_) => log::debug!("[CONFIG] Ignoring unparsable RMC_MULTICAST_IF={}", var),
            }
        }
        if let Some(var) = lookup("RMC_ACK_TIMEOUT_MS") {
            match var.parse::<u64>() {
                Ok(ms) => {
                    log::debug!("[CONFIG] Using RMC_ACK_TIMEOUT_MS override: {}", ms);
                    self.config.ack_timeout = Duration::from_millis(ms);
                }
                Err(_) => {
                    log::debug!("[CONFIG] Ignoring unparsable RMC_ACK_TIMEOUT_MS={}", var);
                }
            }
        }
        if let Some(var) = lookup("RMC_REUSEPORT") {
            self.config.reuse_port = var == "1";
        }
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<SubscriberConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
