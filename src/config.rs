use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::ConfigError;
use crate::link::{LinkAddress, LinkKind};

pub const MIN_SEGMENT_SIZE: usize = 32;
pub const MAX_SEGMENT_SIZE: usize = 32 * 1024 * 1024;
pub const MIN_TCP_PORT: u16 = 1000;
pub const MAX_IDLE_SHUTDOWN_DELAY_SECS: u32 = 65535;
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 128 * 1024 * 1024;

/// Stack-wide configuration.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Endpoint id announced in every local Contact Header.
    pub local_eid: String,
    /// Whether inbound connections from addresses that match no configured peer are served by a
    /// temporary peer. When `false` such connections are closed right away.
    pub accept_unconfigured_neighbors: bool,
    /// Largest inbound block. A block that grows beyond it is discarded.
    pub max_block_size: usize,
    pub timeouts: Timeouts,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            local_eid: "dtn:none".to_owned(),
            accept_unconfigured_neighbors: true,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            timeouts: Timeouts::default(),
        }
    }
}

/// Fixed delays used by the state machines and their tasks.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// How long to wait for an Ack before giving up on the connection.
    pub ack: Duration,
    /// First delay of the exponential connect backoff.
    pub connect_backoff_min: Duration,
    /// Cap of the exponential connect backoff.
    pub connect_backoff_max: Duration,
    /// Timeout of a single connect attempt.
    pub connect: Duration,
    /// Wait before looking again for an operational peer address.
    pub address_retry: Duration,
    /// Wait before retrying a listener bind that failed.
    pub listener_retry: Duration,
    /// Bound on joining a task. Tasks that do not finish in time are detached.
    pub join: Duration,
    /// Socket write timeout. A peer that stops reading is treated as gone.
    pub write: Duration,
    /// Capacity of each per-peer event queue.
    pub event_queue_capacity: usize,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ack: Duration::from_secs(10),
            connect_backoff_min: Duration::from_secs(1),
            connect_backoff_max: Duration::from_secs(60),
            connect: Duration::from_secs(5),
            address_retry: Duration::from_secs(4),
            listener_retry: Duration::from_secs(4),
            join: Duration::from_secs(2),
            write: Duration::from_secs(30),
            event_queue_capacity: 32,
        }
    }
}

/// Per-peer parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub name: String,
    /// Ask the peer to acknowledge every Data segment.
    pub ack_data_segments: bool,
    /// Zero disables keepalives.
    pub keep_alive_interval_secs: u16,
    /// Wait `reconnection_delay_secs` after losing a connection before connecting again.
    pub delay_before_reconnection: bool,
    pub reconnection_delay_secs: u32,
    /// Close connections on which nothing was received for the idle delay.
    pub idle_connection_shutdown: bool,
    pub idle_connection_shutdown_delay_secs: u32,
    /// Listen for connections from this peer on the links of its addresses.
    pub accept_connections: bool,
    /// Addresses tried in order; the first one on an operational link is used.
    pub addresses: Vec<LinkAddress>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            ack_data_segments: true,
            keep_alive_interval_secs: 10,
            delay_before_reconnection: false,
            reconnection_delay_secs: 4,
            idle_connection_shutdown: true,
            idle_connection_shutdown_delay_secs: 20,
            accept_connections: true,
            addresses: Vec::new(),
        }
    }
}

impl PeerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_connection_shutdown_delay_secs > MAX_IDLE_SHUTDOWN_DELAY_SECS {
            return Err(ConfigError::OutOfRange {
                name: "idle_connection_shutdown_delay_secs",
                value: self.idle_connection_shutdown_delay_secs as u64,
                min: 0,
                max: MAX_IDLE_SHUTDOWN_DELAY_SECS as u64,
            });
        }

        let keep_alive = self.keep_alive_interval_secs as u32;
        if self.idle_connection_shutdown && self.idle_connection_shutdown_delay_secs < 2 * keep_alive
        {
            return Err(ConfigError::IdleDelayTooShort {
                delay: self.idle_connection_shutdown_delay_secs,
                keep_alive,
            });
        }

        Ok(())
    }

    /// Idle timeout applied before the peer's Contact Header arrives. `None` means no timeout.
    pub(crate) fn initial_idle_timeout(&self) -> Option<Duration> {
        let secs = if self.idle_connection_shutdown {
            self.idle_connection_shutdown_delay_secs
        } else {
            2 * self.keep_alive_interval_secs as u32
        };

        (secs > 0).then(|| Duration::from_secs(secs as u64))
    }
}

/// Parameters of one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub name: String,
    /// Interface the address belongs to. Informational only.
    pub if_name: String,
    pub address: IpAddr,
    pub ipv6: bool,
    pub kind: LinkKind,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            if_name: String::new(),
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ipv6: false,
            kind: LinkKind::tcpcl(),
        }
    }
}

impl LinkConfig {
    pub fn tcpcl(name: impl Into<String>, address: IpAddr, tcp_port: u16) -> Self {
        Self {
            name: name.into(),
            address,
            ipv6: address.is_ipv6(),
            kind: LinkKind::Tcpcl {
                max_segment_size: 4500,
                tcp_port,
            },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ipv6 != self.address.is_ipv6() {
            return Err(ConfigError::AddressFamily);
        }

        if let LinkKind::Tcpcl {
            max_segment_size,
            tcp_port,
        } = self.kind
        {
            if !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&max_segment_size) {
                return Err(ConfigError::OutOfRange {
                    name: "max_segment_size",
                    value: max_segment_size as u64,
                    min: MIN_SEGMENT_SIZE as u64,
                    max: MAX_SEGMENT_SIZE as u64,
                });
            }

            if tcp_port < MIN_TCP_PORT {
                return Err(ConfigError::OutOfRange {
                    name: "tcp_port",
                    value: tcp_port as u64,
                    min: MIN_TCP_PORT as u64,
                    max: u16::MAX as u64,
                });
            }
        }

        Ok(())
    }
}
