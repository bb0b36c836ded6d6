// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gateway settings.
//!
//! Loading and validating configuration files is left to the application.
//! The gateway consumes a finished [`Config`].

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::sync::Semaphore;

use crate::{
    frame::MAX_PDU_SIZE,
    reconnect::{ExponentialBackoff, ReconnectStrategy},
    Error, Result,
};

/// The well-known Modbus TCP port.
pub const DEFAULT_PORT: u16 = 502;

/// Connection to the Modbus device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,

    /// Maximum time for establishing the TCP connection.
    pub connect_timeout: Duration,

    /// Grace period after connecting before the first request is sent.
    pub settle_delay: Duration,

    /// Maximum time to wait for the response of a forwarded request.
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// What a session does when the request queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnQueueFull {
    /// Answer with a _Server Device Busy_ exception and keep the connection.
    #[default]
    RespondBusy,

    /// Close the client connection.
    Disconnect,
}

/// Client session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long a session waits for the response to a dispatched request.
    pub timeout: Duration,

    pub on_queue_full: OnQueueFull,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            on_queue_full: OnQueueFull::default(),
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub upstream: UpstreamConfig,
    pub session: SessionConfig,

    /// Capacity of the request queue.
    pub max_queue_size: usize,

    /// Number of workers draining the request queue.
    pub max_workers: usize,

    /// Largest PDU accepted from clients and from the device.
    pub max_pdu_size: usize,

    /// Peers that may connect. Empty allows everyone.
    pub allowed_ips: Vec<IpAddr>,

    /// Upper bound of concurrent client sessions. `None` for no limit.
    pub max_connections: Option<usize>,

    /// Delays between background reconnect attempts.
    pub reconnect: Arc<dyn ReconnectStrategy>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_PORT),
            upstream: UpstreamConfig::default(),
            session: SessionConfig::default(),
            max_queue_size: 100,
            max_workers: 1,
            max_pdu_size: MAX_PDU_SIZE,
            allowed_ips: Vec::new(),
            max_connections: None,
            reconnect: Arc::new(ExponentialBackoff::default()),
        }
    }
}

impl Config {
    /// Reject values the gateway cannot run with.
    pub(crate) fn check(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(Error::InvalidConfig("max_queue_size must be at least 1"));
        }
        if self.max_workers == 0 {
            return Err(Error::InvalidConfig("max_workers must be at least 1"));
        }
        if self.max_pdu_size == 0 || self.max_pdu_size > MAX_PDU_SIZE {
            return Err(Error::InvalidConfig(
                "max_pdu_size must be between 1 and 253",
            ));
        }
        if let Some(max_connections) = self.max_connections {
            if max_connections == 0 || max_connections > Semaphore::MAX_PERMITS {
                return Err(Error::InvalidConfig("max_connections is out of range"));
            }
        }
        Ok(())
    }

    /// IPv4-mapped IPv6 addresses match their IPv4 counterpart, both as
    /// peer and as list entry.
    pub(crate) fn is_allowed(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.allowed_ips.is_empty()
            || self
                .allowed_ips
                .iter()
                .any(|allowed| allowed.to_canonical() == ip)
    }
}
