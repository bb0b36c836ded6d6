// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A [Modbus TCP](https://en.wikipedia.org/wiki/Modbus) gateway
//! based on [tokio](https://tokio.rs).
//!
//! Many Modbus TCP clients may connect to the gateway concurrently. Their
//! requests are queued and forwarded one at a time over a single persistent
//! connection to the target device, which typically accepts only one
//! outstanding transaction. Each response is routed back to the client that
//! sent the request, with the transaction id echoed verbatim.
//!
//! The gateway does not interpret the PDU. Failures are reported to the
//! client as Modbus exception responses:
//!
//! - _Server Device Busy_ (0x06) if the request queue is full
//! - _Gateway Path Unavailable_ (0x0A) if the device cannot be reached
//! - _Gateway Target Device Failed to Respond_ (0x0B) if a transaction
//!   fails or times out
//!
//! Log records are emitted through the [`log`](https://docs.rs/log) facade.
//! Installing a logger is up to the application.
//!
//! ## Example
//!
//! ```no_run
//! use modbus_tcp_gateway::{Config, Gateway, UpstreamConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         listen_addr: "0.0.0.0:5020".parse()?,
//!         upstream: UpstreamConfig {
//!             host: "192.168.1.100".to_owned(),
//!             ..Default::default()
//!         },
//!         ..Default::default()
//!     };
//!     Gateway::new(config)?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod frame;
pub mod queue;
pub mod reconnect;
pub mod server;
pub mod upstream;
pub mod worker;

mod error;
mod session;

pub use self::{
    config::{Config, OnQueueFull, SessionConfig, UpstreamConfig},
    error::{Error, FrameError},
    frame::{ExceptionCode, Frame, Header},
    reconnect::{ExponentialBackoff, FixedDelay, ReconnectStrategy},
    server::Gateway,
    upstream::{Upstream, UpstreamState},
};

/// Specialized [`std::result::Result`] type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;
