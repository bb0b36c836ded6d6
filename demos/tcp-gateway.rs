// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # TCP gateway example
//!
//! Forwards the requests of all clients connecting to the listen address to
//! a single Modbus TCP device until Ctrl-C is pressed.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example tcp-gateway -- 0.0.0.0:5020 192.168.1.100:502
//! ```

use std::net::SocketAddr;

use modbus_tcp_gateway::{Config, Gateway, UpstreamConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let listen_addr: SocketAddr = args.next().as_deref().unwrap_or("127.0.0.1:5020").parse()?;
    let device_addr: SocketAddr = args.next().as_deref().unwrap_or("127.0.0.1:502").parse()?;

    let config = Config {
        listen_addr,
        upstream: UpstreamConfig {
            host: device_addr.ip().to_string(),
            port: device_addr.port(),
            ..Default::default()
        },
        ..Default::default()
    };
    let gateway = Gateway::new(config)?;
    let listener = gateway.bind()?;
    println!("Forwarding {} to {device_addr}", listener.local_addr()?);

    gateway
        .serve_until(listener, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                eprintln!("Failed to listen for Ctrl-C: {err}");
            }
        })
        .await?;
    Ok(())
}
