// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test to demonstrate that the gateway properly disconnects clients when stopped

#[allow(unused)]
mod device;

use std::time::Duration;

use tokio::{net::TcpStream, time::timeout};

use device::{gateway_config, read_holding_registers, spawn_device, Client, RunningGateway};

#[tokio::test]
async fn shutdown_disconnects_clients() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let (device_addr, _device) = spawn_device().await?;
    let gateway = RunningGateway::start(gateway_config(device_addr)).await?;
    let addr = gateway.addr;

    let mut client = Client::connect(addr).await?;
    assert!(client.call(read_holding_registers(1, 1)).await?.is_some());
    let idle = Client::connect(addr).await?;

    gateway.stop().await?;

    // Both the active and the idle client have been disconnected
    let result = client.call(read_holding_registers(2, 1)).await;
    assert!(matches!(result, Ok(None) | Err(_)));
    assert!(idle.closed().await);

    // The listener is gone
    let reconnect = timeout(Duration::from_secs(1), TcpStream::connect(addr)).await;
    assert!(!matches!(reconnect, Ok(Ok(_))));
    Ok(())
}

#[tokio::test]
async fn shutdown_without_reachable_device() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    // Grab a free port and release it again
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let device_addr = listener.local_addr()?;
    drop(listener);

    let gateway = RunningGateway::start(gateway_config(device_addr)).await?;
    let mut client = Client::connect(gateway.addr).await?;
    let response = client
        .call(read_holding_registers(1, 1))
        .await?
        .expect("response");
    assert_eq!(&response.pdu[..], &[0x83, 0x0A]);

    gateway.stop().await
}
