// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A simulated Modbus device and helpers for driving a gateway.

use std::{net::SocketAddr, time::Duration};

use futures::{SinkExt as _, StreamExt as _};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
};
use tokio_util::codec::Framed;

use modbus_tcp_gateway::{
    codec::tcp::FrameCodec, Config, FixedDelay, Frame, Gateway, Header, UpstreamConfig,
};

/// The device answers every request with its transaction id and unit id as
/// register values, so that a client can tell whose response it received.
pub fn device_response(request: &Frame) -> Frame {
    let [tid_hi, tid_lo] = request.hdr.transaction_id.to_be_bytes();
    let function = request.function_code().unwrap_or_default();
    Frame::new(
        request.hdr,
        vec![function, 0x04, tid_hi, tid_lo, 0x00, request.hdr.unit_id],
    )
}

pub fn read_holding_registers(transaction_id: u16, unit_id: u8) -> Frame {
    Frame::new(
        Header {
            transaction_id,
            unit_id,
        },
        vec![0x03, 0x00, 0x00, 0x00, 0x02],
    )
}

/// Serve connections like a Modbus device until the task is aborted.
pub async fn serve_device(listener: TcpListener) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(handle_device_connection(stream));
    }
}

async fn handle_device_connection(stream: TcpStream) {
    let mut framed = Framed::new(stream, FrameCodec::default());
    while let Some(Ok(request)) = framed.next().await {
        if framed.send(device_response(&request)).await.is_err() {
            return;
        }
    }
}

pub async fn spawn_device() -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    Ok((addr, tokio::spawn(serve_device(listener))))
}

pub fn gateway_config(device_addr: SocketAddr) -> Config {
    Config {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        upstream: UpstreamConfig {
            host: device_addr.ip().to_string(),
            port: device_addr.port(),
            connect_timeout: Duration::from_secs(1),
            settle_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(1),
        },
        reconnect: std::sync::Arc::new(FixedDelay {
            delay: Duration::from_millis(50),
            max_attempts: None,
        }),
        ..Default::default()
    }
}

pub struct RunningGateway {
    pub addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<modbus_tcp_gateway::Result<()>>,
}

impl RunningGateway {
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let gateway = Gateway::new(config)?;
        let listener = gateway.bind()?;
        let addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(gateway.serve_until(listener, async move {
            shutdown_rx.await.ok();
        }));
        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.send(()).ok();
        tokio::time::timeout(Duration::from_secs(5), self.task).await???;
        Ok(())
    }
}

pub struct Client {
    framed: Framed<TcpStream, FrameCodec>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, FrameCodec::default()),
        })
    }

    /// Send a request and wait for the response, `None` if the gateway
    /// closed the connection.
    pub async fn call(&mut self, request: Frame) -> anyhow::Result<Option<Frame>> {
        self.framed.send(request).await?;
        let response = tokio::time::timeout(Duration::from_secs(5), self.framed.next()).await?;
        Ok(response.transpose()?)
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.framed.get_mut()
    }

    /// Wait until the gateway closes the connection.
    pub async fn closed(mut self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(5), self.framed.next()).await,
            Ok(None | Some(Err(_)))
        )
    }
}
