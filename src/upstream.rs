// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The single persistent connection to the Modbus device.
//!
//! All traffic towards the device passes through [`Upstream`]. Access to the
//! socket is serialized by a fair (FIFO) mutex: at most one transaction is
//! on the wire at any time and waiting callers are served in arrival order.

use std::{fmt, io, time::Duration};

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::{
    net::TcpStream,
    sync::{watch, Mutex},
    time::{sleep, timeout},
};
use tokio_util::codec::Framed;

use crate::{
    codec::tcp::FrameCodec,
    config::UpstreamConfig,
    frame::{Frame, HexDump},
    Error, Result,
};

/// Connection state of the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

impl fmt::Display for UpstreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Faulted => "faulted",
        };
        f.write_str(state)
    }
}

/// Manager of the upstream connection.
#[derive(Debug)]
pub struct Upstream {
    config: UpstreamConfig,
    codec: FrameCodec,
    link: Mutex<Option<Framed<TcpStream, FrameCodec>>>,
    state: watch::Sender<UpstreamState>,
}

impl Upstream {
    #[must_use]
    pub fn new(config: UpstreamConfig, max_pdu_size: usize) -> Self {
        let (state, _) = watch::channel(UpstreamState::Disconnected);
        Self {
            config,
            codec: FrameCodec::new(max_pdu_size),
            link: Mutex::new(None),
            state,
        }
    }

    /// The current state of the link.
    #[must_use]
    pub fn state(&self) -> UpstreamState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<UpstreamState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: UpstreamState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::trace!("Upstream state: {previous} -> {state}");
        }
    }

    /// Make sure the link is connected, opening a new socket if required.
    ///
    /// A single attempt is made; retrying is up to the caller.
    pub async fn ensure_connected(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            return Ok(());
        }
        self.set_state(UpstreamState::Connecting);
        match self.connect().await {
            Ok(framed) => {
                *link = Some(framed);
                self.set_state(UpstreamState::Connected);
                Ok(())
            }
            Err(err) => {
                log::warn!(
                    "Failed to connect to upstream {}:{}: {err}",
                    self.config.host,
                    self.config.port
                );
                self.set_state(UpstreamState::Faulted);
                Err(Error::UpstreamUnavailable(err))
            }
        }
    }

    async fn connect(&self) -> io::Result<Framed<TcpStream, FrameCodec>> {
        let addr = (self.config.host.as_str(), self.config.port);
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", self.config.connect_timeout),
                )
            })??;
        stream.set_nodelay(true)?;
        log::info!(
            "Connected to upstream {}:{} ({})",
            self.config.host,
            self.config.port,
            stream.peer_addr()?
        );
        // Some devices drop requests that arrive right after the handshake
        if !self.config.settle_delay.is_zero() {
            sleep(self.config.settle_delay).await;
        }
        Ok(Framed::new(stream, self.codec))
    }

    /// Forward a request and wait for the matching response.
    ///
    /// On timeout or any I/O error the socket is discarded and the link is
    /// marked as faulted. The request is not retried.
    pub async fn send_and_receive(&self, request: &Frame) -> Result<Frame> {
        let mut link = self.link.lock().await;
        let Some(framed) = link.as_mut() else {
            return Err(Error::UpstreamUnavailable(io::Error::new(
                io::ErrorKind::NotConnected,
                "upstream is not connected",
            )));
        };

        let request_timeout = self.config.request_timeout;
        let err = match timeout(request_timeout, transact(framed, request)).await {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(err)) => Error::Upstream(err),
            Err(_) => Error::UpstreamTimeout(request_timeout),
        };
        log::error!(
            "Upstream transaction {} failed: {err}",
            request.hdr.transaction_id
        );
        *link = None;
        self.set_state(UpstreamState::Faulted);
        Err(err)
    }

    /// Close the socket, if any.
    pub async fn close(&self) {
        let mut link = self.link.lock().await;
        if link.take().is_some() {
            log::info!("Upstream connection closed");
        }
        self.set_state(UpstreamState::Disconnected);
    }
}

async fn transact(
    framed: &mut Framed<TcpStream, FrameCodec>,
    request: &Frame,
) -> io::Result<Frame> {
    // Stale bytes from an earlier, abandoned exchange must not be
    // mistaken for the response.
    framed.read_buffer_mut().clear();

    if log::log_enabled!(log::Level::Debug) {
        log::debug!("Sending request: {}", HexDump(&encoded(request)));
    }
    framed.send(request.clone()).await.map_err(into_io_error)?;
    let response = framed
        .next()
        .await
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed the connection",
            )
        })?
        .map_err(into_io_error)?;
    if log::log_enabled!(log::Level::Debug) {
        log::debug!("Received response: {}", HexDump(&encoded(&response)));
    }

    verify_response_header(request, &response)?;
    Ok(response)
}

fn encoded(frame: &Frame) -> bytes::BytesMut {
    let mut buf = bytes::BytesMut::new();
    crate::codec::tcp::encode(frame, &mut buf);
    buf
}

fn into_io_error(err: Error) -> io::Error {
    match err {
        Error::Io(err) => err,
        err => io::Error::new(io::ErrorKind::InvalidData, err),
    }
}

/// Check that the response belongs to the request.
///
/// # Errors
///
/// If the headers differ, an [`io::Error`] will be returned with [`io::ErrorKind::InvalidData`].
fn verify_response_header(request: &Frame, response: &Frame) -> io::Result<()> {
    if request.hdr != response.hdr {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Invalid response header: expected/request = {:?}, actual/response = {:?}",
                request.hdr, response.hdr
            ),
        ));
    }
    Ok(())
}
