// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP gateway server

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::tcp::FrameCodec,
    config::Config,
    queue::{self, SessionId},
    reconnect,
    session::Session,
    upstream::Upstream,
    worker::WorkerPool,
    Result,
};

/// Pause after a failed `accept()`, e.g. when running out of file descriptors.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// A gateway that forwards the requests of many clients to one device.
#[derive(Debug)]
pub struct Gateway {
    config: Config,
}

impl Gateway {
    /// Create a gateway from a finished configuration.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] for values the gateway cannot run with.
    pub fn new(config: Config) -> Result<Self> {
        config.check()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open the listening socket at the configured address.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(&self) -> io::Result<TcpListener> {
        listener(self.config.listen_addr)
    }

    /// Bind and serve forever.
    pub async fn run(self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Serve clients accepted by `listener` forever.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Serve clients accepted by `listener` until `shutdown_signal` resolves.
    ///
    /// On shutdown all client connections are closed, the workers finish
    /// their current requests and the upstream connection is closed.
    pub async fn serve_until<Sd>(self, listener: TcpListener, shutdown_signal: Sd) -> Result<()>
    where
        Sd: Future<Output = ()>,
    {
        let Self { config } = self;
        let (queue, receiver) = queue::bounded(config.max_queue_size);
        let upstream = Arc::new(Upstream::new(
            config.upstream.clone(),
            config.max_pdu_size,
        ));
        let workers = WorkerPool::spawn(config.max_workers, receiver, Arc::clone(&upstream));
        let stop_watchdog = CancellationToken::new();
        let watchdog = tokio::spawn(reconnect::watchdog(
            Arc::clone(&upstream),
            Arc::clone(&config.reconnect),
            stop_watchdog.clone(),
        ));
        let connections = Arc::new(Semaphore::new(
            config.max_connections.unwrap_or(Semaphore::MAX_PERMITS),
        ));
        let codec = FrameCodec::new(config.max_pdu_size);

        log::info!(
            "Gateway listening on {}, forwarding to {}:{}",
            listener.local_addr()?,
            config.upstream.host,
            config.upstream.port
        );

        let mut sessions = JoinSet::new();
        let mut last_session_id: SessionId = 0;
        tokio::pin!(shutdown_signal);
        loop {
            tokio::select! {
                () = &mut shutdown_signal => {
                    log::trace!("Shutdown signal received");
                    break;
                }
                Some(res) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = res {
                        log::error!("Session task failed: {err}");
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            log::error!("Failed to accept connection: {err}");
                            tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                            continue;
                        }
                    };
                    let Some(permit) = admit(&config, &connections, peer) else {
                        continue;
                    };
                    if let Err(err) = stream.set_nodelay(true) {
                        log::debug!("Failed to set TCP_NODELAY for {peer}: {err}");
                    }
                    last_session_id += 1;
                    let session = Session::new(
                        last_session_id,
                        peer,
                        stream,
                        codec,
                        queue.clone(),
                        config.session,
                    );
                    sessions.spawn(serve_session(session, permit));
                }
            }
        }

        log::info!("Shutting down, closing {} client connection(s)", sessions.len());
        sessions.shutdown().await;
        drop(queue);
        workers.shutdown().await;
        stop_watchdog.cancel();
        if let Err(err) = watchdog.await {
            log::error!("Upstream watchdog failed: {err}");
        }
        upstream.close().await;
        log::info!("Gateway stopped");
        Ok(())
    }
}

/// Check whether a new connection may be served.
///
/// The returned permit must be held for the lifetime of the session.
fn admit(
    config: &Config,
    connections: &Arc<Semaphore>,
    peer: SocketAddr,
) -> Option<OwnedSemaphorePermit> {
    if !config.is_allowed(peer.ip()) {
        log::warn!("Connection from {peer} not allowed, closing");
        return None;
    }
    match Arc::clone(connections).try_acquire_owned() {
        Ok(permit) => Some(permit),
        Err(_) => {
            log::warn!(
                "Maximum number of connections ({}) reached, rejecting {peer}",
                config.max_connections.unwrap_or(Semaphore::MAX_PERMITS)
            );
            None
        }
    }
}

async fn serve_session(session: Session<TcpStream>, permit: OwnedSemaphorePermit) {
    // Errors have already been logged by the session
    _ = session.run().await;
    drop(permit);
}

/// Start TCP listener - configure and open TCP socket
fn listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}
