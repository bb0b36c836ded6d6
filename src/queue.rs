// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded FIFO of requests waiting for the upstream link.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot, Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{frame::Frame, Error, Result};

/// Identifies the client session a request originates from.
pub type SessionId = u64;

/// A request on its way from a client session to the upstream device.
#[derive(Debug)]
pub struct PendingRequest {
    pub session_id: SessionId,
    pub frame: Frame,
    pub enqueued_at: Instant,
    response_tx: oneshot::Sender<Result<Frame>>,
}

impl PendingRequest {
    /// Create a request together with the slot its response is delivered to.
    #[must_use]
    pub fn new(session_id: SessionId, frame: Frame) -> (Self, ResponseSlot) {
        let (response_tx, response_rx) = oneshot::channel();
        let request = Self {
            session_id,
            frame,
            enqueued_at: Instant::now(),
            response_tx,
        };
        (request, ResponseSlot(response_rx))
    }

    /// The session stopped waiting for the response.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.response_tx.is_closed()
    }

    /// Deliver the outcome to the waiting session.
    ///
    /// Returns `false` if nobody is waiting anymore, in which case the
    /// result is dropped.
    pub fn fulfil(self, result: Result<Frame>) -> bool {
        self.response_tx.send(result).is_ok()
    }
}

/// Receiving end of a [`PendingRequest`].
///
/// Dropping the slot abandons the request.
#[derive(Debug)]
pub struct ResponseSlot(oneshot::Receiver<Result<Frame>>);

impl Future for ResponseSlot {
    type Output = Result<Frame>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // The sender is only dropped without a result if the worker pool stops
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| Err(Error::ShuttingDown)))
    }
}

/// Create a request queue with the given capacity.
///
/// # Panics
///
/// Panics if `capacity` is `0`.
#[must_use]
pub fn bounded(capacity: usize) -> (RequestQueue, RequestReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let rx = RequestReceiver {
        rx: Arc::new(Mutex::new(rx)),
        shutdown: CancellationToken::new(),
    };
    (RequestQueue { tx }, rx)
}

/// Enqueueing side, shared by all client sessions.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    tx: mpsc::Sender<PendingRequest>,
}

impl RequestQueue {
    /// Append a request without waiting.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::QueueFull`] if the queue is at capacity and with
    /// [`Error::ShuttingDown`] if no workers are left to process it.
    pub fn try_enqueue(&self, request: PendingRequest) -> Result<()> {
        self.tx.try_send(request).map_err(|err| match err {
            TrySendError::Full(_) => Error::QueueFull,
            TrySendError::Closed(_) => Error::ShuttingDown,
        })
    }

    /// Number of queued requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Dequeueing side, shared by all workers.
#[derive(Debug, Clone)]
pub struct RequestReceiver {
    rx: Arc<Mutex<mpsc::Receiver<PendingRequest>>>,
    shutdown: CancellationToken,
}

impl RequestReceiver {
    /// Wait for the next request.
    ///
    /// Returns `None` once [`close()`](Self::close) has been called or
    /// all senders are gone.
    pub async fn dequeue(&self) -> Option<PendingRequest> {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            request = async { self.rx.lock().await.recv().await } => request,
        }
    }

    /// Wake up all waiting workers.
    ///
    /// Requests still queued are failed with [`Error::ShuttingDown`] once
    /// the last receiver has been dropped.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}
