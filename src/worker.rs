// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workers forwarding queued requests to the upstream device.
//!
//! [`Upstream::send_and_receive`] serializes all traffic on the single
//! socket. Additional workers therefore do not add parallel transactions,
//! they only allow more requests to wait for the link at the same time.

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::{
    queue::{PendingRequest, RequestReceiver},
    upstream::Upstream,
};

/// A fixed number of workers draining the request queue.
#[derive(Debug)]
pub struct WorkerPool {
    workers: JoinSet<()>,
    queue: RequestReceiver,
}

impl WorkerPool {
    /// Start `count` workers.
    #[must_use]
    pub fn spawn(count: usize, queue: RequestReceiver, upstream: Arc<Upstream>) -> Self {
        let mut workers = JoinSet::new();
        for _ in 0..count {
            workers.spawn(run(queue.clone(), Arc::clone(&upstream)));
        }
        log::debug!("Started {count} worker(s)");
        Self { workers, queue }
    }

    /// Stop dequeueing and wait until every worker has finished its
    /// current request.
    pub async fn shutdown(mut self) {
        self.queue.close();
        while let Some(res) = self.workers.join_next().await {
            if let Err(err) = res {
                log::error!("Worker failed: {err}");
            }
        }
        log::debug!("All workers stopped");
    }
}

async fn run(queue: RequestReceiver, upstream: Arc<Upstream>) {
    while let Some(request) = queue.dequeue().await {
        process(&upstream, request).await;
    }
}

async fn process(upstream: &Upstream, request: PendingRequest) {
    if request.is_abandoned() {
        log::warn!(
            "Session {} abandoned transaction {} before processing, discarding",
            request.session_id,
            request.frame.hdr.transaction_id
        );
        return;
    }
    log::trace!(
        "Processing transaction {} of session {} after {:?} in queue",
        request.frame.hdr.transaction_id,
        request.session_id,
        request.enqueued_at.elapsed()
    );

    let result = match upstream.ensure_connected().await {
        Ok(()) => upstream.send_and_receive(&request.frame).await,
        Err(err) => Err(err),
    };

    let session_id = request.session_id;
    let transaction_id = request.frame.hdr.transaction_id;
    if !request.fulfil(result) {
        log::debug!(
            "Session {session_id} stopped waiting for transaction {transaction_id}, response discarded"
        );
    }
}
