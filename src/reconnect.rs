// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Background reconnects of the upstream link.
//!
//! The watchdog task reacts to state changes of the [`Upstream`]: whenever
//! the link is disconnected or faulted it tries to reconnect, pausing
//! between attempts as told by a [`ReconnectStrategy`].

use std::{fmt, sync::Arc, time::Duration};

use tokio::{sync::watch, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::upstream::{Upstream, UpstreamState};

/// Decides how long to wait before the next reconnect attempt.
pub trait ReconnectStrategy: fmt::Debug + Send + Sync {
    /// The delay after `attempt` consecutive failures (starting at 1),
    /// or `None` to stop trying.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Retry with a constant delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    pub delay: Duration,
    pub max_attempts: Option<u32>,
}

impl ReconnectStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        within(self.max_attempts, attempt).then_some(self.delay)
    }
}

/// Retry with a delay that doubles after each failure, up to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl ReconnectStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !within(self.max_attempts, attempt) {
            return None;
        }
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

fn within(max_attempts: Option<u32>, attempt: u32) -> bool {
    max_attempts.map_or(true, |max| attempt < max)
}

fn needs_reconnect(state: UpstreamState) -> bool {
    matches!(state, UpstreamState::Disconnected | UpstreamState::Faulted)
}

/// Keep the upstream link connected until `shutdown` is cancelled.
pub(crate) async fn watchdog(
    upstream: Arc<Upstream>,
    strategy: Arc<dyn ReconnectStrategy>,
    shutdown: CancellationToken,
) {
    let mut states = upstream.subscribe();
    loop {
        let state = *states.borrow_and_update();
        if needs_reconnect(state) {
            let reconnected = tokio::select! {
                reconnected = reconnect(&upstream, strategy.as_ref()) => reconnected,
                () = shutdown.cancelled() => break,
            };
            if reconnected {
                // The link may have faulted again in the meantime
                continue;
            }
            // Given up: wait for the next transition caused by someone else
            states.borrow_and_update();
        }
        if !wait_for_change(&mut states, &shutdown).await {
            break;
        }
    }
    log::debug!("Upstream watchdog stopped");
}

/// Returns `false` if the watchdog should stop.
async fn wait_for_change(
    states: &mut watch::Receiver<UpstreamState>,
    shutdown: &CancellationToken,
) -> bool {
    tokio::select! {
        changed = states.changed() => changed.is_ok(),
        () = shutdown.cancelled() => false,
    }
}

/// Returns `false` if the strategy gave up.
async fn reconnect(upstream: &Upstream, strategy: &dyn ReconnectStrategy) -> bool {
    let mut attempt = 0;
    while let Err(err) = upstream.ensure_connected().await {
        attempt += 1;
        let Some(delay) = strategy.next_delay(attempt) else {
            log::error!("Giving up reconnecting to upstream after {attempt} attempts: {err}");
            return false;
        };
        log::warn!("Reconnect attempt {attempt} failed, retrying in {delay:?}");
        sleep(delay).await;
    }
    if attempt > 0 {
        log::info!("Upstream reconnected after {attempt} failed attempts");
    }
    true
}
