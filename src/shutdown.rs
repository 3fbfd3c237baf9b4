// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Idle auto-shutdown timer.
//!
//! Every intercepted request pings the timer; when no ping arrives within
//! the configured window, `expired` completes and the binary terminates the
//! process. Pinging is a single atomic store, so request handling is never
//! delayed by the timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct IdleTimer {
    started: Instant,
    /// Milliseconds since `started` of the most recent ping.
    last_ping: AtomicU64,
    timeout: Option<Duration>,
}

impl IdleTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            last_ping: AtomicU64::new(0),
            timeout: Some(timeout),
        }
    }

    /// A timer that never fires, for deployments without auto-shutdown.
    pub fn disabled() -> Self {
        Self {
            started: Instant::now(),
            last_ping: AtomicU64::new(0),
            timeout: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.timeout.is_some()
    }

    /// Reset the idle countdown.
    pub fn ping(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_ping.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let last = self.last_ping.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.saturating_sub(last))
    }

    /// Completes once the idle window elapses without a ping. Pends forever
    /// when the timer is disabled.
    pub async fn expired(&self) {
        let Some(timeout) = self.timeout else {
            return std::future::pending::<()>().await;
        };
        loop {
            let idle = self.idle_for();
            if idle >= timeout {
                return;
            }
            tokio::time::sleep(timeout - idle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn expires_after_quiet_window() {
        let timer = IdleTimer::new(Duration::from_millis(50));
        tokio::time::timeout(Duration::from_secs(2), timer.expired())
            .await
            .expect("timer must fire");
    }

    #[tokio::test]
    async fn pings_extend_the_countdown_indefinitely() {
        let timer = std::sync::Arc::new(IdleTimer::new(Duration::from_millis(100)));

        let pinger = {
            let timer = timer.clone();
            tokio::spawn(async move {
                for _ in 0..6 {
                    sleep(Duration::from_millis(40)).await;
                    timer.ping();
                }
            })
        };

        // While pings keep arriving the timer must not fire.
        let fired_early = tokio::time::timeout(Duration::from_millis(220), timer.expired())
            .await
            .is_ok();
        assert!(!fired_early, "timer fired while requests were arriving");

        pinger.await.expect("pinger task");

        // Once pings stop, the timer fires within the window.
        tokio::time::timeout(Duration::from_secs(2), timer.expired())
            .await
            .expect("timer must fire after pings stop");
    }

    #[tokio::test]
    async fn disabled_timer_never_fires() {
        let timer = IdleTimer::disabled();
        assert!(!timer.is_enabled());
        let fired = tokio::time::timeout(Duration::from_millis(100), timer.expired())
            .await
            .is_ok();
        assert!(!fired);
    }
}
