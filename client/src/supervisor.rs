//! Reconnect supervision
//!
//! Keeps a [`TunnelSession`] alive: waits for it to drop, then retries with
//! a linearly growing delay until the attempt limit is reached. A successful
//! reconnect resets the count.

use std::sync::Arc;
use std::time::Duration;

use hookline_shared::{Error, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::session::{wait_for_shutdown, SessionEnd, TunnelSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given (1-based) attempt. Saturates instead of overflowing.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Consecutive failed reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectCounter {
    attempts: u32,
    policy: ReconnectPolicy,
}

impl ReconnectCounter {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { attempts: 0, policy }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Count one more attempt and return the wait before it, or `None`
    /// once the limit has been reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for(self.attempts))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Requests a graceful stop of a running [`Supervisor`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

pub struct Supervisor {
    session: TunnelSession,
    counter: ReconnectCounter,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(session: TunnelSession, policy: ReconnectPolicy) -> (Self, ShutdownHandle) {
        let (tx, rx) = watch::channel(false);
        let supervisor = Self {
            session,
            counter: ReconnectCounter::new(policy),
            shutdown: rx,
        };
        (supervisor, ShutdownHandle { tx: Arc::new(tx) })
    }

    pub fn session(&self) -> &TunnelSession {
        &self.session
    }

    /// Connect and keep the tunnel up.
    ///
    /// A failed initial connect is returned as is. Afterwards this only
    /// returns on shutdown (`Ok`) or with [`Error::ReconnectExhausted`].
    pub async fn run(mut self) -> Result<()> {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut self.shutdown) => {
                self.session.disconnect().await;
                return Ok(());
            }
            result = self.session.connect() => result?,
        }
        self.counter.reset();

        loop {
            let end = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    self.session.disconnect().await;
                    return Ok(());
                }
                end = self.session.closed() => end,
            };

            match end {
                SessionEnd::Terminated => return Ok(()),
                SessionEnd::Disconnected(reason) => {
                    info!("Connection lost ({}), reconnecting", reason);
                }
            }

            if !self.reconnect().await? {
                return Ok(());
            }
        }
    }

    /// Retry until connected (`true`), shut down (`false`) or out of attempts.
    async fn reconnect(&mut self) -> Result<bool> {
        loop {
            let Some(delay) = self.counter.next_delay() else {
                error!(
                    "Max reconnection attempts reached ({}). Giving up.",
                    self.counter.max_attempts()
                );
                self.session.disconnect().await;
                return Err(Error::ReconnectExhausted(self.counter.attempts()));
            };

            warn!(
                "Attempting to reconnect in {}s... ({}/{})",
                delay.as_secs_f64(),
                self.counter.attempts(),
                self.counter.max_attempts()
            );
            self.session.begin_reconnect();

            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    self.session.disconnect().await;
                    return Ok(false);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    self.session.disconnect().await;
                    return Ok(false);
                }
                result = self.session.connect() => result,
            };

            match result {
                Ok(()) => {
                    info!("Reconnected after {} attempt(s)", self.counter.attempts());
                    self.counter.reset();
                    return Ok(true);
                }
                Err(e) => warn!("Reconnection failed: {}", e),
            }
        }
    }
}
