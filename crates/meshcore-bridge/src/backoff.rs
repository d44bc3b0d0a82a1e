//! Reconnect supervision shared by the serial and bus links
//!
//! Each link owns one [`Reconnector`]. It drives the link through
//! `Disconnected → Connecting → Connected`, falling back to `BackingOff`
//! with an exponentially growing, capped delay after each failure. The
//! state is published on a `watch` channel so other components can observe
//! it without being able to change it.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ReconnectConfig;
use crate::error::Result;

/// Connection state for a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Successfully connected
    Connected,
    /// Waiting before the next attempt
    BackingOff,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::BackingOff => write!(f, "backing off"),
        }
    }
}

/// Doubling delay with a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    /// Create a backoff starting at `base` and capped at `ceiling`
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(base);
        Self {
            base,
            ceiling,
            current: base,
            failures: 0,
        }
    }

    /// Build from reconnect configuration
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.initial_delay, config.max_delay)
    }

    /// Record a failure and return how long to wait before retrying
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.failures = self.failures.saturating_add(1);
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    /// Return to the base delay after a successful connect
    pub fn reset(&mut self) {
        self.current = self.base;
        self.failures = 0;
    }

    /// Delay the next failure will wait
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Per-link connection supervisor
#[derive(Debug)]
pub struct Reconnector {
    link: &'static str,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
}

impl Reconnector {
    /// Create a supervisor in the `Disconnected` state
    pub fn new(link: &'static str, config: &ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            link,
            backoff: Backoff::from_config(config),
            state,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Consecutive failures since the last successful connect
    pub fn failures(&self) -> u32 {
        self.backoff.failures()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Retry `attempt` until it succeeds or `cancel` fires
    ///
    /// Returns `None` only on cancellation.
    pub async fn establish<T, F, Fut>(
        &mut self,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            if cancel.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                return None;
            }

            self.set_state(ConnectionState::Connecting);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return None;
                }
                result = attempt() => result,
            };

            match result {
                Ok(connection) => {
                    if self.backoff.failures() > 0 {
                        info!(
                            link = self.link,
                            failures = self.backoff.failures(),
                            "Reconnected after failures"
                        );
                    }
                    self.backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    return Some(connection);
                }
                Err(e) => {
                    warn!(
                        link = self.link,
                        failures = self.backoff.failures() + 1,
                        delay = ?self.backoff.current(),
                        error = %e,
                        "Connection attempt failed"
                    );
                    if !self.back_off(cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Wait out the next backoff delay
    ///
    /// Returns `false` if `cancel` fired during the wait.
    pub async fn back_off(&mut self, cancel: &CancellationToken) -> bool {
        self.set_state(ConnectionState::BackingOff);
        let delay = self.backoff.next_delay();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.set_state(ConnectionState::Disconnected);
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Record that an established connection was lost or closed
    pub fn mark_disconnected(&self) {
        self.set_state(ConnectionState::Disconnected);
    }
}
