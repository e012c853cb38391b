//! Connection state management and retry backoff.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Tracks the relay connection state and reconnect statistics.
pub struct ConnectionManager {
    state: Mutex<ConnectionState>,
    connected_at: Mutex<Option<Instant>>,
    reconnects: AtomicU32,
}

impl ConnectionManager {
    /// Create a new connection manager
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            connected_at: Mutex::new(None),
            reconnects: AtomicU32::new(0),
        }
    }

    /// Transition to new state, returning the previous one.
    pub fn transition(&self, new_state: ConnectionState) -> ConnectionState {
        let mut state = self.state.lock();
        let old_state = *state;

        match new_state {
            ConnectionState::Connected => {
                if old_state == ConnectionState::Reconnecting {
                    self.reconnects.fetch_add(1, Ordering::SeqCst);
                }
                *self.connected_at.lock() = Some(Instant::now());
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                *self.connected_at.lock() = None;
            }
            ConnectionState::Connecting => {}
        }

        *state = new_state;
        old_state
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Time since the current connection was established.
    pub fn duration(&self) -> Option<Duration> {
        self.connected_at.lock().map(|t| t.elapsed())
    }

    /// Number of completed reconnections.
    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Retries exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl Backoff {
    /// Create a new backoff policy
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay to wait after the given (zero-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * 2.0_f64.powi(attempt.min(31) as i32);
        let delay = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(delay)
    }

    /// Run `op` until it succeeds or the attempts run out.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, Exhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(Exhausted {
                            attempts: attempt,
                            last_error: e,
                        });
                    }
                    tokio::time::sleep(self.delay(attempt - 1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_state_transitions() {
        let mgr = ConnectionManager::new();
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        mgr.transition(ConnectionState::Connecting);
        mgr.transition(ConnectionState::Connected);
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert!(mgr.duration().is_some());
        assert_eq!(mgr.reconnects(), 0);

        mgr.transition(ConnectionState::Reconnecting);
        assert!(mgr.duration().is_none());
        mgr.transition(ConnectionState::Connected);
        assert_eq!(mgr.reconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let backoff = Backoff::new(3, Duration::from_millis(10), Duration::from_millis(100));
        let result: Result<(), Exhausted<&str>> = backoff.retry(|_| async { Err("nope") }).await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error, "nope");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_later_attempt() {
        let backoff = Backoff::new(5, Duration::from_millis(10), Duration::from_millis(100));
        let result: Result<u32, Exhausted<&str>> = backoff
            .retry(|attempt| async move {
                if attempt < 2 {
                    Err("transient")
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result, Ok(2));
    }

    proptest! {
        #[test]
        fn prop_backoff_is_capped_and_monotonic(
            base_ms in 1u64..1_000,
            max_ms in 1u64..60_000,
            attempt in 0u32..64
        ) {
            let backoff = Backoff::new(10, Duration::from_millis(base_ms), Duration::from_millis(max_ms));
            let d = backoff.delay(attempt);
            prop_assert!(d <= Duration::from_millis(max_ms) + Duration::from_micros(1));
            prop_assert!(backoff.delay(attempt + 1) >= d);
        }
    }
}
