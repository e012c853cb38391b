//! Process-wide periodic pulse.
//!
//! Components needing periodic work subscribe to the heartbeat instead of
//! running their own timers.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default pulse interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

const EVENT_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatEvent {
    Pulse,
}

pub struct Heartbeat {
    interval: Duration,
    events: broadcast::Sender<HeartbeatEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            interval,
            events,
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.events.subscribe()
    }

    /// Start the periodic pulse. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let events = self.events.clone();
        let interval = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = events.send(HeartbeatEvent::Pulse);
            }
        }));
        debug!(interval_ms = interval.as_millis() as u64, "heartbeat started");
    }

    /// Emit one pulse immediately.
    pub fn pulse(&self) {
        let _ = self.events.send(HeartbeatEvent::Pulse);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("heartbeat stopped");
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pulses_on_interval() {
        let heartbeat = Heartbeat::new(Duration::from_secs(5));
        let mut pulses = heartbeat.subscribe();
        heartbeat.start();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(pulses.recv().await.unwrap(), HeartbeatEvent::Pulse);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(pulses.recv().await.unwrap(), HeartbeatEvent::Pulse);
        heartbeat.stop();
    }

    #[tokio::test]
    async fn test_manual_pulse() {
        let heartbeat = Heartbeat::new(DEFAULT_HEARTBEAT_INTERVAL);
        let mut pulses = heartbeat.subscribe();
        heartbeat.pulse();
        assert_eq!(pulses.try_recv().unwrap(), HeartbeatEvent::Pulse);
    }
}
