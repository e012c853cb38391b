//! Reliable publish over the relay connection.
//!
//! Publishing waits for the relay's acknowledgement and retries transient
//! failures with exponential backoff. While the connection is down,
//! publishes are queued and flushed in FIFO order after reconnect. A
//! publish issued while older messages are still queued lines up behind
//! them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tandem_transport::{Backoff, PublishOptions, RelayRequest, RelayTransport, TransportError};

use crate::errors::RelayerError;

/// Default wait for a relay acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublisherConfig {
    pub ack_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            backoff: Backoff::default(),
        }
    }
}

/// A publish waiting for the connection to come back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedPublish {
    pub topic: String,
    pub message: String,
    pub opts: PublishOptions,
}

/// A queued publish the flush gave up on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedPublish {
    pub item: QueuedPublish,
    pub error: RelayerError,
}

/// Outcome of one [`Publisher::flush_queue`] run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed: Vec<FailedPublish>,
}

pub struct Publisher {
    transport: Arc<dyn RelayTransport>,
    config: PublisherConfig,
    queue: Mutex<VecDeque<QueuedPublish>>,
    /// Only changed while holding the queue lock
    flushing: AtomicBool,
}

enum Attempt {
    Sent,
    Disconnected,
}

impl Publisher {
    pub fn new(transport: Arc<dyn RelayTransport>, config: PublisherConfig) -> Self {
        Self {
            transport,
            config,
            queue: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
        }
    }

    /// Publish an encoded message, queueing it if the connection is down
    /// or older messages are still waiting.
    pub async fn publish(
        &self,
        topic: &str,
        message: &str,
        opts: PublishOptions,
    ) -> Result<(), RelayerError> {
        let item = QueuedPublish {
            topic: topic.to_string(),
            message: message.to_string(),
            opts,
        };

        {
            let mut queue = self.queue.lock();
            let behind = self.flushing.load(Ordering::SeqCst) || !queue.is_empty();
            if behind || !self.transport.is_connected() {
                debug!(topic = %item.topic, queued = queue.len() + 1, "publish queued");
                queue.push_back(item);
                return Ok(());
            }
        }

        match self.send(&item).await? {
            Attempt::Sent => Ok(()),
            Attempt::Disconnected => {
                self.enqueue(item);
                Ok(())
            }
        }
    }

    /// Drain the queue in FIFO order, including anything queued while the
    /// flush runs. Stops early if the connection drops again. Items that
    /// fail for any other reason are dropped and reported.
    pub async fn flush_queue(&self) -> FlushReport {
        let mut report = FlushReport::default();
        if self.flushing.swap(true, Ordering::SeqCst) {
            return report;
        }

        loop {
            let item = {
                let mut queue = self.queue.lock();
                let next = if self.transport.is_connected() {
                    queue.pop_front()
                } else {
                    None
                };
                match next {
                    Some(item) => item,
                    None => {
                        self.flushing.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            };

            match self.send(&item).await {
                Ok(Attempt::Sent) => report.flushed += 1,
                Ok(Attempt::Disconnected) => {
                    let mut queue = self.queue.lock();
                    queue.push_front(item);
                    self.flushing.store(false, Ordering::SeqCst);
                    break;
                }
                Err(error) => {
                    warn!(topic = %item.topic, error = %error, "dropping queued publish");
                    report.failed.push(FailedPublish { item, error });
                }
            }
        }

        if report.flushed > 0 || !report.failed.is_empty() {
            info!(
                flushed = report.flushed,
                failed = report.failed.len(),
                remaining = self.queue_len(),
                "flushed publish queue"
            );
        }
        report
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn queued(&self) -> Vec<QueuedPublish> {
        self.queue.lock().iter().cloned().collect()
    }

    fn enqueue(&self, item: QueuedPublish) {
        debug!(topic = %item.topic, "connection down, queueing publish");
        self.queue.lock().push_back(item);
    }

    async fn send(&self, item: &QueuedPublish) -> Result<Attempt, RelayerError> {
        let request = RelayRequest::publish(&item.topic, &item.message, &item.opts);
        let ack_timeout = self.config.ack_timeout;
        let transport = &self.transport;

        // Outer error: retry. Inner error: give up without retrying.
        let outcome = self
            .config
            .backoff
            .retry(|attempt| {
                let request = request.clone();
                async move {
                    if attempt > 0 {
                        debug!(topic = %request.topic(), attempt, "retrying publish");
                    }
                    let result = tokio::time::timeout(ack_timeout, transport.request(request))
                        .await
                        .unwrap_or(Err(TransportError::Timeout));
                    match result {
                        Ok(_) => Ok(Ok(())),
                        Err(e) if e.is_transient() => Err(e),
                        Err(e) => Ok(Err(e)),
                    }
                }
            })
            .await;

        match outcome {
            Ok(Ok(())) => Ok(Attempt::Sent),
            Ok(Err(TransportError::Disconnected)) => Ok(Attempt::Disconnected),
            Ok(Err(e)) => Err(RelayerError::Transport(e)),
            Err(exhausted) => {
                warn!(
                    topic = %item.topic,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "publish failed"
                );
                Err(RelayerError::PublishFailure {
                    topic: item.topic.clone(),
                    attempts: exhausted.attempts,
                    last_error: exhausted.last_error,
                })
            }
        }
    }
}
