//! Keeps this node's directory record fresh.
//!
//! Every `interval` the record is rewritten with a new validity deadline.
//! A publish that fails, or gets no answer within `attempt_timeout`, is
//! retried after `retry_backoff`, at most `max_attempts` times per cycle. Failures are logged and never fatal; the
//! next cycle starts over.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use meshgate_core::address::NodeAddress;

use crate::directory::{Directory, DirectoryError, PublishRecord};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub interval: Duration,
    pub validity: Duration,
    pub retry_backoff: Duration,
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            validity: Duration::from_secs(15 * 60),
            retry_backoff: Duration::from_secs(5),
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publish failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: DirectoryError },

    #[error("cancelled")]
    Cancelled,
}

pub struct Publisher {
    directory: Arc<dyn Directory>,
    address: NodeAddress,
    endpoint: String,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(
        directory: Arc<dyn Directory>,
        address: NodeAddress,
        endpoint: String,
        config: PublisherConfig,
    ) -> Self {
        Self {
            directory,
            address,
            endpoint,
            config,
        }
    }

    /// One publish cycle, with retries.
    pub async fn publish_once(&self, cancel: &CancellationToken) -> Result<PublishRecord, PublishError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let record = PublishRecord::new(self.address, self.endpoint.clone(), self.config.validity);
            let attempt_timeout = self.config.attempt_timeout;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(PublishError::Cancelled),
                r = tokio::time::timeout(attempt_timeout, self.directory.publish(record.clone())) => {
                    r.unwrap_or_else(|_| {
                        Err(DirectoryError::Unavailable(format!(
                            "no answer within {attempt_timeout:?}"
                        )))
                    })
                }
            };
            match result {
                Ok(()) => {
                    tracing::info!(
                        address = %self.address.short(),
                        endpoint = %self.endpoint,
                        attempt,
                        "node record published"
                    );
                    return Ok(record);
                }
                Err(e) if attempt >= max_attempts => {
                    return Err(PublishError::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "publish failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PublishError::Cancelled),
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                }
            }
        }
    }

    /// Publish every interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(address = %self.address, endpoint = %self.endpoint, "publisher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("publisher shutting down");
                    return;
                }
                _ = interval.tick() => {
                    match self.publish_once(&cancel).await {
                        Ok(_) | Err(PublishError::Cancelled) => {}
                        Err(e) => tracing::error!(error = %e, "publish cycle failed"),
                    }
                }
            }
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::SystemTime;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use crate::directory::MemoryDirectory;

    /// Fails the first `failures` publishes, then delegates.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        inner: MemoryDirectory,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                inner: MemoryDirectory::new(),
            }
        }
    }

    #[async_trait]
    impl Directory for Flaky {
        async fn publish(&self, record: PublishRecord) -> Result<(), DirectoryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(DirectoryError::Unavailable("down".into()));
            }
            self.inner.publish(record).await
        }

        async fn find(&self, address: &NodeAddress) -> Result<PublishRecord, DirectoryError> {
            self.inner.find(address).await
        }
    }

    /// Accepts publishes and never answers them.
    struct Hung {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Directory for Hung {
        async fn publish(&self, _record: PublishRecord) -> Result<(), DirectoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn find(&self, address: &NodeAddress) -> Result<PublishRecord, DirectoryError> {
            Err(DirectoryError::NotFound(*address))
        }
    }

    fn publisher(dir: Arc<Flaky>) -> Publisher {
        Publisher::new(
            dir,
            NodeAddress::derive(b"me"),
            "127.0.0.1:7420".into(),
            PublisherConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn three_failures_then_success() {
        let dir = Arc::new(Flaky::new(3));
        let p = publisher(dir.clone());

        let started = Instant::now();
        let wall_before = SystemTime::now();
        let record = p.publish_once(&CancellationToken::new()).await.unwrap();
        let wall_after = SystemTime::now();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
        assert_eq!(dir.calls.load(Ordering::SeqCst), 4);
        let validity = Duration::from_secs(15 * 60);
        assert!(record.valid_until >= wall_before + validity);
        assert!(record.valid_until <= wall_after + validity);
        assert_eq!(dir.find(&record.address).await.unwrap(), record);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let dir = Arc::new(Flaky::new(u32::MAX));
        let p = publisher(dir.clone());
        let err = p.publish_once(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PublishError::Exhausted { attempts: 5, .. }));
        assert_eq!(dir.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn run_republishes_every_interval() {
        let dir = Arc::new(Flaky::new(0));
        let cancel = CancellationToken::new();
        let handle = publisher(dir.clone()).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(125)).await;
        cancel.cancel();
        handle.await.unwrap();
        // ticks at 0, 60 and 120
        assert_eq!(dir.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_cycle_does_not_stop_the_loop() {
        let dir = Arc::new(Flaky::new(5));
        let cancel = CancellationToken::new();
        let handle = publisher(dir.clone()).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(65)).await;
        cancel.cancel();
        handle.await.unwrap();
        // five failed attempts in the first cycle, success in the second
        assert_eq!(dir.calls.load(Ordering::SeqCst), 6);
        assert!(dir.find(&NodeAddress::derive(b"me")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_attempts_time_out_and_retry() {
        let dir = Arc::new(Hung {
            calls: AtomicU32::new(0),
        });
        let p = Publisher::new(
            dir.clone(),
            NodeAddress::derive(b"me"),
            "127.0.0.1:7420".into(),
            PublisherConfig {
                max_attempts: 3,
                ..PublisherConfig::default()
            },
        );

        let started = Instant::now();
        let err = p.publish_once(&CancellationToken::new()).await.unwrap_err();
        // three 10 s attempts with two 5 s backoffs between them
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(40) && elapsed < Duration::from_secs(41));
        assert!(matches!(
            err,
            PublishError::Exhausted {
                attempts: 3,
                last: DirectoryError::Unavailable(_)
            }
        ));
        assert_eq!(dir.calls.load(Ordering::SeqCst), 3);
    }
}
