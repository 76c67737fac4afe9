//! Scheduling pool
//!
//! A bounded worker pool with per-target circuit breakers and named
//! broadcast groups. The executor routes every SEND through
//! [`SchedulingPool::send`]; operation handlers may schedule arbitrary work
//! with [`SchedulingPool::schedule`].

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dsl::Value;

use crate::types::SchedulerError;

pub mod broadcast;
pub mod circuit_breaker;

pub use broadcast::{BroadcastGroup, Subscription};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitOpenError, CircuitState,
};

use broadcast::BroadcastRegistry;

/// Scheduling pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Work items allowed to run at once
    pub max_workers: usize,
    /// How long work may wait for a free worker, and how long RECEIVE waits
    #[serde(with = "humantime_serde")]
    pub scheduling_timeout: Duration,
    /// Messages buffered per broadcast group
    pub broadcast_capacity: usize,
    /// Idle lifetime of groups created on behalf of a run
    #[serde(with = "humantime_serde")]
    pub group_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            scheduling_timeout: Duration::from_secs(30),
            broadcast_capacity: 256,
            group_ttl: Duration::from_secs(300),
        }
    }
}

/// Circuit breaker option for one scheduled item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerOption {
    pub target: String,
    pub config: CircuitBreakerConfig,
}

/// Options for [`SchedulingPool::schedule`]
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub circuit_breaker: Option<BreakerOption>,
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl ScheduleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track failures of this work against `target`
    pub fn with_circuit_breaker(
        mut self,
        target: impl Into<String>,
        max_failures: u32,
        cooldown: Duration,
    ) -> Self {
        self.circuit_breaker = Some(BreakerOption {
            target: target.into(),
            config: CircuitBreakerConfig {
                failure_threshold: max_failures,
                cooldown,
                ..CircuitBreakerConfig::default()
            },
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Awaitable result of scheduled work
#[derive(Debug)]
pub struct ScheduledHandle<T> {
    key: String,
    task: JoinHandle<Result<T, SchedulerError>>,
}

impl<T> ScheduledHandle<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<T> Future for ScheduledHandle<T> {
    type Output = Result<T, SchedulerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SchedulerError::Aborted {
                key: self.key.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Bounded worker pool shared by all runs
pub struct SchedulingPool {
    config: SchedulerConfig,
    workers: Arc<Semaphore>,
    breakers: Arc<CircuitBreakerRegistry>,
    groups: Arc<BroadcastRegistry>,
    shutdown: AtomicBool,
    shutdown_token: CancellationToken,
}

impl Default for SchedulingPool {
    fn default() -> Self {
        Self::new(SchedulerConfig::default(), CircuitBreakerConfig::default())
    }
}

impl SchedulingPool {
    pub fn new(config: SchedulerConfig, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            breakers: Arc::new(CircuitBreakerRegistry::new(breaker_config)),
            groups: Arc::new(BroadcastRegistry::new(config.broadcast_capacity)),
            shutdown: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run `work` on its own task once a worker is free
    ///
    /// The circuit breaker (if any) is checked before waiting for a worker;
    /// the outcome of the work is recorded against it afterwards. Work that
    /// ends without a verdict for the target (overload, cancellation,
    /// shutdown, abort) releases its call instead.
    pub fn schedule<F, T>(
        &self,
        key: impl Into<String>,
        work: F,
        options: ScheduleOptions,
    ) -> ScheduledHandle<T>
    where
        F: Future<Output = Result<T, SchedulerError>> + Send + 'static,
        T: Send + 'static,
    {
        let key = key.into();
        let task_key = key.clone();
        let workers = self.workers.clone();
        let breakers = self.breakers.clone();
        let scheduling_timeout = self.config.scheduling_timeout;
        let shutting_down = self.is_shutdown();
        let cancel = match &options.cancellation {
            Some(token) => token.clone(),
            None => self.shutdown_token.child_token(),
        };
        let shutdown_token = self.shutdown_token.clone();

        let task = tokio::spawn(async move {
            if shutting_down {
                return Err(SchedulerError::ShuttingDown);
            }

            let mut probe = None;
            if let Some(breaker) = &options.circuit_breaker {
                breakers
                    .configure(&breaker.target, breaker.config.clone())
                    .await;
                if let Err(open) = breakers.check(&breaker.target).await {
                    return Err(SchedulerError::CircuitOpen(open));
                }
                probe = Some(ProbeGuard::new(breakers.clone(), &breaker.target));
            }

            let result = async {
                let acquire = tokio::time::timeout(scheduling_timeout, workers.acquire_owned());
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(SchedulerError::Cancelled { key: task_key.clone() })
                    }
                    _ = shutdown_token.cancelled() => return Err(SchedulerError::ShuttingDown),
                    acquired = acquire => match acquired {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) => return Err(SchedulerError::ShuttingDown),
                        Err(_) => {
                            return Err(SchedulerError::Overloaded {
                                key: task_key.clone(),
                                timeout: scheduling_timeout,
                            })
                        }
                    },
                };

                tokio::select! {
                    _ = cancel.cancelled() => Err(SchedulerError::Cancelled { key: task_key.clone() }),
                    result = run_with_timeout(&task_key, work, options.timeout) => result,
                }
            }
            .await;

            if let Some(breaker) = &options.circuit_breaker {
                match &result {
                    Ok(_) => breakers.record_success(&breaker.target).await,
                    Err(e) if e.counts_against_target() => {
                        tracing::debug!("Work '{}' failed against '{}': {}", task_key, breaker.target, e);
                        breakers.record_failure(&breaker.target).await;
                    }
                    Err(_) => breakers.release(&breaker.target).await,
                }
            }
            if let Some(probe) = probe.as_mut() {
                probe.disarm();
            }

            result
        });

        ScheduledHandle { key, task }
    }

    /// Create a broadcast group, or return the live group with this id
    pub fn create_broadcast_group(
        &self,
        id: &str,
        ttl: Duration,
    ) -> Result<BroadcastGroup, SchedulerError> {
        if self.is_shutdown() {
            return Err(SchedulerError::ShuttingDown);
        }
        Ok(self.groups.create(id, ttl))
    }

    pub fn subscribe(&self, id: &str) -> Result<Subscription, SchedulerError> {
        if self.is_shutdown() {
            return Err(SchedulerError::ShuttingDown);
        }
        self.groups.subscribe(id)
    }

    pub fn broadcast_group(&self, id: &str) -> Option<BroadcastGroup> {
        self.groups.get(id)
    }

    pub fn broadcast_group_count(&self) -> usize {
        self.groups.len()
    }

    /// Deliver `payload` to the broadcast group of `target`
    ///
    /// Uses the pool's default circuit breaker settings for `target`.
    pub async fn send(&self, target: &str, payload: Value) -> Result<usize, SchedulerError> {
        self.send_with(target, payload, ScheduleOptions::default())
            .await
    }

    /// Like [`send`](Self::send), with explicit options
    pub async fn send_with(
        &self,
        target: &str,
        payload: Value,
        mut options: ScheduleOptions,
    ) -> Result<usize, SchedulerError> {
        if options.circuit_breaker.is_none() {
            options.circuit_breaker = Some(BreakerOption {
                target: target.to_string(),
                config: self.breakers.default_config().clone(),
            });
        }

        let groups = self.groups.clone();
        let group = target.to_string();
        let work = async move { groups.publish(&group, payload) };
        let result = self
            .schedule(format!("send:{}", target), work, options)
            .await;

        match &result {
            Ok(delivered) => tracing::debug!("Sent to '{}' ({} subscriber(s))", target, delivered),
            Err(e) => tracing::warn!("Send to '{}' failed: {}", target, e),
        }
        result
    }

    /// Stop accepting work, cancel waiting work and drop every group
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down scheduling pool");
        self.shutdown_token.cancel();
        self.workers.close();
        self.groups.clear();
    }
}

/// Releases a checked breaker call when scheduled work is dropped before
/// its outcome was recorded (an aborted task)
struct ProbeGuard {
    breakers: Arc<CircuitBreakerRegistry>,
    target: Option<String>,
}

impl ProbeGuard {
    fn new(breakers: Arc<CircuitBreakerRegistry>, target: &str) -> Self {
        Self {
            breakers,
            target: Some(target.to_string()),
        }
    }

    fn disarm(&mut self) {
        self.target = None;
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        let Some(target) = self.target.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let breakers = self.breakers.clone();
                handle.spawn(async move { breakers.release(&target).await });
            }
            Err(_) => tracing::warn!("Dropped work for '{}' outside a runtime; probe not released", target),
        }
    }
}

async fn run_with_timeout<F, T>(
    key: &str,
    work: F,
    timeout: Option<Duration>,
) -> Result<T, SchedulerError>
where
    F: Future<Output = Result<T, SchedulerError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .unwrap_or_else(|_| {
                Err(SchedulerError::Timeout {
                    key: key.to_string(),
                    timeout: limit,
                })
            }),
        None => work.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pool(max_workers: usize) -> SchedulingPool {
        SchedulingPool::new(
            SchedulerConfig {
                max_workers,
                scheduling_timeout: Duration::from_millis(200),
                ..SchedulerConfig::default()
            },
            CircuitBreakerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_schedule_returns_result() {
        let pool = pool(2);
        let handle = pool.schedule("answer", async { Ok(42) }, ScheduleOptions::new());
        assert_eq!(handle.key(), "answer");
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_workers_are_bounded() {
        let pool = pool(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                pool.schedule(
                    format!("work-{}", i),
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(i)
                    },
                    ScheduleOptions::new(),
                )
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_for_worker_times_out() {
        let pool = pool(1);
        let busy = pool.schedule(
            "busy",
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            ScheduleOptions::new(),
        );
        tokio::task::yield_now().await;

        let waiting = pool.schedule("waiting", async { Ok(()) }, ScheduleOptions::new());
        assert!(matches!(
            waiting.await,
            Err(SchedulerError::Overloaded { .. })
        ));
        busy.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_timeout() {
        let pool = pool(1);
        let handle = pool.schedule(
            "slow",
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            ScheduleOptions::new().with_timeout(Duration::from_secs(1)),
        );
        assert!(matches!(handle.await, Err(SchedulerError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_max_failures() {
        let pool = pool(2);
        let options = ScheduleOptions::new().with_circuit_breaker("reviewer", 3, Duration::from_secs(60));

        for _ in 0..3 {
            let handle = pool.schedule(
                "review",
                async {
                    Err::<(), _>(SchedulerError::WorkFailed {
                        key: "review".into(),
                        reason: "unreachable".into(),
                    })
                },
                options.clone(),
            );
            assert!(matches!(handle.await, Err(SchedulerError::WorkFailed { .. })));
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let handle = pool.schedule(
            "review",
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            options,
        );
        assert!(matches!(handle.await, Err(SchedulerError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    fn flaky() -> impl Future<Output = Result<(), SchedulerError>> {
        async {
            Err(SchedulerError::WorkFailed {
                key: "review".into(),
                reason: "unreachable".into(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_overloaded_half_open_call_is_released() {
        let pool = pool(1);
        let options = ScheduleOptions::new().with_circuit_breaker("reviewer", 1, Duration::from_secs(5));

        assert!(pool.schedule("review", flaky(), options.clone()).await.is_err());
        tokio::time::advance(Duration::from_secs(6)).await;

        let busy = pool.schedule(
            "busy",
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            ScheduleOptions::new(),
        );
        tokio::task::yield_now().await;

        let starved = pool.schedule("review", async { Ok(()) }, options.clone());
        assert!(matches!(starved.await, Err(SchedulerError::Overloaded { .. })));
        assert_eq!(
            pool.breakers().get_state("reviewer").await,
            Some(CircuitState::HalfOpen)
        );

        busy.abort();
        let retried = pool.schedule("review", async { Ok(()) }, options);
        assert!(retried.await.is_ok());
        assert_eq!(
            pool.breakers().get_state("reviewer").await,
            Some(CircuitState::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_half_open_call_is_released() {
        let pool = pool(1);
        let options = ScheduleOptions::new().with_circuit_breaker("reviewer", 1, Duration::from_secs(5));

        assert!(pool.schedule("review", flaky(), options.clone()).await.is_err());
        tokio::time::advance(Duration::from_secs(6)).await;

        let stuck = pool.schedule(
            "review",
            std::future::pending::<Result<(), SchedulerError>>(),
            options.clone(),
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(matches!(
            pool.schedule("review", async { Ok(()) }, options.clone()).await,
            Err(SchedulerError::CircuitOpen(_))
        ));

        stuck.abort();
        assert!(matches!(stuck.await, Err(SchedulerError::Aborted { .. })));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(pool.schedule("review", async { Ok(()) }, options).await.is_ok());
        assert_eq!(
            pool.breakers().get_state("reviewer").await,
            Some(CircuitState::Closed)
        );
    }

    #[tokio::test]
    async fn test_cancellation() {
        let pool = pool(1);
        let token = CancellationToken::new();
        let handle = pool.schedule(
            "forever",
            std::future::pending::<Result<(), SchedulerError>>(),
            ScheduleOptions::new().with_cancellation(token.clone()),
        );
        token.cancel();
        assert!(matches!(handle.await, Err(SchedulerError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_send_delivers_to_group() {
        let pool = pool(2);
        pool.create_broadcast_group("reviewer", Duration::from_secs(60))
            .unwrap();
        let mut inbox = pool.subscribe("reviewer").unwrap();

        let delivered = pool.send("reviewer", Value::from("draft")).await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(inbox.recv().await.unwrap(), Value::from("draft"));
    }

    #[tokio::test]
    async fn test_send_failures_trip_breaker() {
        let pool = pool(2);

        for _ in 0..3 {
            assert!(matches!(
                pool.send("ghost", Value::Empty).await,
                Err(SchedulerError::GroupNotFound { .. })
            ));
        }
        assert!(matches!(
            pool.send("ghost", Value::Empty).await,
            Err(SchedulerError::CircuitOpen(_))
        ));
        assert_eq!(pool.breakers().failure_count("ghost").await, Some(3));
    }

    #[tokio::test]
    async fn test_send_without_subscribers_fails() {
        let pool = pool(2);
        pool.create_broadcast_group("lonely", Duration::from_secs(60))
            .unwrap();
        assert!(matches!(
            pool.send("lonely", Value::Empty).await,
            Err(SchedulerError::NoSubscribers { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let pool = pool(2);
        pool.create_broadcast_group("reviewer", Duration::from_secs(60))
            .unwrap();
        pool.shutdown();

        assert!(pool.is_shutdown());
        assert_eq!(pool.broadcast_group_count(), 0);
        let handle = pool.schedule("late", async { Ok(()) }, ScheduleOptions::new());
        assert!(matches!(handle.await, Err(SchedulerError::ShuttingDown)));
        assert!(matches!(
            pool.create_broadcast_group("again", Duration::from_secs(1)),
            Err(SchedulerError::ShuttingDown)
        ));
    }
}
