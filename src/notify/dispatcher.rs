//! Delivery dispatcher
//!
//! The evaluation loop hands routed notifications to a [`DispatchHandle`],
//! which enqueues one job per (notification, receiver) on a bounded queue
//! without ever blocking. The [`Dispatcher`] task drains the queue into a
//! bounded pool of delivery tasks, each retrying its receiver with
//! exponential backoff. Deliveries of one alert to one receiver keep their
//! queue order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{self, JoinSet};

use super::notification::{DeliveryRecord, DeliveryStatus, Notification};
use super::receivers::{DeliveryOutcome, Receiver};
use crate::metrics::Metrics;

/// Number of delivery records kept for `GET /deliveries`
pub const DELIVERY_LOG_CAPACITY: usize = 256;

/// Retry schedule for retryable failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base: Duration,
    pub max_backoff: Duration,
    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based): `base * 2^(attempt-1)`, capped at `max_backoff`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);

        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
            delay + Duration::from_millis(extra)
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum concurrent deliveries
    pub workers: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    /// Upper bound for a single delivery attempt
    pub attempt_timeout: Duration,
    /// Time in-flight deliveries get to finish on shutdown
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 1024,
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// A routed receiver for one notification
#[derive(Clone)]
pub struct Target {
    pub name: String,
    pub receiver: Arc<dyn Receiver>,
}

impl Target {
    pub fn new(name: impl Into<String>, receiver: Arc<dyn Receiver>) -> Self {
        Self {
            name: name.into(),
            receiver,
        }
    }
}

struct Job {
    notification: Arc<Notification>,
    target: Target,
}

/// Ring buffer of the most recent delivery results
pub struct DeliveryLog {
    records: Mutex<VecDeque<DeliveryRecord>>,
    capacity: usize,
}

impl DeliveryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, record: DeliveryRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Newest first
    pub fn recent(&self, limit: usize) -> Vec<DeliveryRecord> {
        let records = self.records.lock();
        records.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Default for DeliveryLog {
    fn default() -> Self {
        Self::new(DELIVERY_LOG_CAPACITY)
    }
}

/// Producer side of the dispatch queue
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<Job>,
    metrics: Arc<Metrics>,
    log: Arc<DeliveryLog>,
}

impl DispatchHandle {
    /// Enqueue one delivery per target. Never waits: when the queue is full
    /// the delivery is dropped. Returns the number of deliveries enqueued.
    pub fn dispatch(&self, notification: Notification, targets: Vec<Target>) -> usize {
        let notification = Arc::new(notification);
        let mut queued = 0;

        for target in targets {
            let job = Job {
                notification: Arc::clone(&notification),
                target,
            };
            match self.tx.try_send(job) {
                Ok(()) => queued += 1,
                Err(e) => {
                    let (reason, job) = match e {
                        mpsc::error::TrySendError::Full(job) => ("queue full", job),
                        mpsc::error::TrySendError::Closed(job) => ("dispatcher stopped", job),
                    };
                    tracing::warn!(
                        rule = %job.notification.alert.rule,
                        receiver = %job.target.name,
                        reason,
                        "Dropping notification"
                    );
                    self.metrics.record_dropped();
                    self.log.push(DeliveryRecord::new(
                        &job.notification,
                        &job.target.name,
                        DeliveryStatus::Dropped,
                        0,
                        Some(reason.to_string()),
                    ));
                }
            }
        }

        queued
    }

    pub fn log(&self) -> &Arc<DeliveryLog> {
        &self.log
    }
}

/// Deliveries to one receiver for one alert run one at a time, in the order
/// they were queued, so a resolve never overtakes its trigger
type LaneKey = (String, String);

fn lane_key(job: &Job) -> LaneKey {
    (job.target.name.clone(), job.notification.alert.fingerprint.clone())
}

/// Jobs waiting behind an in-flight delivery of the same lane. A key is
/// present while its lane is busy.
#[derive(Default)]
struct Lanes {
    waiting: HashMap<LaneKey, VecDeque<Job>>,
    running: HashMap<task::Id, LaneKey>,
}

impl Lanes {
    /// Returns the job back if its lane is idle and it may start now
    fn admit(&mut self, job: Job) -> Option<Job> {
        let key = lane_key(&job);
        match self.waiting.get_mut(&key) {
            Some(queue) => {
                queue.push_back(job);
                None
            }
            None => {
                self.waiting.insert(key, VecDeque::new());
                Some(job)
            }
        }
    }

    /// Release the lane of a finished task, yielding its next job if any
    fn finish(&mut self, id: task::Id) -> Option<Job> {
        let key = self.running.remove(&id)?;
        let next = self.waiting.get_mut(&key).and_then(|queue| queue.pop_front());
        if next.is_none() {
            self.waiting.remove(&key);
        }
        next
    }

    fn queued(&self) -> usize {
        self.waiting.values().map(|q| q.len()).sum()
    }
}

/// Consumer side: owns the worker pool
pub struct Dispatcher {
    config: DispatcherConfig,
    rx: mpsc::Receiver<Job>,
    metrics: Arc<Metrics>,
    log: Arc<DeliveryLog>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        metrics: Arc<Metrics>,
        log: Arc<DeliveryLog>,
    ) -> (Self, DispatchHandle) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = DispatchHandle {
            tx,
            metrics: Arc::clone(&metrics),
            log: Arc::clone(&log),
        };
        (
            Self {
                config,
                rx,
                metrics,
                log,
            },
            handle,
        )
    }

    /// Spawn the dispatcher task
    pub fn start(self) -> DispatcherTask {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(self.run(shutdown_rx));
        DispatcherTask {
            handle,
            shutdown_tx,
        }
    }

    async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut lanes = Lanes::default();

        tracing::info!(
            workers = self.config.workers,
            queue = self.config.queue_capacity,
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                job = self.rx.recv() => match job {
                    Some(job) => self.submit(&semaphore, &mut tasks, &mut lanes, job).await,
                    None => break,
                },
                Some(done) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    self.complete(&semaphore, &mut tasks, &mut lanes, done).await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        // Stop accepting work, then drain what is already queued
        self.rx.close();
        let grace = self.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while let Some(job) = self.rx.recv().await {
                self.submit(&semaphore, &mut tasks, &mut lanes, job).await;
            }
            while let Some(done) = tasks.join_next_with_id().await {
                self.complete(&semaphore, &mut tasks, &mut lanes, done).await;
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                in_flight = tasks.len(),
                waiting = lanes.queued(),
                grace_secs = grace.as_secs(),
                "Shutdown grace elapsed, aborting deliveries"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        tracing::info!("Dispatcher stopped");
    }

    async fn submit(
        &self,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
        lanes: &mut Lanes,
        job: Job,
    ) {
        if let Some(job) = lanes.admit(job) {
            self.spawn(semaphore, tasks, lanes, job).await;
        }
    }

    async fn complete(
        &self,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
        lanes: &mut Lanes,
        done: Result<(task::Id, ()), task::JoinError>,
    ) {
        let id = match done {
            Ok((id, ())) => id,
            Err(e) => {
                tracing::error!(error = %e, "Delivery task failed");
                e.id()
            }
        };
        if let Some(next) = lanes.finish(id) {
            self.spawn(semaphore, tasks, lanes, next).await;
        }
    }

    async fn spawn(
        &self,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
        lanes: &mut Lanes,
        job: Job,
    ) {
        let permit = match Arc::clone(semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let key = lane_key(&job);
        let retry = self.config.retry.clone();
        let timeout = self.config.attempt_timeout;
        let metrics = Arc::clone(&self.metrics);
        let log = Arc::clone(&self.log);

        let handle = tasks.spawn(async move {
            let record = deliver_with_retry(&job.notification, &job.target, &retry, timeout, &metrics).await;
            log.push(record);
            drop(permit);
        });
        lanes.running.insert(handle.id(), key);
    }
}

/// Running dispatcher
pub struct DispatcherTask {
    handle: tokio::task::JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl DispatcherTask {
    /// Stop accepting work and wait for queued and in-flight deliveries,
    /// bounded by the shutdown grace period
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Dispatcher task failed");
        }
    }
}

/// Deliver one notification to one receiver, retrying retryable failures
pub async fn deliver_with_retry(
    notification: &Notification,
    target: &Target,
    retry: &RetryPolicy,
    attempt_timeout: Duration,
    metrics: &Metrics,
) -> DeliveryRecord {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(
            attempt_timeout,
            target.receiver.deliver(notification),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::Retryable(format!(
                "Attempt timed out after {}ms",
                attempt_timeout.as_millis()
            )),
        };

        match outcome {
            DeliveryOutcome::Delivered => {
                metrics.record_delivered(&target.name);
                tracing::info!(
                    rule = %notification.alert.rule,
                    receiver = %target.name,
                    kind = notification.kind.as_str(),
                    attempts = attempt,
                    "Notification delivered"
                );
                return DeliveryRecord::new(
                    notification,
                    &target.name,
                    DeliveryStatus::Delivered,
                    attempt,
                    None,
                );
            }
            DeliveryOutcome::Permanent(reason) => {
                metrics.record_failed(&target.name);
                tracing::error!(
                    rule = %notification.alert.rule,
                    receiver = %target.name,
                    attempts = attempt,
                    error = %reason,
                    "Notification failed permanently"
                );
                return DeliveryRecord::new(
                    notification,
                    &target.name,
                    DeliveryStatus::Failed,
                    attempt,
                    Some(reason),
                );
            }
            DeliveryOutcome::Retryable(reason) if attempt >= max_attempts => {
                metrics.record_failed(&target.name);
                tracing::error!(
                    rule = %notification.alert.rule,
                    receiver = %target.name,
                    attempts = attempt,
                    error = %reason,
                    "Notification failed after retries"
                );
                return DeliveryRecord::new(
                    notification,
                    &target.name,
                    DeliveryStatus::Failed,
                    attempt,
                    Some(reason),
                );
            }
            DeliveryOutcome::Retryable(reason) => {
                let delay = retry.backoff(attempt);
                metrics.record_retry(&target.name);
                tracing::warn!(
                    rule = %notification.alert.rule,
                    receiver = %target.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Delivery failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
