//! Upload coordinator: bounded concurrency, retries and result aggregation.
//!
//! ## Admission
//!
//! A [`tokio::sync::Semaphore`] with `max_concurrent_uploads` permits is the
//! only admission knob. It belongs to the coordinator, so concurrent runs
//! share one slot pool. [`UploadRun::submit`] acquires a permit *before*
//! spawning, so a submitter that outruns the network simply waits: there is
//! no unbounded queue. The permit moves into the spawned task and is released
//! when the task reaches a terminal state.
//!
//! ## In-flight registry
//!
//! Each fingerprint being uploaded is claimed in a coordinator-wide registry.
//! A run that submits a fingerprint another run already holds does not `put`
//! it again; it waits for the holder's outcome and shares it. If the holder
//! disappears without an outcome (its run was aborted at the deadline), the
//! waiter claims the fingerprint itself.
//!
//! The registry also owns key assignment. When a payload key is already held
//! by a different fingerprint, in flight or in the cache, the key gets the
//! fingerprint's short hex appended so one object never serves two images.
//!
//! ## Task state machine
//!
//! ```text
//! Pending ──admit──▶ InFlight ──ok──────────────▶ Succeeded
//!                      │  ▲
//!          transient   │  │ backoff elapsed
//!                      ▼  │
//!                    Retrying ──budget spent──▶ Failed
//!
//! InFlight ──auth / quota / rejected──▶ Failed
//! ```
//!
//! Transient errors (`NetworkError`, `RateLimited`) are retried with
//! exponential backoff and jitter, up to `max_retries` retries per payload.
//!
//! ## Cancellation and timeout
//!
//! Cancellation stops admission only: tasks already in flight finish (or
//! fail) on their own and their results are kept. The run deadline is
//! harder: when it passes, unfinished tasks are aborted and reported as
//! [`TaskError::TimedOut`].

use crate::cache::{CacheEntry, UploadCache};
use crate::error::{StorageError, TaskError};
use crate::fingerprint::Fingerprint;
use crate::naming;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::storage::{RemoteLocation, StorageBackend};
use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── Retry policy ─────────────────────────────────────────────────────────────

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Total attempts allowed for one payload.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after the 1-indexed `attempt` failed.
    ///
    /// The exponential step is `base * 2^(attempt-1)`, capped at `max_delay`;
    /// `jitter` in `[0, 1]` then picks a point in the upper half of that step
    /// so concurrent retries spread out without ever collapsing to zero.
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        let step = self.base_delay.saturating_mul(exp).min(self.max_delay);
        let jitter = jitter.clamp(0.0, 1.0);
        step / 2 + step.mul_f64(jitter / 2.0)
    }

    /// Delay for a real retry: jittered backoff, stretched to any
    /// server-requested `Retry-After`.
    fn backoff(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let delay = self.delay_for(attempt, rand::random::<f64>());
        match retry_after_secs {
            Some(secs) => delay.max(Duration::from_secs(secs)),
            None => delay,
        }
    }
}

// ── Tasks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    InFlight,
    Retrying,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskState::Pending => "pending",
            TaskState::InFlight => "in-flight",
            TaskState::Retrying => "retrying",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        })
    }
}

/// One object to `put`.
#[derive(Debug, Clone)]
pub struct UploadPayload {
    pub key: String,
    pub bytes: Bytes,
    pub content_type: String,
}

/// The unit of work for one distinct fingerprint.
#[derive(Debug)]
pub struct UploadTask {
    pub fingerprint: Fingerprint,
    /// Display name for logs and progress events.
    pub name: String,
    pub original: UploadPayload,
    /// Uploaded after the original, inside the same slot.
    pub thumbnail: Option<UploadPayload>,
    attempts: u32,
    state: TaskState,
}

impl UploadTask {
    pub fn new(
        fingerprint: Fingerprint,
        name: impl Into<String>,
        original: UploadPayload,
        thumbnail: Option<UploadPayload>,
    ) -> Self {
        Self {
            fingerprint,
            name: name.into(),
            original,
            thumbnail,
            attempts: 0,
            state: TaskState::Pending,
        }
    }

    /// `put` calls issued so far, across both payloads.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Every key this task will write.
    fn keys(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.original.key.as_str())
            .chain(self.thumbnail.as_ref().map(|t| t.key.as_str()))
    }

    /// Suffix every key with the fingerprint so it cannot clash with an
    /// object that belongs to other content.
    fn disambiguate_keys(&mut self) {
        let fp = self.fingerprint;
        self.original.key = naming::disambiguate(&self.original.key, &fp);
        if let Some(thumb) = self.thumbnail.as_mut() {
            thumb.key = naming::disambiguate(&thumb.key, &fp);
        }
    }
}

fn transition(fingerprint: &Fingerprint, state: &mut TaskState, to: TaskState) {
    debug_assert!(!state.is_terminal(), "{fingerprint:?} left terminal state {state}");
    debug!("{:?}: {} → {}", fingerprint, state, to);
    *state = to;
}

/// Terminal result of one task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub fingerprint: Fingerprint,
    /// The cache entry now held for the fingerprint, or why the task failed.
    pub result: Result<CacheEntry, TaskError>,
    pub attempts: u32,
}

impl TaskOutcome {
    fn failed(fingerprint: Fingerprint, error: TaskError, attempts: u32) -> Self {
        Self {
            fingerprint,
            result: Err(error),
            attempts,
        }
    }

    pub fn state(&self) -> TaskState {
        if self.result.is_ok() {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        }
    }
}

/// What happened to a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Holding a slot and running.
    Admitted,
    /// A task with the same fingerprint was already submitted in this run.
    Duplicate,
    /// Another run is uploading the same fingerprint; its outcome is shared.
    Joined,
    /// The fingerprint reached the cache after the caller looked.
    Cached,
    /// Cancellation arrived before a slot was free.
    Cancelled,
    /// The run deadline passed before a slot was free.
    TimedOut,
}

// ── Coordinator ──────────────────────────────────────────────────────────────

struct Shared {
    backend: Arc<dyn StorageBackend>,
    cache: Arc<UploadCache>,
    policy: RetryPolicy,
    progress: ProgressCallback,
    semaphore: Arc<Semaphore>,
    registry: Registry,
}

/// Long-lived upload engine: one backend, one cache, one policy, one slot
/// pool.
pub struct UploadCoordinator {
    shared: Arc<Shared>,
}

impl UploadCoordinator {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        cache: Arc<UploadCache>,
        policy: RetryPolicy,
        max_concurrent: usize,
    ) -> Self {
        Self::with_progress(
            backend,
            cache,
            policy,
            max_concurrent,
            Arc::new(NoopProgressCallback),
        )
    }

    pub fn with_progress(
        backend: Arc<dyn StorageBackend>,
        cache: Arc<UploadCache>,
        policy: RetryPolicy,
        max_concurrent: usize,
        progress: ProgressCallback,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                cache,
                policy,
                progress,
                semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
                registry: Registry::default(),
            }),
        }
    }

    /// Open a run. Every task submitted to it shares the cancellation token
    /// and the deadline; all runs share the coordinator's slot pool.
    pub fn start(&self, cancel: CancellationToken, deadline: Instant) -> UploadRun {
        UploadRun {
            shared: Arc::clone(&self.shared),
            tasks: JoinSet::new(),
            submitted: HashSet::new(),
            outcomes: HashMap::new(),
            cancel,
            deadline,
        }
    }

    /// Slots not held by any task right now.
    pub fn available_slots(&self) -> usize {
        self.shared.semaphore.available_permits()
    }
}

// ── In-flight registry ───────────────────────────────────────────────────────

/// `None` until the holder reaches a terminal state.
type Published = Option<Result<CacheEntry, TaskError>>;

struct Holder {
    id: u64,
    keys: Vec<String>,
    outcome: watch::Receiver<Published>,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    holders: Mutex<HashMap<Fingerprint, Holder>>,
}

enum Claim {
    Lead(Lease),
    Follow(watch::Receiver<Published>),
    Cached(CacheEntry),
}

/// Exclusive right to upload one fingerprint. Dropping it releases the
/// claim; waiters that saw no outcome then compete for it again.
struct Lease {
    shared: Arc<Shared>,
    fingerprint: Fingerprint,
    id: u64,
    tx: watch::Sender<Published>,
}

impl Lease {
    fn publish(&self, result: &Result<CacheEntry, TaskError>) {
        self.tx.send_replace(Some(result.clone()));
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut holders = self
            .shared
            .registry
            .holders
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if holders
            .get(&self.fingerprint)
            .is_some_and(|h| h.id == self.id)
        {
            holders.remove(&self.fingerprint);
        }
    }
}

/// Claim `task`'s fingerprint, assigning collision-free keys if this caller
/// becomes the holder.
fn claim(shared: &Arc<Shared>, task: &mut UploadTask) -> Claim {
    let fp = task.fingerprint;
    let mut holders = shared
        .registry
        .holders
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    if let Some(holder) = holders.get(&fp) {
        // Err means the holder's sender is gone.
        if holder.outcome.has_changed().is_ok() {
            return Claim::Follow(holder.outcome.clone());
        }
    }
    // Holders record into the cache before releasing the claim, so checking
    // here, under the lock, cannot miss a finished upload.
    if let Some(entry) = shared.cache.lookup(&fp) {
        return Claim::Cached(entry);
    }

    let taken = task.keys().any(|key| {
        holders
            .iter()
            .any(|(other, h)| *other != fp && h.keys.iter().any(|k| k == key))
            || shared.cache.owner_of_key(key).is_some_and(|owner| owner != fp)
    });
    if taken {
        let before = task.original.key.clone();
        task.disambiguate_keys();
        info!(
            "Key {} already holds other content; using {}",
            before, task.original.key
        );
    }

    let id = shared.registry.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = watch::channel(None);
    holders.insert(
        fp,
        Holder {
            id,
            keys: task.keys().map(str::to_string).collect(),
            outcome: rx,
        },
    );
    Claim::Lead(Lease {
        shared: Arc::clone(shared),
        fingerprint: fp,
        id,
        tx,
    })
}

enum Gate {
    Open(OwnedSemaphorePermit),
    Cancelled,
    TimedOut,
}

/// One batch of tasks sharing a slot pool.
pub struct UploadRun {
    shared: Arc<Shared>,
    tasks: JoinSet<TaskOutcome>,
    submitted: HashSet<Fingerprint>,
    outcomes: HashMap<Fingerprint, TaskOutcome>,
    cancel: CancellationToken,
    deadline: Instant,
}

impl UploadRun {
    /// Admit `task` once a slot is free.
    ///
    /// Blocks while every slot is busy. A task that can never be admitted
    /// (cancelled, deadline passed) is recorded as failed immediately.
    pub async fn submit(&mut self, mut task: UploadTask) -> Admission {
        let fp = task.fingerprint;
        if !self.submitted.insert(fp) {
            debug!("{:?} already submitted in this run", fp);
            return Admission::Duplicate;
        }

        let lease = match claim(&self.shared, &mut task) {
            Claim::Lead(lease) => lease,
            Claim::Follow(outcome) => {
                debug!("{:?} is being uploaded by another run; waiting for it", fp);
                self.shared.progress.on_task_start(&fp, &task.name);
                self.tasks
                    .spawn(follow(Arc::clone(&self.shared), task, outcome));
                return Admission::Joined;
            }
            Claim::Cached(entry) => {
                self.outcomes.insert(
                    fp,
                    TaskOutcome {
                        fingerprint: fp,
                        result: Ok(entry),
                        attempts: 0,
                    },
                );
                return Admission::Cached;
            }
        };

        let gate = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Gate::Cancelled,
            _ = tokio::time::sleep_until(self.deadline) => Gate::TimedOut,
            permit = Arc::clone(&self.shared.semaphore).acquire_owned() => match permit {
                Ok(p) => Gate::Open(p),
                Err(_) => Gate::Cancelled,
            },
        };
        let permit = match gate {
            Gate::Open(p) => p,
            Gate::Cancelled => {
                drop(lease);
                self.reject(fp, TaskError::Cancelled);
                return Admission::Cancelled;
            }
            Gate::TimedOut => {
                drop(lease);
                self.reject(fp, TaskError::TimedOut);
                return Admission::TimedOut;
            }
        };

        transition(&fp, &mut task.state, TaskState::InFlight);
        self.shared.progress.on_task_start(&fp, &task.name);
        self.tasks
            .spawn(run_task(Arc::clone(&self.shared), task, permit, lease));
        Admission::Admitted
    }

    fn reject(&mut self, fp: Fingerprint, error: TaskError) {
        info!("{:?} not admitted: {}", fp, error);
        self.shared.progress.on_task_error(&fp, &error.to_string());
        self.outcomes.insert(fp, TaskOutcome::failed(fp, error, 0));
    }

    /// Tasks admitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every admitted task to reach a terminal state, or for the
    /// deadline, whichever comes first. Returns one outcome per submitted
    /// fingerprint.
    pub async fn finish(mut self) -> Vec<TaskOutcome> {
        let deadline = self.deadline;
        let mut timed_out = false;
        loop {
            let joined = tokio::select! {
                biased;
                joined = self.tasks.join_next() => joined,
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
            };
            match joined {
                None => break,
                Some(Ok(outcome)) => {
                    self.outcomes.insert(outcome.fingerprint, outcome);
                }
                Some(Err(e)) => warn!("Upload task ended abnormally: {}", e),
            }
        }

        if timed_out {
            warn!(
                "Run deadline reached with {} task(s) unfinished",
                self.tasks.len()
            );
            self.tasks.abort_all();
            // Tasks that completed in the meantime still report normally.
            while let Some(joined) = self.tasks.join_next().await {
                if let Ok(outcome) = joined {
                    self.outcomes.insert(outcome.fingerprint, outcome);
                }
            }
        }

        // Anything without an outcome was aborted at the deadline or panicked.
        for fp in &self.submitted {
            if !self.outcomes.contains_key(fp) {
                let error = if timed_out {
                    TaskError::TimedOut
                } else {
                    TaskError::ProcessingError {
                        detail: "upload task panicked".into(),
                    }
                };
                self.shared.progress.on_task_error(fp, &error.to_string());
                self.outcomes.insert(*fp, TaskOutcome::failed(*fp, error, 0));
            }
        }
        self.outcomes.into_values().collect()
    }
}

// ── Task body ────────────────────────────────────────────────────────────────

/// Wait for another run's upload of the same fingerprint, taking over if
/// that run goes away without finishing.
async fn follow(
    shared: Arc<Shared>,
    mut task: UploadTask,
    mut outcome: watch::Receiver<Published>,
) -> TaskOutcome {
    let fp = task.fingerprint;
    loop {
        let published = outcome
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|p| p.clone());
        if let Some(result) = published {
            match &result {
                Ok(entry) => shared.progress.on_task_complete(&fp, &entry.remote_url),
                Err(e) => shared.progress.on_task_error(&fp, &e.to_string()),
            }
            return TaskOutcome {
                fingerprint: fp,
                result,
                attempts: 0,
            };
        }

        debug!("{:?}: previous holder vanished; claiming it", fp);
        match claim(&shared, &mut task) {
            Claim::Follow(next) => outcome = next,
            Claim::Cached(entry) => {
                shared.progress.on_task_complete(&fp, &entry.remote_url);
                return TaskOutcome {
                    fingerprint: fp,
                    result: Ok(entry),
                    attempts: 0,
                };
            }
            Claim::Lead(lease) => {
                let permit = match Arc::clone(&shared.semaphore).acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return TaskOutcome::failed(fp, TaskError::Cancelled, 0),
                };
                transition(&fp, &mut task.state, TaskState::InFlight);
                return run_task(shared, task, permit, lease).await;
            }
        }
    }
}

async fn run_task(
    shared: Arc<Shared>,
    task: UploadTask,
    permit: OwnedSemaphorePermit,
    lease: Lease,
) -> TaskOutcome {
    let _permit = permit;
    let outcome = upload(&shared, task).await;
    // Cache first, then the registry: see `claim`.
    lease.publish(&outcome.result);
    drop(lease);
    outcome
}

async fn upload(shared: &Shared, mut task: UploadTask) -> TaskOutcome {
    let fp = task.fingerprint;

    let original = match put_with_retry(
        shared,
        &fp,
        &task.original,
        &mut task.attempts,
        &mut task.state,
    )
    .await
    {
        Ok(loc) => loc,
        Err(e) => {
            transition(&fp, &mut task.state, TaskState::Failed);
            warn!("Upload of {} failed: {}", task.name, e);
            shared.progress.on_task_error(&fp, &e.to_string());
            return TaskOutcome::failed(fp, e, task.attempts);
        }
    };

    // A missing thumbnail never invalidates a stored original.
    let thumbnail = match &task.thumbnail {
        Some(payload) => {
            match put_with_retry(shared, &fp, payload, &mut task.attempts, &mut task.state).await
            {
                Ok(loc) => Some(loc),
                Err(e) => {
                    warn!("Thumbnail for {} not uploaded: {}", task.name, e);
                    None
                }
            }
        }
        None => None,
    };

    let entry = CacheEntry {
        remote_url: original.url,
        remote_key: original.key,
        uploaded_at: Utc::now(),
        backend: shared.backend.identifier().to_string(),
        thumbnail_url: thumbnail.as_ref().map(|t| t.url.clone()),
        thumbnail_key: thumbnail.map(|t| t.key),
    };
    let entry = shared.cache.record(fp, entry).into_entry();
    transition(&fp, &mut task.state, TaskState::Succeeded);
    info!("Uploaded {} → {}", task.name, entry.remote_url);
    shared.progress.on_task_complete(&fp, &entry.remote_url);

    TaskOutcome {
        fingerprint: fp,
        result: Ok(entry),
        attempts: task.attempts,
    }
}

/// `put` one payload, retrying transient failures within the policy.
async fn put_with_retry(
    shared: &Shared,
    fp: &Fingerprint,
    payload: &UploadPayload,
    attempts: &mut u32,
    state: &mut TaskState,
) -> Result<RemoteLocation, TaskError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        *attempts += 1;
        let result: Result<RemoteLocation, StorageError> = shared
            .backend
            .put(&payload.key, payload.bytes.clone(), &payload.content_type)
            .await;
        match result {
            Ok(loc) => return Ok(loc),
            Err(e) if e.is_retriable() && attempt < shared.policy.max_attempts() => {
                let delay = shared.policy.backoff(attempt, e.retry_after_secs());
                warn!(
                    "{} attempt {}/{} failed: {}; retrying in {:?}",
                    payload.key,
                    attempt,
                    shared.policy.max_attempts(),
                    e,
                    delay
                );
                transition(fp, state, TaskState::Retrying);
                shared
                    .progress
                    .on_task_retry(fp, attempt, delay, &e.to_string());
                tokio::time::sleep(delay).await;
                transition(fp, state, TaskState::InFlight);
            }
            Err(e) => return Err(e.into_task_error(attempt)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let p = policy();
        assert_eq!(p.delay_for(1, 1.0), Duration::from_millis(100));
        assert_eq!(p.delay_for(2, 1.0), Duration::from_millis(200));
        assert_eq!(p.delay_for(3, 1.0), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped() {
        let p = policy();
        assert_eq!(p.delay_for(10, 1.0), Duration::from_millis(1000));
        assert_eq!(p.delay_for(u32::MAX, 1.0), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_in_upper_half() {
        let p = policy();
        assert_eq!(p.delay_for(2, 0.0), Duration::from_millis(100));
        let mid = p.delay_for(2, 0.5);
        assert!(mid > Duration::from_millis(100) && mid < Duration::from_millis(200));
    }

    #[test]
    fn retry_after_stretches_backoff() {
        let p = policy();
        assert!(p.backoff(1, Some(2)) >= Duration::from_secs(2));
        assert!(p.backoff(1, None) <= Duration::from_millis(100));
    }

    #[test]
    fn attempts_are_retries_plus_one() {
        let p = RetryPolicy {
            max_retries: 0,
            ..policy()
        };
        assert_eq!(p.max_attempts(), 1);
        assert_eq!(policy().max_attempts(), 4);
    }

    #[test]
    fn new_task_is_pending() {
        let task = UploadTask::new(
            crate::fingerprint::fingerprint(b"x"),
            "x.png",
            UploadPayload {
                key: "x.png".into(),
                bytes: Bytes::from_static(b"x"),
                content_type: "image/png".into(),
            },
            None,
        );
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.attempts(), 0);
        assert!(!task.state().is_terminal());
    }
}
