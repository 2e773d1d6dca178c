use crate::errors::retriable;
use crate::metrics::EngineTelemetry;
use anyhow::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const LIVENESS_QUEUE: &str = "liveness-monitoring";
pub const SETTLEMENT_QUEUE: &str = "settlement-processing";

pub const JOB_CHECK_LIVENESS: &str = "check-liveness";
pub const JOB_SETTLE_EVENT: &str = "settle-event";
pub const JOB_BATCH_SETTLEMENT: &str = "batch-settlement";

const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Delayed,
    Waiting,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct JobOpts {
    pub delay: Duration,
    pub attempts: u32,
    pub backoff_base: Duration,
    /// At most one job in {delayed, waiting, active} per key.
    pub dedup_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: u64,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempts: u32,
    pub attempts_made: u32,
}

struct Job {
    queue: String,
    job_type: String,
    payload: serde_json::Value,
    state: JobState,
    attempts: u32,
    attempts_made: u32,
    backoff_base: Duration,
    fire_at: Instant,
    dedup_key: Option<String>,
}

pub type JobHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct State {
    next_id: u64,
    jobs: HashMap<u64, Job>,
    handlers: HashMap<(String, String), JobHandler>,
}

/// In-process delayed job queues. Workers tick per queue, promote due jobs
/// and dispatch them to registered handlers with bounded concurrency. A
/// failed attempt is rescheduled with exponential backoff unless the error
/// is non-retriable or the attempt budget is spent.
pub struct Scheduler {
    state: Mutex<State>,
    tick: Duration,
    concurrency: usize,
    telemetry: EngineTelemetry,
}

impl Scheduler {
    pub fn new(tick: Duration, concurrency: usize, telemetry: EngineTelemetry) -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 0,
                jobs: HashMap::new(),
                handlers: HashMap::new(),
            }),
            tick: tick.max(Duration::from_millis(10)),
            concurrency: concurrency.max(1),
            telemetry,
        }
    }

    pub async fn register(&self, queue: &str, job_type: &str, handler: JobHandler) {
        let mut state = self.state.lock().await;
        state
            .handlers
            .insert((queue.to_string(), job_type.to_string()), handler);
    }

    pub async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        opts: JobOpts,
    ) -> u64 {
        let mut state = self.state.lock().await;
        if let Some(key) = &opts.dedup_key
            && let Some((existing, _)) = state.jobs.iter().find(|(_, j)| {
                j.dedup_key.as_deref() == Some(key.as_str())
                    && matches!(j.state, JobState::Delayed | JobState::Waiting | JobState::Active)
            })
        {
            return *existing;
        }

        state.next_id += 1;
        let job_id = state.next_id;
        state.jobs.insert(
            job_id,
            Job {
                queue: queue.to_string(),
                job_type: job_type.to_string(),
                payload,
                state: JobState::Delayed,
                attempts: opts.attempts.max(1),
                attempts_made: 0,
                backoff_base: opts.backoff_base,
                fire_at: Instant::now() + opts.delay,
                dedup_key: opts.dedup_key,
            },
        );
        tracing::debug!(job_id, queue, job_type, "job enqueued");
        job_id
    }

    pub async fn scan(&self, queue: &str, states: &[JobState]) -> Vec<JobRecord> {
        let state = self.state.lock().await;
        let mut out: Vec<JobRecord> = state
            .jobs
            .iter()
            .filter(|(_, j)| j.queue == queue && states.contains(&j.state))
            .map(|(id, j)| JobRecord {
                job_id: *id,
                queue: j.queue.clone(),
                job_type: j.job_type.clone(),
                payload: j.payload.clone(),
                state: j.state,
                attempts: j.attempts,
                attempts_made: j.attempts_made,
            })
            .collect();
        out.sort_by_key(|r| r.job_id);
        out
    }

    /// Succeeds only while the job has not started executing.
    pub async fn remove(&self, job_id: u64) -> bool {
        let mut state = self.state.lock().await;
        match state.jobs.get(&job_id) {
            Some(j) if matches!(j.state, JobState::Delayed | JobState::Waiting) => {
                state.jobs.remove(&job_id);
                tracing::debug!(job_id, "job removed");
                true
            }
            _ => false,
        }
    }

    /// Runs one worker loop per queue that has registered handlers. Returns
    /// when `shutdown` fires and all in-flight jobs finished.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let queues: Vec<String> = {
            let state = self.state.lock().await;
            let mut qs: Vec<String> = state.handlers.keys().map(|(q, _)| q.clone()).collect();
            qs.sort();
            qs.dedup();
            qs
        };

        let mut join_set: JoinSet<()> = JoinSet::new();
        for queue in queues {
            let this = Arc::clone(&self);
            let shutdown = shutdown.clone();
            join_set.spawn(async move { this.run_queue(queue, shutdown).await });
        }

        while let Some(res) = join_set.join_next().await {
            if let Err(err) = res {
                tracing::warn!(err = %err, "queue worker panicked");
            }
        }
        Ok(())
    }

    async fn run_queue(self: Arc<Self>, queue: String, shutdown: CancellationToken) {
        let mut interval = time::interval(self.tick);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            while in_flight.try_join_next().is_some() {}

            let slots = sem.available_permits();
            if slots == 0 {
                continue;
            }

            for (job_id, handler, payload) in self.claim_due(&queue, slots).await {
                let Ok(permit) = Arc::clone(&sem).acquire_owned().await else {
                    break;
                };
                let this = Arc::clone(&self);
                let queue = queue.clone();
                in_flight.spawn(async move {
                    let started = Instant::now();
                    let res = handler(payload).await;
                    drop(permit);
                    this.settle_attempt(&queue, job_id, started, res).await;
                });
            }
        }

        while in_flight.join_next().await.is_some() {}
    }

    /// Promote due delayed jobs and claim up to `limit` runnable ones.
    async fn claim_due(
        &self,
        queue: &str,
        limit: usize,
    ) -> Vec<(u64, JobHandler, serde_json::Value)> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let mut runnable: Vec<u64> = Vec::new();
        for (id, job) in state.jobs.iter_mut() {
            if job.queue != queue {
                continue;
            }
            if job.state == JobState::Delayed && job.fire_at <= now {
                job.state = JobState::Waiting;
            }
            if job.state == JobState::Waiting {
                runnable.push(*id);
            }
        }
        runnable.sort();
        runnable.truncate(limit);

        let mut out = Vec::with_capacity(runnable.len());
        for id in runnable {
            let Some(job) = state.jobs.get(&id) else { continue };
            let key = (job.queue.clone(), job.job_type.clone());
            let Some(handler) = state.handlers.get(&key).cloned() else {
                tracing::warn!(job_id = id, queue, job_type = %key.1, "no handler for job; failing");
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.state = JobState::Failed;
                }
                self.telemetry.job_failed(queue);
                continue;
            };
            let payload = job.payload.clone();
            if let Some(job) = state.jobs.get_mut(&id) {
                job.state = JobState::Active;
            }
            out.push((id, handler, payload));
        }
        out
    }

    async fn settle_attempt(
        &self,
        queue: &str,
        job_id: u64,
        started: Instant,
        res: Result<()>,
    ) {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return;
        };

        match res {
            Ok(()) => {
                job.state = JobState::Completed;
                self.telemetry.job_ok(queue, elapsed_ms);
            }
            Err(err) => {
                job.attempts_made += 1;
                if !retriable(&err) {
                    job.state = JobState::Failed;
                    self.telemetry.job_failed(queue);
                    tracing::warn!(
                        job_id,
                        queue,
                        job_type = %job.job_type,
                        err = %err,
                        "job failed (not retriable)"
                    );
                } else if job.attempts_made >= job.attempts {
                    job.state = JobState::Failed;
                    self.telemetry.job_failed(queue);
                    tracing::warn!(
                        job_id,
                        queue,
                        job_type = %job.job_type,
                        attempts = job.attempts_made,
                        err = %err,
                        "job failed (attempts exhausted)"
                    );
                } else {
                    let delay = backoff_delay(job.backoff_base, job.attempts_made);
                    job.state = JobState::Delayed;
                    job.fire_at = Instant::now() + delay;
                    self.telemetry.job_retry(queue);
                    tracing::warn!(
                        job_id,
                        queue,
                        job_type = %job.job_type,
                        attempt = job.attempts_made,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        err = %err,
                        "job attempt failed; rescheduled"
                    );
                }
            }
        }
    }
}

/// Exponential backoff with a cap: base, 2*base, 4*base, ...
pub fn backoff_delay(base: Duration, attempts_made: u32) -> Duration {
    let shift = attempts_made.saturating_sub(1).min(10);
    let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GuardFailed;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scheduler() -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            Duration::from_millis(20),
            4,
            EngineTelemetry::new(),
        ))
    }

    fn counting_handler(calls: Arc<AtomicU32>, fail_first: u32) -> JobHandler {
        Arc::new(move |_payload| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < fail_first {
                    anyhow::bail!("transient failure {n}");
                }
                Ok(())
            })
        })
    }

    async fn wait_for_state(
        sched: &Scheduler,
        queue: &str,
        job_id: u64,
        state: JobState,
    ) {
        for _ in 0..200 {
            let found = sched
                .scan(queue, &[state])
                .await
                .iter()
                .any(|r| r.job_id == job_id);
            if found {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} never reached {state:?}");
    }

    #[test]
    fn backoff_grows_exponentially_until_cap() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(20));

        let mut prev = Duration::ZERO;
        for attempts in 1..=20 {
            let d = backoff_delay(base, attempts);
            assert!(d >= prev, "backoff regressed at attempts={attempts}");
            assert!(d <= MAX_BACKOFF);
            prev = d;
        }
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_fires_and_completes() {
        let sched = scheduler();
        let calls = Arc::new(AtomicU32::new(0));
        sched
            .register(
                LIVENESS_QUEUE,
                JOB_CHECK_LIVENESS,
                counting_handler(Arc::clone(&calls), 0),
            )
            .await;

        let job_id = sched
            .enqueue(
                LIVENESS_QUEUE,
                JOB_CHECK_LIVENESS,
                json!({"proposalId": "0xabc"}),
                JobOpts {
                    delay: Duration::from_millis(7_200_000),
                    attempts: 3,
                    backoff_base: Duration::from_secs(5),
                    dedup_key: Some("0xabc".into()),
                },
            )
            .await;

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&sched).run(shutdown.clone()));

        // The job holds in the queue for the whole liveness window.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            sched.scan(LIVENESS_QUEUE, &[JobState::Delayed]).await.len(),
            1
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(7_200_000)).await;
        wait_for_state(&sched, LIVENESS_QUEUE, job_id, JobState::Completed).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_budget_then_succeed() {
        let sched = scheduler();
        let calls = Arc::new(AtomicU32::new(0));
        sched
            .register(
                SETTLEMENT_QUEUE,
                JOB_SETTLE_EVENT,
                counting_handler(Arc::clone(&calls), 2),
            )
            .await;

        let job_id = sched
            .enqueue(
                SETTLEMENT_QUEUE,
                JOB_SETTLE_EVENT,
                json!({"eventId": "e1"}),
                JobOpts {
                    delay: Duration::ZERO,
                    attempts: 5,
                    backoff_base: Duration::from_millis(10),
                    dedup_key: Some("e1".into()),
                },
            )
            .await;

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&sched).run(shutdown.clone()));

        wait_for_state(&sched, SETTLEMENT_QUEUE, job_id, JobState::Completed).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let record = &sched.scan(SETTLEMENT_QUEUE, &[JobState::Completed]).await[0];
        assert_eq!(record.attempts_made, 2);

        shutdown.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_exhaustion_marks_the_job_failed() {
        let sched = scheduler();
        let calls = Arc::new(AtomicU32::new(0));
        sched
            .register(
                SETTLEMENT_QUEUE,
                JOB_SETTLE_EVENT,
                counting_handler(Arc::clone(&calls), u32::MAX),
            )
            .await;

        let job_id = sched
            .enqueue(
                SETTLEMENT_QUEUE,
                JOB_SETTLE_EVENT,
                json!({"eventId": "e1"}),
                JobOpts {
                    delay: Duration::ZERO,
                    attempts: 3,
                    backoff_base: Duration::from_millis(5),
                    dedup_key: None,
                },
            )
            .await;

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&sched).run(shutdown.clone()));

        wait_for_state(&sched, SETTLEMENT_QUEUE, job_id, JobState::Failed).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn guard_failures_are_not_retried() {
        let sched = scheduler();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        sched
            .register(
                LIVENESS_QUEUE,
                JOB_CHECK_LIVENESS,
                Arc::new(move |_payload| {
                    let calls = Arc::clone(&calls_in);
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(GuardFailed("dispute open".into()).into())
                    })
                }),
            )
            .await;

        let job_id = sched
            .enqueue(
                LIVENESS_QUEUE,
                JOB_CHECK_LIVENESS,
                json!({"proposalId": "0xabc"}),
                JobOpts {
                    delay: Duration::ZERO,
                    attempts: 3,
                    backoff_base: Duration::from_secs(5),
                    dedup_key: None,
                },
            )
            .await;

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&sched).run(shutdown.clone()));

        wait_for_state(&sched, LIVENESS_QUEUE, job_id, JobState::Failed).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dedup_key_keeps_a_single_live_job() {
        let sched = scheduler();
        let opts = JobOpts {
            delay: Duration::from_secs(3600),
            attempts: 3,
            backoff_base: Duration::from_secs(5),
            dedup_key: Some("0xabc".into()),
        };
        let first = sched
            .enqueue(LIVENESS_QUEUE, JOB_CHECK_LIVENESS, json!({}), opts.clone())
            .await;
        let second = sched
            .enqueue(LIVENESS_QUEUE, JOB_CHECK_LIVENESS, json!({}), opts.clone())
            .await;
        assert_eq!(first, second);
        assert_eq!(
            sched
                .scan(LIVENESS_QUEUE, &[JobState::Delayed, JobState::Waiting])
                .await
                .len(),
            1
        );

        // Once removed, the key is free again.
        assert!(sched.remove(first).await);
        let third = sched
            .enqueue(LIVENESS_QUEUE, JOB_CHECK_LIVENESS, json!({}), opts)
            .await;
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn remove_only_touches_jobs_that_have_not_started() {
        let sched = scheduler();
        let job_id = sched
            .enqueue(
                LIVENESS_QUEUE,
                JOB_CHECK_LIVENESS,
                json!({}),
                JobOpts {
                    delay: Duration::from_secs(3600),
                    attempts: 3,
                    backoff_base: Duration::from_secs(5),
                    dedup_key: None,
                },
            )
            .await;

        assert!(sched.remove(job_id).await);
        assert!(!sched.remove(job_id).await);
        assert!(sched.scan(LIVENESS_QUEUE, &[JobState::Delayed]).await.is_empty());
    }
}
