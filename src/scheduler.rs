//! Background job scheduler.
//!
//! One process-wide worker pool executes jobs tagged with a `repo_key`.
//! Jobs sharing a key run serially in submission order; jobs with distinct
//! keys run in parallel up to the pool size.  Periodic jobs are registered
//! at most once per `(repo_key, name)` pair and enqueue a fresh submission
//! on every tick.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Number of jobs that may execute concurrently across all queues.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// A job body.  Receives a token cancelled when the scheduler shuts down.
pub type JobFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct QueuedJob {
    name: String,
    run: JobFn,
}

#[derive(Default)]
struct Queues {
    // repo_key -> pending jobs; presence of the key means a drain task is
    // running or about to run.
    pending: HashMap<String, VecDeque<QueuedJob>>,
    draining: HashSet<String>,
}

struct Inner {
    pool: Arc<Semaphore>,
    queues: Mutex<Queues>,
    periodic: Mutex<HashSet<(String, String)>>,
    shutdown: CancellationToken,
}

/// Handle to the scheduler.  Cloning is cheap; [`Scheduler::with_queue_prefix`]
/// derives a handle whose submissions are namespaced under `prefix:`.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    prefix: String,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        info!(concurrency, "job scheduler started");
        Self {
            inner: Arc::new(Inner {
                pool: Arc::new(Semaphore::new(concurrency)),
                queues: Mutex::new(Queues::default()),
                periodic: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
            prefix: String::new(),
        }
    }

    /// A handle that prepends `prefix:` to every `repo_key`, isolating queue
    /// namespaces between strategies.
    pub fn with_queue_prefix(&self, prefix: &str) -> Scheduler {
        Scheduler {
            inner: Arc::clone(&self.inner),
            prefix: format!("{}{}:", self.prefix, prefix),
        }
    }

    fn qualified(&self, repo_key: &str) -> String {
        format!("{}{}", self.prefix, repo_key)
    }

    /// Submit a one-shot job, queued behind any in-flight work for
    /// `repo_key`.
    pub fn submit<F>(&self, repo_key: &str, name: &str, job: F)
    where
        F: Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.submit_fn(repo_key, name, Arc::new(job));
    }

    fn submit_fn(&self, repo_key: &str, name: &str, job: JobFn) {
        let key = self.qualified(repo_key);
        if self.inner.shutdown.is_cancelled() {
            debug!(%key, name, "scheduler shut down, dropping job");
            return;
        }

        let spawn_drain = {
            let mut queues = self.inner.queues.lock().expect("scheduler lock poisoned");
            queues.pending.entry(key.clone()).or_default().push_back(QueuedJob {
                name: name.to_string(),
                run: job,
            });
            queues.draining.insert(key.clone())
        };

        if spawn_drain {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                drain_queue(inner, key).await;
            });
        }
    }

    /// Idempotently register a periodic job.  The first `(repo_key, name)`
    /// registration starts a timer; later ones are no-ops.  A zero period
    /// registers without scheduling anything.
    pub fn submit_periodic_job<F>(&self, repo_key: &str, name: &str, period: Duration, job: F)
    where
        F: Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let key = self.qualified(repo_key);
        {
            let mut periodic = self.inner.periodic.lock().expect("scheduler lock poisoned");
            if !periodic.insert((key.clone(), name.to_string())) {
                return;
            }
        }
        if period.is_zero() {
            debug!(%key, name, "periodic job registered with zero period, not scheduling");
            return;
        }

        let scheduler = Scheduler {
            inner: Arc::clone(&self.inner),
            prefix: String::new(),
        };
        let name = name.to_string();
        let job: JobFn = Arc::new(job);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticks.tick() => {}
                }
                let job = Arc::clone(&job);
                scheduler.submit_fn(&key, &name, job);
            }
        });
    }

    /// Cancel the root context.  Queued jobs still drain, but each job
    /// observes a cancelled token.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

async fn drain_queue(inner: Arc<Inner>, key: String) {
    loop {
        let job = {
            let mut queues = inner.queues.lock().expect("scheduler lock poisoned");
            match queues.pending.get_mut(&key).and_then(VecDeque::pop_front) {
                Some(job) => job,
                None => {
                    queues.pending.remove(&key);
                    queues.draining.remove(&key);
                    return;
                }
            }
        };

        let Ok(permit) = inner.pool.clone().acquire_owned().await else {
            return;
        };
        let token = inner.shutdown.child_token();
        debug!(repo_key = %key, job = %job.name, "running job");
        if let Err(err) = (job.run)(token).await {
            error!(repo_key = %key, job = %job.name, error = %err, "job failed");
        }
        drop(permit);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;

    fn scheduler(concurrency: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig { concurrency })
    }

    #[tokio::test]
    async fn same_key_jobs_run_in_submission_order() {
        let sched = scheduler(8);
        let log = Arc::new(Mutex::new(Vec::new()));

        for index in 0..20 {
            let log = Arc::clone(&log);
            sched.submit("repo-a", "ordered", move |_cancel| {
                let log = Arc::clone(&log);
                async move {
                    // Stagger to expose any overlap.
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    log.lock().unwrap().push(index);
                    Ok(())
                }
                .boxed()
            });
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        let log = log.lock().unwrap();
        assert_eq!(*log, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn same_key_jobs_never_overlap() {
        let sched = scheduler(8);
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            sched.submit("repo-serial", "overlap-check", move |_cancel| {
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            });
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_in_parallel() {
        let sched = scheduler(4);
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        for index in 0..4 {
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            sched.submit(&format!("repo-{index}"), "parallel", move |_cancel| {
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            });
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(max_active.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn periodic_registration_is_idempotent() {
        let sched = scheduler(2);
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = Arc::clone(&runs);
            sched.submit_periodic_job(
                "repo-periodic",
                "tick",
                Duration::from_millis(30),
                move |_cancel| {
                    let runs = Arc::clone(&runs);
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                    .boxed()
                },
            );
        }

        tokio::time::sleep(Duration::from_millis(110)).await;
        sched.shutdown();
        // One timer, roughly one run per 30ms. Three registrations would
        // have produced about three times as many.
        let count = runs.load(Ordering::SeqCst);
        assert!((1..=5).contains(&count), "unexpected run count {count}");
    }

    #[tokio::test]
    async fn zero_period_registers_without_running() {
        let sched = scheduler(2);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        sched.submit_periodic_job("repo-disabled", "never", Duration::ZERO, move |_cancel| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn queue_prefix_isolates_keys() {
        let sched = scheduler(8);
        let git = sched.with_queue_prefix("git");
        let gomod = sched.with_queue_prefix("gomod");

        // Same repo_key under different prefixes must run concurrently,
        // proving they are distinct queues.
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        for handle in [&git, &gomod] {
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            handle.submit("https://github.com/org/repo", "work", move |_cancel| {
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            });
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(max_active.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_job_does_not_block_the_queue() {
        let sched = scheduler(2);
        let ran = Arc::new(AtomicUsize::new(0));

        sched.submit("repo-fail", "boom", |_cancel| {
            async { anyhow::bail!("deliberate failure") }.boxed()
        });
        let counter = Arc::clone(&ran);
        sched.submit("repo-fail", "after", move |_cancel| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
