// src/sync/scheduler.rs
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::sync::cadence::Cadence;
use crate::sync::diagnostics::Diagnostics;

/// Work the scheduler runs on every accepted trigger.
#[async_trait]
pub trait CycleJob: Send + Sync + 'static {
    async fn run(&self);
}

/// Observable scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Draining,
}

/// What happened to a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Started,
    /// A cycle was already in flight; this trigger is dropped, not queued.
    Skipped,
    /// Stop was requested; no new cycles.
    Stopped,
}

enum Phase {
    Idle,
    Running,
    Draining(Vec<oneshot::Sender<()>>),
}

struct Inner {
    phase: Phase,
    accepting: bool,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    job: Arc<dyn CycleJob>,
    diagnostics: Arc<Diagnostics>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Releases the running flag when a cycle ends, panics included, and wakes
/// anyone waiting for the drain.
struct Completion(Arc<Shared>);

impl Drop for Completion {
    fn drop(&mut self) {
        let waiters = {
            let mut g = self.0.lock();
            match std::mem::replace(&mut g.phase, Phase::Idle) {
                Phase::Draining(waiters) => waiters,
                _ => Vec::new(),
            }
        };
        for w in waiters {
            let _ = w.send(());
        }
    }
}

/// Recurring trigger with at most one cycle in flight.
///
/// The phase flag is flipped under a lock before any `.await`, so two triggers
/// can never both observe `Idle`.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(job: Arc<dyn CycleJob>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            shared: Arc::new(Shared {
                job,
                diagnostics,
                inner: Mutex::new(Inner {
                    phase: Phase::Idle,
                    accepting: true,
                    timer: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        match self.shared.lock().phase {
            Phase::Idle => SchedulerState::Idle,
            Phase::Running => SchedulerState::Running,
            Phase::Draining(_) => SchedulerState::Draining,
        }
    }

    pub fn is_ticking(&self) -> bool {
        self.shared.lock().timer.is_some()
    }

    /// Fire every `cadence.period`, first one period from now. Replaces any
    /// previous timer.
    pub fn start(&self, cadence: &Cadence) {
        let period = cadence.period;
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let timer = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                Scheduler { shared }.fire();
            }
        });

        self.shared.diagnostics.set_interval(&cadence.expression);
        let mut g = self.shared.lock();
        g.accepting = true;
        if let Some(old) = g.timer.replace(timer) {
            old.abort();
        }
    }

    /// Run one cycle now unless one is already in flight.
    pub fn fire(&self) -> Trigger {
        {
            let mut g = self.shared.lock();
            if !g.accepting {
                return Trigger::Stopped;
            }
            if !matches!(g.phase, Phase::Idle) {
                drop(g);
                tracing::debug!(target: "sync", "already polling, waiting until next interval");
                self.shared.diagnostics.record_skipped_trigger();
                return Trigger::Skipped;
            }
            g.phase = Phase::Running;
        }

        self.shared.diagnostics.record_run();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let _done = Completion(shared.clone());
            shared.job.run().await;
        });
        Trigger::Started
    }

    /// Stop the timer and wait for an in-flight cycle to finish on its own.
    /// Never aborts the cycle.
    pub async fn request_stop(&self) {
        let waiter = {
            let mut g = self.shared.lock();
            g.accepting = false;
            if let Some(timer) = g.timer.take() {
                tracing::trace!(target: "sync", "clearing polling interval");
                timer.abort();
            }
            match std::mem::replace(&mut g.phase, Phase::Idle) {
                Phase::Idle => None,
                Phase::Running => {
                    let (tx, rx) = oneshot::channel();
                    g.phase = Phase::Draining(vec![tx]);
                    Some(rx)
                }
                Phase::Draining(mut waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    g.phase = Phase::Draining(waiters);
                    Some(rx)
                }
            }
        };

        if let Some(rx) = waiter {
            tracing::info!(target: "sync", "waiting for the running sync cycle to finish");
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct GatedJob {
        runs: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        gate: Semaphore,
    }

    impl GatedJob {
        fn new(permits: usize) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                gate: Semaphore::new(permits),
            })
        }
    }

    #[async_trait]
    impl CycleJob for GatedJob {
        async fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if let Ok(p) = self.gate.acquire().await {
                p.forget();
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct PanickingJob;

    #[async_trait]
    impl CycleJob for PanickingJob {
        async fn run(&self) {
            panic!("cycle blew up");
        }
    }

    async fn until_idle(s: &Scheduler) {
        while s.state() != SchedulerState::Idle {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn triggers_while_running_are_dropped() {
        let job = GatedJob::new(0);
        let diag = Arc::new(Diagnostics::new());
        let s = Scheduler::new(job.clone(), diag.clone());

        assert_eq!(s.fire(), Trigger::Started);
        for _ in 0..5 {
            assert_eq!(s.fire(), Trigger::Skipped);
            tokio::task::yield_now().await;
        }
        assert_eq!(s.state(), SchedulerState::Running);

        job.gate.add_permits(1);
        until_idle(&s).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        assert_eq!(s.fire(), Trigger::Started);
        job.gate.add_permits(1);
        until_idle(&s).await;

        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
        assert_eq!(job.max_active.load(Ordering::SeqCst), 1);
        let snap = diag.snapshot().schedule;
        assert_eq!(snap.total_run_count, 2);
        assert_eq!(snap.total_skipped_count, 5);
    }

    #[tokio::test]
    async fn stop_waits_for_running_cycle() {
        let job = GatedJob::new(0);
        let s = Scheduler::new(job.clone(), Arc::new(Diagnostics::new()));
        assert_eq!(s.fire(), Trigger::Started);

        let stopper = {
            let s = s.clone();
            tokio::spawn(async move { s.request_stop().await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!stopper.is_finished());
        assert_eq!(s.state(), SchedulerState::Draining);
        assert_eq!(job.active.load(Ordering::SeqCst), 1);

        job.gate.add_permits(1);
        stopper.await.unwrap();
        assert_eq!(job.active.load(Ordering::SeqCst), 0);
        assert_eq!(s.state(), SchedulerState::Idle);
        assert_eq!(s.fire(), Trigger::Stopped);
    }

    #[tokio::test]
    async fn stop_when_idle_returns_at_once() {
        let s = Scheduler::new(GatedJob::new(10), Arc::new(Diagnostics::new()));
        s.request_stop().await;
        assert_eq!(s.state(), SchedulerState::Idle);
        assert_eq!(s.fire(), Trigger::Stopped);
    }

    #[tokio::test]
    async fn panicking_cycle_still_releases_flag() {
        let s = Scheduler::new(Arc::new(PanickingJob), Arc::new(Diagnostics::new()));
        assert_eq!(s.fire(), Trigger::Started);
        until_idle(&s).await;
        assert_eq!(s.fire(), Trigger::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_once_per_period() {
        let job = GatedJob::new(1_000);
        let s = Scheduler::new(job.clone(), Arc::new(Diagnostics::new()));
        let cadence = Cadence::parse("every 1 minute").unwrap();
        s.start(&cadence);
        assert!(s.is_ticking());

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_secs(31)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);

        s.request_stop().await;
        assert!(!s.is_ticking());
        time::sleep(Duration::from_secs(600)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }
}
