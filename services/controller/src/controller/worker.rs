//! Reconcile worker.
//!
//! Drives [`ClassifierReconciler`] over every stored declaration:
//! - every tick, declarations that are due are dispatched, at most one
//!   in-flight attempt per declaration and at most `concurrency` overall
//! - a successful or terminal attempt is re-run after the resync interval
//! - a `RetryAfter` attempt is re-run after the longer of the requested delay
//!   and the per-declaration exponential backoff

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use fleetclass_names::DeclarationName;
use fleetclass_reconcile::{Backoff, Directive, RetryTracker, DEFAULT_RESYNC_INTERVAL};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::reconciler::{AttemptSummary, ClassifierReconciler};
use crate::store::DeclarationStore;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often due declarations are looked up.
    pub tick: Duration,
    pub resync_interval: Duration,
    /// Maximum number of declarations reconciled in parallel.
    pub concurrency: usize,
    pub backoff: Backoff,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            concurrency: 8,
            backoff: Backoff::default(),
        }
    }
}

/// Per-declaration dispatch bookkeeping.
#[derive(Debug)]
pub struct DispatchSchedule {
    next_run: BTreeMap<DeclarationName, Instant>,
    in_flight: BTreeSet<DeclarationName>,
    retries: RetryTracker,
    resync_interval: Duration,
}

impl DispatchSchedule {
    pub fn new(resync_interval: Duration, backoff: Backoff) -> Self {
        Self {
            next_run: BTreeMap::new(),
            in_flight: BTreeSet::new(),
            retries: RetryTracker::new(backoff),
            resync_interval,
        }
    }

    /// Declarations in `names` that should run at `now`, up to `limit`.
    ///
    /// Names never seen before are due immediately.
    pub fn due(&self, names: &[DeclarationName], now: Instant, limit: usize) -> Vec<DeclarationName> {
        names
            .iter()
            .filter(|name| !self.in_flight.contains(*name))
            .filter(|name| self.next_run.get(*name).map_or(true, |at| *at <= now))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn start(&mut self, name: &DeclarationName) {
        self.in_flight.insert(name.clone());
    }

    /// Record the end of an attempt and return when the next one is due.
    pub fn complete(&mut self, name: &DeclarationName, directive: &Directive, now: Instant) -> Instant {
        self.in_flight.remove(name);
        let delay = match directive {
            Directive::RetryAfter(hint) => self.retries.record_failure(name.as_str(), Some(*hint)),
            Directive::Success | Directive::TerminalFailure(_) => {
                self.retries.clear(name.as_str());
                self.resync_interval
            }
        };
        let next = now + delay;
        self.next_run.insert(name.clone(), next);
        next
    }

    /// Drop bookkeeping for declarations no longer stored.
    pub fn forget_missing(&mut self, live: &[DeclarationName]) {
        let live: BTreeSet<&DeclarationName> = live.iter().collect();
        self.next_run.retain(|name, _| live.contains(name));
        self.retries.retain(|key| live.iter().any(|name| name.as_str() == key));
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn failures(&self, name: &DeclarationName) -> u32 {
        self.retries.failures(name.as_str())
    }
}

type AttemptResult = (DeclarationName, Result<AttemptSummary, JoinError>);

/// Background worker running reconciliation attempts.
pub struct ReconcileWorker {
    reconciler: Arc<ClassifierReconciler>,
    store: Arc<dyn DeclarationStore>,
    config: WorkerConfig,
}

impl ReconcileWorker {
    pub fn new(
        reconciler: Arc<ClassifierReconciler>,
        store: Arc<dyn DeclarationStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            reconciler,
            store,
            config,
        }
    }

    /// Run until shutdown is signaled. In-flight attempts are allowed to finish.
    #[instrument(skip(self, shutdown), name = "reconcile_worker")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_ms = self.config.tick.as_millis() as u64,
            resync_secs = self.config.resync_interval.as_secs(),
            concurrency = self.config.concurrency,
            "Starting reconcile worker"
        );

        let mut schedule = DispatchSchedule::new(self.config.resync_interval, self.config.backoff);
        let mut attempts: JoinSet<AttemptResult> = JoinSet::new();
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.dispatch(&mut schedule, &mut attempts).await;
                }
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    handle_joined(&mut schedule, joined);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(in_flight = schedule.in_flight(), "Reconcile worker shutting down");
                        break;
                    }
                }
            }
        }

        while let Some(joined) = attempts.join_next().await {
            handle_joined(&mut schedule, joined);
        }
        info!("Reconcile worker stopped");
    }

    async fn dispatch(&self, schedule: &mut DispatchSchedule, attempts: &mut JoinSet<AttemptResult>) {
        let names = match self.store.list_names().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Failed to list declarations");
                return;
            }
        };
        schedule.forget_missing(&names);

        let capacity = self.config.concurrency.saturating_sub(schedule.in_flight());
        for name in schedule.due(&names, Instant::now(), capacity) {
            schedule.start(&name);
            let reconciler = Arc::clone(&self.reconciler);
            let key = name.clone();
            attempts.spawn(async move {
                // Inner task so a panicking attempt still reports its name.
                let attempt = tokio::spawn(async move { reconciler.reconcile(&key).await });
                (name, attempt.await)
            });
        }
    }
}

fn handle_joined(
    schedule: &mut DispatchSchedule,
    joined: Result<AttemptResult, JoinError>,
) {
    let (name, result) = match joined {
        Ok(attempt) => attempt,
        Err(e) => {
            error!(error = %e, "Reconcile task aborted");
            return;
        }
    };

    let directive = match result {
        Ok(summary) => summary.directive,
        Err(e) => {
            error!(declaration = %name, error = %e, "Reconcile attempt panicked");
            Directive::RetryAfter(Duration::ZERO)
        }
    };

    if let Directive::TerminalFailure(reason) = &directive {
        warn!(declaration = %name, reason = %reason, "Declaration parked until next resync");
    }

    let next = schedule.complete(&name, &directive, Instant::now());
    debug!(
        declaration = %name,
        directive = %directive,
        failures = schedule.failures(&name),
        next_in_ms = next.saturating_duration_since(Instant::now()).as_millis() as u64,
        "Attempt scheduled"
    );
}
