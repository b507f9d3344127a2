//! Per-member fan-out.
//!
//! Each member operation runs as its own task with its own timeout. Results
//! are gathered until every task finished or the attempt deadline passed;
//! tasks still running at the deadline are aborted. One task failing never
//! affects its siblings.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::warn;

/// Why a fanned-out task produced no result.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FanOutError {
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("abandoned at attempt deadline")]
    DeadlineExceeded,

    #[error("operation task failed")]
    TaskFailed,
}

/// Run `tasks` concurrently and collect one result per key.
pub async fn fan_out<K, T, Fut>(
    tasks: Vec<(K, Fut)>,
    per_task: Duration,
    deadline: Instant,
) -> BTreeMap<K, Result<T, FanOutError>>
where
    K: Ord + Clone + Send + 'static,
    T: Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let mut set = JoinSet::new();
    let mut pending = BTreeSet::new();

    for (key, task) in tasks {
        pending.insert(key.clone());
        set.spawn(async move { (key, tokio::time::timeout(per_task, task).await) });
    }

    let mut results = BTreeMap::new();
    let mut deadline_hit = false;

    loop {
        match tokio::time::timeout_at(deadline, set.join_next()).await {
            Ok(Some(Ok((key, outcome)))) => {
                pending.remove(&key);
                results.insert(key, outcome.map_err(|_| FanOutError::TimedOut(per_task)));
            }
            Ok(Some(Err(e))) => {
                warn!(error = %e, "Member task failed");
            }
            Ok(None) => break,
            Err(_) => {
                warn!(outstanding = pending.len(), "Attempt deadline reached, abandoning member operations");
                deadline_hit = true;
                set.abort_all();
                break;
            }
        }
    }

    let leftover = if deadline_hit {
        FanOutError::DeadlineExceeded
    } else {
        FanOutError::TaskFailed
    };
    for key in pending {
        results.insert(key, Err(leftover.clone()));
    }

    results
}
