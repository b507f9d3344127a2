//! Classification controller core.
//!
//! Stages of one reconciliation attempt, leaves first:
//!
//! - [`scope`]: snapshot, diff and conditional commit of a declaration
//! - [`matcher`]: cluster selector parsing and member matching
//! - [`propagator`]: placing and withdrawing agent artifacts on members
//! - [`collector`]: reading and classifying member reports
//! - [`aggregator`]: folding everything into the new status
//! - [`reconciler`]: one attempt, start to commit
//! - [`worker`]: scheduling attempts over all declarations

pub mod aggregator;
pub mod collector;
mod fanout;
pub mod matcher;
pub mod propagator;
pub mod reconciler;
pub mod scope;
pub mod worker;

pub use aggregator::{aggregate, AggregationInput};
pub use collector::{classify_report, Collector, ReportOutcome};
pub use fanout::FanOutError;
pub use matcher::{match_members, matching_members, Selector, SelectorError};
pub use propagator::{build_artifact, PropagationOutcome, PropagationReport, Propagator};
pub use reconciler::{AttemptSummary, ClassifierReconciler, Phase, ReconcilerConfig};
pub use scope::{CommitOutcome, DeclarationScope, PersistError};
pub use worker::{DispatchSchedule, ReconcileWorker, WorkerConfig};
