//! Reconciliation loop that keeps a policy engine's rule set in sync with
//! declarative constraint resources.
//!
//! Each constraint resource describes one policy rule. For every change
//! notification the [`Reconciler`] fetches the constraint and converges three
//! things on it:
//!
//! - **Policy engine**: the rule is loaded while the constraint lives and
//!   unloaded before it is allowed to disappear
//! - **Status**: `enforced` and the last registration errors are written back
//!   to the constraint
//! - **Rule cache**: a shared tally of loaded rules per enforcement action
//!   and status, pushed to a [`StatsReporter`] after every pass that changed it
//!
//! # Key Concepts
//!
//! ## Finalizer
//!
//! A constraint is only taken over once it carries the controller's
//! finalizer. Deletion removes the rule from the engine first and only then
//! releases the finalizer, so a constraint can never vanish while its rule is
//! still loaded.
//!
//! ## Outcomes
//!
//! A pass returns `Ok(ReconcileOutcome::Done)`, `Ok(ReconcileOutcome::Requeue)`
//! when a write lost an optimistic-concurrency race, or `Err` for failures the
//! [`ReconciliationLoop`] retries with backoff.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use constraint_reconciler::{
//!     InMemoryPolicyEngine, InMemoryResourceStore, LoopConfig, ReconcilerBuilder,
//!     ReconciliationLoop,
//! };
//!
//! #[tokio::main]
//! async fn main() -> constraint_reconciler::Result<()> {
//!     let store = InMemoryResourceStore::new_arc();
//!     let reconciler = Arc::new(
//!         ReconcilerBuilder::new()
//!             .with_store(store.clone())
//!             .with_engine(Arc::new(InMemoryPolicyEngine::new()))
//!             .build()?,
//!     );
//!
//!     let control_loop = ReconciliationLoop::new(reconciler, LoopConfig::default())?;
//!     control_loop.run(store.subscribe()).await?;
//!     Ok(())
//! }
//! ```

#![forbid(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod r#loop;
pub mod reconciler;
pub mod types;

// Re-export main types
pub use cache::RuleCache;
pub use config::ControllerConfig;
pub use error::{Error, Result};
pub use gateway::{
    ControllerSwitch, GateGuard, GaugeReporter, InMemoryPolicyEngine, InMemoryResourceStore,
    PolicyEngine, ProcessingGate, ResourceStore, StatsReporter,
};
pub use r#loop::{LoopConfig, LoopStats, LoopStopper, ReconciliationLoop, WorkQueue};
pub use reconciler::{Reconciler, ReconcilerBuilder, ReconcilerConfig, DEFAULT_FINALIZER};
pub use types::{
    Constraint, ConstraintStatus, EnforcementAction, Notification, NotificationKind,
    ReconcileOutcome, Rule, RuleKey, RuleStatus, StatusError, Tag,
};
