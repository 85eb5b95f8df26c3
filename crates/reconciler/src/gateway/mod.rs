//! Boundaries to the collaborators the reconciler drives.
//!
//! Each collaborator is a trait so the reconciler can be wired to a real
//! control plane or to the in-memory implementations in this module.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Constraint, Rule, RuleKey, Tag};

mod memory;
mod metrics;
mod switch;

pub use memory::{InMemoryPolicyEngine, InMemoryResourceStore};
pub use metrics::GaugeReporter;
pub use switch::{ControllerSwitch, GateGuard};

/// Storage and API layer holding constraint resources.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch the current state of a constraint.
    ///
    /// Returns [`crate::Error::NotFound`] when the resource is absent.
    async fn get(&self, key: &RuleKey) -> Result<Constraint>;

    /// Keys of every stored constraint.
    async fn list(&self) -> Result<Vec<RuleKey>>;

    /// Write metadata and spec. The status sub-object is neither written nor
    /// returned.
    async fn update(&self, constraint: &Constraint) -> Result<Constraint>;

    /// Write only the status sub-object.
    async fn update_status(&self, constraint: &Constraint) -> Result<Constraint>;
}

/// The policy engine's rule set.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Rule currently loaded under `key`.
    ///
    /// Returns [`crate::Error::UnknownRule`] when nothing is loaded.
    async fn get_rule(&self, key: &RuleKey) -> Result<Rule>;

    /// Load or replace a rule.
    async fn add_rule(&self, rule: Rule) -> Result<()>;

    /// Unload a rule. `Ok(false)` means the engine never had it.
    async fn remove_rule(&self, key: &RuleKey) -> Result<bool>;
}

/// Sink for per-tag rule totals.
#[async_trait]
pub trait StatsReporter: Send + Sync {
    /// Record the current number of rules carrying `tag`.
    async fn report(&self, tag: Tag, count: i64) -> Result<()>;
}

/// Shared on/off switch bracketing every reconciliation pass.
pub trait ProcessingGate: Send + Sync {
    /// Register an in-flight pass and report whether processing is enabled.
    fn enter(&self) -> bool;

    /// Release the registration taken by [`ProcessingGate::enter`].
    fn exit(&self);
}
