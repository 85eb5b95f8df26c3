//! Reconciler implementation.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::cache::RuleCache;
use crate::error::{Error, Result};
use crate::gateway::{
    ControllerSwitch, GateGuard, GaugeReporter, PolicyEngine, ProcessingGate, ResourceStore,
    StatsReporter,
};
use crate::types::{
    Constraint, EnforcementAction, ReconcileOutcome, Rule, RuleKey, RuleStatus, StatusError, Tag,
};

/// Finalizer attached to every constraint the reconciler has taken over.
pub const DEFAULT_FINALIZER: &str = "finalizers.gatekeeper.sh/constraint";

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Lifecycle marker that blocks physical deletion until the rule is
    /// unloaded.
    pub finalizer_name: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            finalizer_name: DEFAULT_FINALIZER.to_string(),
        }
    }
}

/// Bookkeeping carried through one pass.
#[derive(Debug, Default)]
struct Pass {
    cache_mutated: bool,
}

/// Keeps the policy engine, the rule cache and each constraint's status in
/// line with the constraint resources in the store.
///
/// Passes for different keys may run concurrently; the caller must not run
/// two passes for the same key at once.
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    engine: Arc<dyn PolicyEngine>,
    reporter: Arc<dyn StatsReporter>,
    gate: Arc<dyn ProcessingGate>,
    cache: Arc<RuleCache>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        engine: Arc<dyn PolicyEngine>,
        reporter: Arc<dyn StatsReporter>,
        gate: Arc<dyn ProcessingGate>,
        cache: Arc<RuleCache>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            engine,
            reporter,
            gate,
            cache,
            config,
        }
    }

    /// Run one reconciliation pass for `key`.
    ///
    /// # Errors
    ///
    /// Returns store read failures other than not-found, engine failures
    /// other than an unknown rule on removal, and an unparseable enforcement
    /// action. All of them are retryable. Lost write races come back as
    /// [`ReconcileOutcome::Requeue`] instead.
    pub async fn reconcile(&self, key: &RuleKey) -> Result<ReconcileOutcome> {
        let gate = GateGuard::enter(self.gate.as_ref());
        if !gate.enabled() {
            info!(key = %key, "ignoring request, constraint controller disabled");
            return Ok(ReconcileOutcome::Done);
        }

        let constraint = match self.store.get(key).await {
            Ok(constraint) => constraint,
            Err(e) if e.is_not_found() => {
                debug!(key = %key, "Constraint gone, nothing to do");
                return Ok(ReconcileOutcome::Done);
            }
            Err(e) => return Err(e),
        };

        let mut pass = Pass::default();
        let result = if constraint.deletion_requested() {
            self.finalize(constraint, &mut pass).await
        } else {
            self.sync(constraint, &mut pass).await
        };

        if pass.cache_mutated {
            self.cache.report(self.reporter.as_ref()).await;
        }
        result
    }

    /// Make sure the constraint's rule is loaded and its status says so.
    async fn sync(&self, mut constraint: Constraint, pass: &mut Pass) -> Result<ReconcileOutcome> {
        let key = constraint.key();
        let action = constraint.enforcement_action()?;
        let finalizer = self.config.finalizer_name.as_str();

        if !constraint.has_finalizer(finalizer) {
            constraint = match self.attach_finalizer(constraint).await {
                Ok(written) => written,
                Err(e) => {
                    debug!(key = %key, error = %e, "Could not attach finalizer, requeueing");
                    return Ok(ReconcileOutcome::requeue(format!("attaching finalizer: {e}")));
                }
            };
        }

        info!(key = %key, action = %action, "handling constraint update");
        let mut status = constraint.status_or_default();
        status.errors.clear();

        let rule = Rule::from(&constraint);
        if !self.is_loaded(&rule).await {
            if let Err(e) = self.engine.add_rule(rule).await {
                self.cache
                    .put(key.clone(), Tag::new(action, RuleStatus::Error))
                    .await;
                pass.cache_mutated = true;

                status.enforced = false;
                status.errors.push(StatusError::new(e.detail()));
                constraint.status = Some(status);
                if let Err(e2) = self.store.update_status(&constraint).await {
                    error!(key = %key, error = %e2, "could not report constraint error status");
                }
                warn!(key = %key, error = %e, "Rule registration failed");
                return Err(e);
            }
            log_addition(&key, action);
        }

        status.enforced = true;
        constraint.status = Some(status);
        if let Err(e) = self.store.update_status(&constraint).await {
            debug!(key = %key, error = %e, "Could not write enforced status, requeueing");
            return Ok(ReconcileOutcome::requeue(format!("writing status: {e}")));
        }

        self.cache
            .put(key, Tag::new(action, RuleStatus::Active))
            .await;
        pass.cache_mutated = true;
        Ok(ReconcileOutcome::Done)
    }

    /// Write the finalizer onto `constraint`. The store does not echo status
    /// on a main-resource write, so the status read at the start of the pass
    /// is carried over onto the written copy.
    async fn attach_finalizer(&self, mut constraint: Constraint) -> Result<Constraint> {
        let status = constraint.status.take();
        constraint.add_finalizer(&self.config.finalizer_name);
        let mut written = self.store.update(&constraint).await?;
        written.status = status;
        Ok(written)
    }

    /// Unload the rule, then release the finalizer.
    async fn finalize(
        &self,
        mut constraint: Constraint,
        pass: &mut Pass,
    ) -> Result<ReconcileOutcome> {
        let key = constraint.key();
        let finalizer = self.config.finalizer_name.as_str();
        if !constraint.has_finalizer(finalizer) {
            debug!(key = %key, "Deletion already processed");
            return Ok(ReconcileOutcome::Done);
        }

        // Deletion must not stall on a spec we can no longer parse.
        let action = constraint.enforcement_action().ok();
        match self.engine.remove_rule(&key).await {
            Ok(true) => {}
            Ok(false) => debug!(key = %key, "Rule already absent from policy engine"),
            Err(e) if e.is_unknown_rule() => {
                debug!(key = %key, "Rule already absent from policy engine");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Rule removal failed, keeping finalizer");
                return Err(e);
            }
        }
        log_removal(&key, action);

        constraint.remove_finalizer(finalizer);
        if let Err(e) = self.store.update(&constraint).await {
            debug!(key = %key, error = %e, "Could not release finalizer, requeueing");
            return Ok(ReconcileOutcome::requeue(format!("removing finalizer: {e}")));
        }

        self.cache.remove(&key).await;
        pass.cache_mutated = true;
        Ok(ReconcileOutcome::Done)
    }

    /// Whether the engine already holds a rule with the same content.
    /// Lookup failures count as "not loaded" so the rule gets re-added.
    async fn is_loaded(&self, rule: &Rule) -> bool {
        match self.engine.get_rule(&rule.key()).await {
            Ok(existing) => existing.semantic_eq(rule),
            Err(e) => {
                if !e.is_unknown_rule() {
                    debug!(key = %rule.key(), error = %e, "Rule lookup failed");
                }
                false
            }
        }
    }

    /// The shared rule cache.
    pub fn cache(&self) -> &Arc<RuleCache> {
        &self.cache
    }

    /// The resource store.
    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }
}

fn log_addition(key: &RuleKey, action: EnforcementAction) {
    info!(
        event_type = "constraint_added",
        constraint_kind = %key.kind,
        constraint_name = %key.name,
        constraint_action = %action,
        constraint_status = "enforced",
        "constraint added to policy engine"
    );
}

fn log_removal(key: &RuleKey, action: Option<EnforcementAction>) {
    info!(
        event_type = "constraint_removed",
        constraint_kind = %key.kind,
        constraint_name = %key.name,
        constraint_action = action.map_or("unknown", EnforcementAction::as_str),
        constraint_status = "unenforced",
        "constraint removed from policy engine"
    );
}

/// Builder for Reconciler.
pub struct ReconcilerBuilder {
    store: Option<Arc<dyn ResourceStore>>,
    engine: Option<Arc<dyn PolicyEngine>>,
    reporter: Option<Arc<dyn StatsReporter>>,
    gate: Option<Arc<dyn ProcessingGate>>,
    cache: Option<Arc<RuleCache>>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            store: None,
            engine: None,
            reporter: None,
            gate: None,
            cache: None,
            config: ReconcilerConfig::default(),
        }
    }

    /// Set the resource store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the policy engine.
    #[must_use]
    pub fn with_engine(mut self, engine: Arc<dyn PolicyEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the stats reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn StatsReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Set the processing gate.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<dyn ProcessingGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Share an existing rule cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<RuleCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the finalizer name.
    #[must_use]
    pub fn finalizer_name(mut self, name: impl Into<String>) -> Self {
        self.config.finalizer_name = name.into();
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the store or engine is missing or
    /// the finalizer name is empty.
    pub fn build(self) -> Result<Reconciler> {
        let store = self
            .store
            .ok_or_else(|| Error::invalid_config("Resource store is required"))?;
        let engine = self
            .engine
            .ok_or_else(|| Error::invalid_config("Policy engine is required"))?;
        if self.config.finalizer_name.trim().is_empty() {
            return Err(Error::invalid_config("Finalizer name must not be empty"));
        }

        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(GaugeReporter::new()));
        let gate = self
            .gate
            .unwrap_or_else(|| Arc::new(ControllerSwitch::new()));
        let cache = self.cache.unwrap_or_default();

        Ok(Reconciler::new(
            store,
            engine,
            reporter,
            gate,
            cache,
            self.config,
        ))
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::gateway::{InMemoryPolicyEngine, InMemoryResourceStore};
    use crate::types::ConstraintStatus;

    struct Fixture {
        store: Arc<InMemoryResourceStore>,
        engine: Arc<InMemoryPolicyEngine>,
        reporter: Arc<GaugeReporter>,
        switch: Arc<ControllerSwitch>,
        reconciler: Reconciler,
    }

    fn setup_reconciler() -> Option<Fixture> {
        let store = InMemoryResourceStore::new_arc();
        let engine = Arc::new(InMemoryPolicyEngine::new());
        let reporter = Arc::new(GaugeReporter::new());
        let switch = Arc::new(ControllerSwitch::new());
        let reconciler = ReconcilerBuilder::new()
            .with_store(store.clone())
            .with_engine(engine.clone())
            .with_reporter(reporter.clone())
            .with_gate(switch.clone())
            .build()
            .ok()?;
        Some(Fixture {
            store,
            engine,
            reporter,
            switch,
            reconciler,
        })
    }

    fn key() -> RuleKey {
        RuleKey::new("K", "a")
    }

    #[tokio::test]
    async fn test_reconcile_missing_is_noop() {
        let Some(f) = setup_reconciler() else {
            return;
        };
        let outcome = f.reconciler.reconcile(&key()).await;
        assert_eq!(outcome, Ok(ReconcileOutcome::Done));
        assert_eq!(f.engine.writes(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_loads_rule_and_marks_enforced() {
        let Some(f) = setup_reconciler() else {
            return;
        };
        let _ = f.store.create(Constraint::new("K", "a", json!({}))).await;

        let outcome = f.reconciler.reconcile(&key()).await;
        assert_eq!(outcome, Ok(ReconcileOutcome::Done));

        let stored = f.store.get(&key()).await.ok();
        assert!(stored.as_ref().is_some_and(|c| c.has_finalizer(DEFAULT_FINALIZER)));
        assert_eq!(
            stored.and_then(|c| c.status).map(|s| s.enforced),
            Some(true)
        );
        assert!(f.engine.contains(&key()).await);
        assert_eq!(
            f.reconciler.cache().get(&key()).await,
            Some(Tag::new(EnforcementAction::Deny, RuleStatus::Active))
        );
        assert_eq!(
            f.reporter
                .snapshot()
                .await
                .get(&Tag::new(EnforcementAction::Deny, RuleStatus::Active)),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_invalid_action_fails_before_any_write() {
        let Some(f) = setup_reconciler() else {
            return;
        };
        let _ = f
            .store
            .create(Constraint::new("K", "a", json!({"enforcementAction": "block"})))
            .await;

        let outcome = f.reconciler.reconcile(&key()).await;
        assert!(matches!(outcome, Err(Error::InvalidEnforcementAction { .. })));
        let stored = f.store.get(&key()).await.ok();
        assert!(stored.is_some_and(|c| c.finalizers.is_empty()));
    }

    #[tokio::test]
    async fn test_closed_gate_skips_pass() {
        let Some(f) = setup_reconciler() else {
            return;
        };
        let _ = f.store.create(Constraint::new("K", "a", json!({}))).await;
        f.switch.stop().await;

        let outcome = f.reconciler.reconcile(&key()).await;
        assert_eq!(outcome, Ok(ReconcileOutcome::Done));
        assert_eq!(f.engine.writes(), 0);
        assert_eq!(f.switch.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_attach_finalizer_keeps_status() {
        let Some(f) = setup_reconciler() else {
            return;
        };
        let prior = ConstraintStatus {
            enforced: false,
            errors: vec![StatusError::new("old failure")],
        };
        let _ = f
            .store
            .create(Constraint::new("K", "a", json!({})).with_status(prior.clone()))
            .await;
        let read = f.store.get(&key()).await;
        assert!(read.is_ok());
        let Ok(read) = read else {
            return;
        };

        let attached = f.reconciler.attach_finalizer(read).await;
        assert!(attached
            .as_ref()
            .is_ok_and(|c| c.has_finalizer(DEFAULT_FINALIZER)));
        assert_eq!(attached.ok().and_then(|c| c.status), Some(prior));
        let stored = f.store.get(&key()).await.ok();
        assert!(stored.is_some_and(|c| c.has_finalizer(DEFAULT_FINALIZER)));
    }

    #[tokio::test]
    async fn test_first_pass_replaces_prior_errors() {
        let Some(f) = setup_reconciler() else {
            return;
        };
        let prior = ConstraintStatus {
            enforced: false,
            errors: vec![StatusError::new("old failure")],
        };
        let _ = f
            .store
            .create(Constraint::new("K", "a", json!({})).with_status(prior))
            .await;

        let outcome = f.reconciler.reconcile(&key()).await;
        assert_eq!(outcome, Ok(ReconcileOutcome::Done));

        let status = f.store.get(&key()).await.ok().and_then(|c| c.status);
        assert_eq!(
            status,
            Some(ConstraintStatus {
                enforced: true,
                errors: Vec::new(),
            })
        );
    }

    #[tokio::test]
    async fn test_deletion_unloads_rule_and_clears_cache() {
        let Some(f) = setup_reconciler() else {
            return;
        };
        let _ = f.store.create(Constraint::new("K", "a", json!({}))).await;
        let _ = f.reconciler.reconcile(&key()).await;
        assert!(f.store.request_deletion(&key()).await.is_ok());

        let outcome = f.reconciler.reconcile(&key()).await;
        assert_eq!(outcome, Ok(ReconcileOutcome::Done));
        assert!(!f.engine.contains(&key()).await);
        assert!(f.store.get(&key()).await.is_err_and(|e| e.is_not_found()));
        assert!(f.reconciler.cache().is_empty().await);
    }

    #[test]
    fn test_builder_requires_store_and_engine() {
        let result = ReconcilerBuilder::new().build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));

        let result = ReconcilerBuilder::new()
            .with_store(InMemoryResourceStore::new_arc())
            .with_engine(Arc::new(InMemoryPolicyEngine::new()))
            .finalizer_name(" ")
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}
