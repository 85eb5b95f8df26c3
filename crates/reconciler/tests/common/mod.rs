//! Scripted gateway doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use constraint_reconciler::{
    Constraint, ControllerSwitch, Error, GaugeReporter, InMemoryPolicyEngine,
    InMemoryResourceStore, PolicyEngine, Reconciler, ReconcilerBuilder, ResourceStore, Result,
    Rule, RuleKey,
};

/// Ordered record of gateway calls, shared between doubles.
#[derive(Default)]
pub struct CallLog {
    calls: Mutex<Vec<String>>,
}

impl CallLog {
    pub fn push(&self, call: impl Into<String>) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.into());
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

/// How the scripted engine answers `remove_rule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveScript {
    Delegate,
    NotFound,
    UnknownRuleError,
    Fail,
}

/// Policy engine that delegates to an in-memory engine unless told to fail.
pub struct ScriptedEngine {
    inner: InMemoryPolicyEngine,
    log: Arc<CallLog>,
    add_failure: Mutex<Option<String>>,
    remove: Mutex<RemoveScript>,
}

impl ScriptedEngine {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self {
            inner: InMemoryPolicyEngine::new(),
            log,
            add_failure: Mutex::new(None),
            remove: Mutex::new(RemoveScript::Delegate),
        }
    }

    pub fn fail_adds(&self, reason: Option<&str>) {
        if let Ok(mut slot) = self.add_failure.lock() {
            *slot = reason.map(ToString::to_string);
        }
    }

    pub fn script_remove(&self, script: RemoveScript) {
        if let Ok(mut slot) = self.remove.lock() {
            *slot = script;
        }
    }

    pub async fn contains(&self, key: &RuleKey) -> bool {
        self.inner.contains(key).await
    }
}

#[async_trait]
impl PolicyEngine for ScriptedEngine {
    async fn get_rule(&self, key: &RuleKey) -> Result<Rule> {
        self.log.push(format!("engine.get {key}"));
        self.inner.get_rule(key).await
    }

    async fn add_rule(&self, rule: Rule) -> Result<()> {
        self.log.push(format!("engine.add {}", rule.key()));
        let failure = self.add_failure.lock().ok().and_then(|f| f.clone());
        match failure {
            Some(reason) => Err(Error::registration_failed(rule.key().to_string(), reason)),
            None => self.inner.add_rule(rule).await,
        }
    }

    async fn remove_rule(&self, key: &RuleKey) -> Result<bool> {
        self.log.push(format!("engine.remove {key}"));
        let script = self
            .remove
            .lock()
            .map(|s| *s)
            .unwrap_or(RemoveScript::Delegate);
        match script {
            RemoveScript::Delegate => self.inner.remove_rule(key).await,
            RemoveScript::NotFound => Ok(false),
            RemoveScript::UnknownRuleError => Err(Error::unknown_rule(key.to_string())),
            RemoveScript::Fail => Err(Error::engine_failed("remove", "engine unreachable")),
        }
    }
}

/// Resource store that logs calls and can inject write conflicts.
pub struct ScriptedStore {
    pub inner: Arc<InMemoryResourceStore>,
    log: Arc<CallLog>,
    conflict_updates: AtomicUsize,
    conflict_status_updates: AtomicUsize,
    fail_status_updates: AtomicBool,
    fail_gets: AtomicBool,
}

impl ScriptedStore {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self {
            inner: InMemoryResourceStore::new_arc(),
            log,
            conflict_updates: AtomicUsize::new(0),
            conflict_status_updates: AtomicUsize::new(0),
            fail_status_updates: AtomicBool::new(false),
            fail_gets: AtomicBool::new(false),
        }
    }

    /// Make the next `n` `update` calls fail with a conflict.
    pub fn conflict_next_updates(&self, n: usize) {
        self.conflict_updates.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` `update_status` calls fail with a conflict.
    pub fn conflict_next_status_updates(&self, n: usize) {
        self.conflict_status_updates.store(n, Ordering::SeqCst);
    }

    /// Make every `update_status` call fail with a store error.
    pub fn fail_status_updates(&self, fail: bool) {
        self.fail_status_updates.store(fail, Ordering::SeqCst);
    }

    /// Make every `get` call fail with a store error.
    pub fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ResourceStore for ScriptedStore {
    async fn get(&self, key: &RuleKey) -> Result<Constraint> {
        self.log.push(format!("store.get {key}"));
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(Error::store_failed("get", "connection refused"));
        }
        self.inner.get(key).await
    }

    async fn list(&self) -> Result<Vec<RuleKey>> {
        self.inner.list().await
    }

    async fn update(&self, constraint: &Constraint) -> Result<Constraint> {
        self.log.push(format!(
            "store.update {} finalizers={}",
            constraint.key(),
            constraint.finalizers.len()
        ));
        if Self::take_one(&self.conflict_updates) {
            return Err(Error::conflict(constraint.key().to_string(), "injected"));
        }
        self.inner.update(constraint).await
    }

    async fn update_status(&self, constraint: &Constraint) -> Result<Constraint> {
        self.log.push(format!("store.update_status {}", constraint.key()));
        if self.fail_status_updates.load(Ordering::SeqCst) {
            return Err(Error::store_failed("update_status", "etcd timeout"));
        }
        if Self::take_one(&self.conflict_status_updates) {
            return Err(Error::conflict(constraint.key().to_string(), "injected"));
        }
        self.inner.update_status(constraint).await
    }
}

pub struct Harness {
    pub log: Arc<CallLog>,
    pub store: Arc<ScriptedStore>,
    pub engine: Arc<ScriptedEngine>,
    pub reporter: Arc<GaugeReporter>,
    pub switch: Arc<ControllerSwitch>,
    pub reconciler: Reconciler,
}

pub fn harness() -> Result<Harness> {
    let log = Arc::new(CallLog::default());
    let store = Arc::new(ScriptedStore::new(log.clone()));
    let engine = Arc::new(ScriptedEngine::new(log.clone()));
    let reporter = Arc::new(GaugeReporter::new());
    let switch = Arc::new(ControllerSwitch::new());
    let reconciler = ReconcilerBuilder::new()
        .with_store(store.clone())
        .with_engine(engine.clone())
        .with_reporter(reporter.clone())
        .with_gate(switch.clone())
        .build()?;
    Ok(Harness {
        log,
        store,
        engine,
        reporter,
        switch,
        reconciler,
    })
}

pub fn key() -> RuleKey {
    RuleKey::new("K", "a")
}
