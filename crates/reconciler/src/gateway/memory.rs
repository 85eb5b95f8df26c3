//! In-memory resource store and policy engine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

use super::{PolicyEngine, ResourceStore};
use crate::error::{Error, Result};
use crate::types::{Constraint, Notification, NotificationKind, Rule, RuleKey};

const NOTIFICATION_CAPACITY: usize = 1024;

/// Resource store backed by a map, with versioned writes and a broadcast
/// notification stream.
///
/// Writes follow control-plane semantics: a write whose `resource_version`
/// does not match the stored one is rejected with [`Error::Conflict`], a
/// write that changes nothing is accepted without bumping the version or
/// notifying, and a deletion-requested resource disappears once its last
/// finalizer is removed.
pub struct InMemoryResourceStore {
    objects: RwLock<HashMap<RuleKey, Constraint>>,
    events: broadcast::Sender<Notification>,
}

impl Default for InMemoryResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResourceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            objects: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Create an empty store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    /// Insert a new constraint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if a constraint with the same key exists.
    pub async fn create(&self, mut constraint: Constraint) -> Result<Constraint> {
        let key = constraint.key();
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(Error::conflict(key.to_string(), "already exists"));
        }
        constraint.resource_version = 1;
        constraint.deletion_timestamp = None;
        objects.insert(key.clone(), constraint.clone());
        drop(objects);

        self.notify(key, NotificationKind::Created);
        Ok(constraint)
    }

    /// Replace the spec of an existing constraint, or create it.
    ///
    /// # Errors
    ///
    /// Propagates [`InMemoryResourceStore::create`] failures.
    pub async fn apply(&self, constraint: Constraint) -> Result<Constraint> {
        let key = constraint.key();
        let mut objects = self.objects.write().await;
        if !objects.contains_key(&key) {
            drop(objects);
            return self.create(constraint).await;
        }
        let Some(stored) = objects.get_mut(&key) else {
            return Err(Error::not_found(key.to_string()));
        };
        if stored.spec == constraint.spec {
            return Ok(stored.clone());
        }
        stored.spec = constraint.spec;
        stored.resource_version = stored.resource_version.saturating_add(1);
        let updated = stored.clone();
        drop(objects);

        self.notify(key, NotificationKind::Updated);
        Ok(updated)
    }

    /// Request deletion. Removes the constraint at once if it carries no
    /// finalizers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the constraint does not exist.
    pub async fn request_deletion(&self, key: &RuleKey) -> Result<()> {
        let mut objects = self.objects.write().await;
        let Some(stored) = objects.get_mut(key) else {
            return Err(Error::not_found(key.to_string()));
        };

        if stored.finalizers.is_empty() {
            objects.remove(key);
            drop(objects);
            self.notify(key.clone(), NotificationKind::Deleted);
            return Ok(());
        }

        if stored.deletion_timestamp.is_none() {
            stored.deletion_timestamp = Some(Utc::now());
            stored.resource_version = stored.resource_version.saturating_add(1);
            drop(objects);
            self.notify(key.clone(), NotificationKind::DeletionRequested);
        }
        Ok(())
    }

    /// Number of stored constraints.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn notify(&self, key: RuleKey, kind: NotificationKind) {
        trace!(key = %key, kind = ?kind, "Publishing notification");
        // No subscribers is not an error.
        let _ = self.events.send(Notification::new(key, kind));
    }

    fn check_version(stored: &Constraint, incoming: &Constraint) -> Result<()> {
        if stored.resource_version == incoming.resource_version {
            Ok(())
        } else {
            Err(Error::conflict(
                incoming.key().to_string(),
                format!(
                    "resource version {} is stale, current is {}",
                    incoming.resource_version, stored.resource_version
                ),
            ))
        }
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn get(&self, key: &RuleKey) -> Result<Constraint> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key.to_string()))
    }

    async fn list(&self) -> Result<Vec<RuleKey>> {
        let mut keys: Vec<RuleKey> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn update(&self, constraint: &Constraint) -> Result<Constraint> {
        let key = constraint.key();
        let mut objects = self.objects.write().await;
        let Some(stored) = objects.get_mut(&key) else {
            return Err(Error::not_found(key.to_string()));
        };
        Self::check_version(stored, constraint)?;

        let unchanged = stored.finalizers == constraint.finalizers && stored.spec == constraint.spec;
        if unchanged {
            return Ok(Constraint {
                status: None,
                ..stored.clone()
            });
        }

        stored.finalizers.clone_from(&constraint.finalizers);
        stored.spec.clone_from(&constraint.spec);
        stored.resource_version = stored.resource_version.saturating_add(1);
        let written = Constraint {
            status: None,
            ..stored.clone()
        };

        if stored.deletion_requested() && stored.finalizers.is_empty() {
            objects.remove(&key);
            drop(objects);
            debug!(key = %key, "Last finalizer removed, constraint deleted");
            self.notify(key, NotificationKind::Deleted);
        } else {
            drop(objects);
            self.notify(key, NotificationKind::Updated);
        }
        Ok(written)
    }

    async fn update_status(&self, constraint: &Constraint) -> Result<Constraint> {
        let key = constraint.key();
        let mut objects = self.objects.write().await;
        let Some(stored) = objects.get_mut(&key) else {
            return Err(Error::not_found(key.to_string()));
        };
        Self::check_version(stored, constraint)?;

        if stored.status == constraint.status {
            return Ok(stored.clone());
        }

        stored.status.clone_from(&constraint.status);
        stored.resource_version = stored.resource_version.saturating_add(1);
        let written = stored.clone();
        drop(objects);

        self.notify(key, NotificationKind::Updated);
        Ok(written)
    }
}

/// Policy engine holding rules in a map.
///
/// When templates are registered, rules of any other kind are rejected the
/// way an engine rejects a constraint whose template is not loaded.
#[derive(Default)]
pub struct InMemoryPolicyEngine {
    rules: RwLock<HashMap<RuleKey, Rule>>,
    templates: RwLock<HashSet<String>>,
    writes: AtomicUsize,
}

impl InMemoryPolicyEngine {
    /// Create an engine accepting rules of any kind.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine accepting only the given kinds.
    pub fn with_templates<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            templates: RwLock::new(kinds.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Register a template kind.
    pub async fn register_template(&self, kind: impl Into<String>) {
        self.templates.write().await.insert(kind.into());
    }

    /// Number of `add_rule`/`remove_rule` calls that reached the engine.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Whether a rule is loaded under `key`.
    pub async fn contains(&self, key: &RuleKey) -> bool {
        self.rules.read().await.contains_key(key)
    }

    /// Number of loaded rules.
    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    /// Whether no rules are loaded.
    pub async fn is_empty(&self) -> bool {
        self.rules.read().await.is_empty()
    }

    fn validate(rule: &Rule) -> std::result::Result<(), String> {
        match &rule.spec {
            Value::Object(_) | Value::Null => Ok(()),
            other => Err(format!("spec must be an object, got {other}")),
        }
    }
}

#[async_trait]
impl PolicyEngine for InMemoryPolicyEngine {
    async fn get_rule(&self, key: &RuleKey) -> Result<Rule> {
        self.rules
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::unknown_rule(key.to_string()))
    }

    async fn add_rule(&self, rule: Rule) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let key = rule.key();

        {
            let templates = self.templates.read().await;
            if !templates.is_empty() && !templates.contains(&rule.kind) {
                return Err(Error::registration_failed(
                    key.to_string(),
                    format!("no template registered for kind {}", rule.kind),
                ));
            }
        }
        Self::validate(&rule).map_err(|reason| Error::registration_failed(key.to_string(), reason))?;

        self.rules.write().await.insert(key, rule);
        Ok(())
    }

    async fn remove_rule(&self, key: &RuleKey) -> Result<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(self.rules.write().await.remove(key).is_some())
    }
}
