//! Core types for the reconciler.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Identity of a rule: the join key between a constraint resource, its
/// cache entry and the rule loaded in the policy engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleKey {
    /// Constraint kind (the policy template it instantiates).
    pub kind: String,
    /// Constraint name, unique within its kind.
    pub name: String,
}

impl RuleKey {
    /// Create a new rule key.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// What the policy engine does when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementAction {
    /// Reject the request.
    #[default]
    Deny,
    /// Record the violation only.
    Dryrun,
    /// Admit the request with a warning.
    Warn,
}

impl EnforcementAction {
    /// Every action the metrics taxonomy reports on.
    pub const KNOWN: [Self; 3] = [Self::Deny, Self::Dryrun, Self::Warn];

    /// Wire name of the action.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::Dryrun => "dryrun",
            Self::Warn => "warn",
        }
    }

    /// Parse a wire name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEnforcementAction`] for unrecognised names.
    pub fn parse(value: &str) -> Result<Self> {
        Self::KNOWN
            .into_iter()
            .find(|action| action.as_str() == value)
            .ok_or_else(|| Error::invalid_enforcement_action(value))
    }

    /// Read `enforcementAction` from a constraint spec, defaulting to `deny`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEnforcementAction`] when the field is not a
    /// string or names an unknown action.
    pub fn from_spec(spec: &Value) -> Result<Self> {
        match spec.get("enforcementAction") {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::String(s)) => Self::parse(s),
            Some(other) => Err(Error::invalid_enforcement_action(other.to_string())),
        }
    }
}

impl fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load status of a rule, as reported in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    /// Rule is loaded and enforced.
    Active,
    /// Rule failed to load.
    Error,
}

impl RuleStatus {
    /// Every status the metrics taxonomy reports on.
    pub const ALL: [Self; 2] = [Self::Active, Self::Error];

    /// Wire name of the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disposition of a rule: the metrics grouping key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub enforcement_action: EnforcementAction,
    pub status: RuleStatus,
}

impl Tag {
    /// Create a new tag.
    pub const fn new(enforcement_action: EnforcementAction, status: RuleStatus) -> Self {
        Self {
            enforcement_action,
            status,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.enforcement_action, self.status)
    }
}

/// One error entry in a constraint's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    pub message: String,
}

impl StatusError {
    /// Create a new status error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Reconciliation-owned status of a constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintStatus {
    /// Whether the rule is currently loaded in the policy engine.
    #[serde(default)]
    pub enforced: bool,
    /// Errors from the most recent registration attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StatusError>,
}

/// A constraint resource as held by the resource store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub kind: String,
    pub name: String,
    /// Bumped by the store on every write; stale writes are rejected.
    #[serde(default)]
    pub resource_version: u64,
    /// Set once deletion has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Policy content.
    #[serde(default)]
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConstraintStatus>,
}

impl Constraint {
    /// Create a constraint with the given spec and no status.
    pub fn new(kind: impl Into<String>, name: impl Into<String>, spec: Value) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            resource_version: 0,
            deletion_timestamp: None,
            finalizers: Vec::new(),
            spec,
            status: None,
        }
    }

    /// Set the status sub-object.
    #[must_use]
    pub fn with_status(mut self, status: ConstraintStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Add a finalizer.
    #[must_use]
    pub fn with_finalizer(mut self, finalizer: impl Into<String>) -> Self {
        self.finalizers.push(finalizer.into());
        self
    }

    /// The rule key for this constraint.
    pub fn key(&self) -> RuleKey {
        RuleKey::new(self.kind.clone(), self.name.clone())
    }

    /// Whether deletion has been requested.
    pub const fn deletion_requested(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Whether the finalizer list contains `finalizer`.
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Append `finalizer` unless already present.
    pub fn add_finalizer(&mut self, finalizer: &str) {
        if !self.has_finalizer(finalizer) {
            self.finalizers.push(finalizer.to_string());
        }
    }

    /// Drop every occurrence of `finalizer`.
    pub fn remove_finalizer(&mut self, finalizer: &str) {
        self.finalizers.retain(|f| f != finalizer);
    }

    /// Enforcement action declared in the spec.
    ///
    /// # Errors
    ///
    /// See [`EnforcementAction::from_spec`].
    pub fn enforcement_action(&self) -> Result<EnforcementAction> {
        EnforcementAction::from_spec(&self.spec)
    }

    /// Current status, or an empty one.
    pub fn status_or_default(&self) -> ConstraintStatus {
        self.status.clone().unwrap_or_default()
    }
}

/// Policy content handed to the engine: a copy of the constraint with every
/// reconciliation-owned field stripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub kind: String,
    pub name: String,
    pub spec: Value,
}

impl Rule {
    /// The rule key.
    pub fn key(&self) -> RuleKey {
        RuleKey::new(self.kind.clone(), self.name.clone())
    }

    /// Whether two rules carry the same policy content.
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name && self.spec == other.spec
    }
}

impl From<&Constraint> for Rule {
    fn from(constraint: &Constraint) -> Self {
        Self {
            kind: constraint.kind.clone(),
            name: constraint.name.clone(),
            spec: constraint.spec.clone(),
        }
    }
}

/// Non-error result of a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing more to do until the next notification.
    Done,
    /// A write lost a race; try again after backoff without counting an error.
    Requeue { reason: String },
}

impl ReconcileOutcome {
    /// Create a requeue outcome.
    pub fn requeue(reason: impl Into<String>) -> Self {
        Self::Requeue {
            reason: reason.into(),
        }
    }

    /// Whether the pass asked to be retried.
    pub const fn is_requeue(&self) -> bool {
        matches!(self, Self::Requeue { .. })
    }
}

/// Kind of change a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Created,
    Updated,
    DeletionRequested,
    Deleted,
}

/// A change notification delivered by the resource store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub key: RuleKey,
    pub kind: NotificationKind,
}

impl Notification {
    /// Create a new notification.
    pub const fn new(key: RuleKey, kind: NotificationKind) -> Self {
        Self { key, kind }
    }
}
