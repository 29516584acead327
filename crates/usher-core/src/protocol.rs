use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// Value of a protocol flag. Flags gate tool eligibility; a precondition is
/// satisfied only by a truthy value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Index(u64),
    Text(String),
}

impl FlagValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Index(_) => true,
            Self::Text(s) => !s.is_empty(),
        }
    }
}

impl From<bool> for FlagValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<u64> for FlagValue {
    fn from(n: u64) -> Self {
        Self::Index(n)
    }
}

impl From<&str> for FlagValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// Named protocol flags for one session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagMap(BTreeMap<String, FlagValue>);

impl FlagMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FlagValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FlagValue> {
        self.0.get(name)
    }

    /// A flag counts as set only when present and truthy.
    pub fn is_set(&self, name: &str) -> bool {
        self.0.get(name).is_some_and(FlagValue::is_truthy)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FlagValue)> {
        self.0.iter()
    }
}

/// Attempted overwrite of an immutable identifier.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("identifier conflict: {name} already recorded as {existing:?}, attempted {attempted:?}")]
pub struct IdentifierConflict {
    pub name: String,
    pub existing: String,
    pub attempted: String,
}

/// Identifiers emitted by tools. Write-once: re-recording the same value is a
/// no-op (retry safety), a different value is a conflict.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentifierMap(BTreeMap<String, String>);

impl IdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an identifier. Returns `true` when newly inserted, `false` when
    /// the identical value was already present.
    pub fn record(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<bool, IdentifierConflict> {
        let name = name.into();
        let value = value.into();
        match self.0.get(&name) {
            None => {
                self.0.insert(name, value);
                Ok(true)
            }
            Some(existing) if *existing == value => Ok(false),
            Some(existing) => Err(IdentifierConflict {
                name,
                existing: existing.clone(),
                attempted: value,
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// The flag/identifier changes produced by one successful tool invocation.
/// Applied to a session atomically by the orchestrator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectDelta {
    pub flags: BTreeMap<String, FlagValue>,
    pub identifiers: BTreeMap<String, String>,
}

impl EffectDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flag(mut self, name: impl Into<String>, value: impl Into<FlagValue>) -> Self {
        self.flags.insert(name.into(), value.into());
        self
    }

    pub fn with_identifier(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.identifiers.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.identifiers.is_empty()
    }
}

/// Whether a failed invocation may be transparently re-attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Idempotency {
    /// Safe to retry (availability checks, retrieval).
    Idempotent,
    /// Side-effecting; retried at most once with a deduplication token.
    NonIdempotent,
}

/// Explicit consent requirement on a tool. When the flag is unset, the guard
/// returns `RequiresConfirmation` instead of allowing execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsentGate {
    pub flag: String,
    pub prompt: String,
}

/// Declarative contract of a tool: what must hold before it runs and what it
/// may write. The guard operates on descriptors alone.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
    /// Names satisfied by a truthy flag or a present identifier.
    pub preconditions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent: Option<ConsentGate>,
    /// Flags this tool may set.
    pub effect_flags: Vec<String>,
    /// Identifiers this tool may record (write-once).
    pub effect_identifiers: Vec<String>,
    pub idempotency: Idempotency,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema: serde_json::json!({"type": "object"}),
            preconditions: Vec::new(),
            consent: None,
            effect_flags: Vec::new(),
            effect_identifiers: Vec::new(),
            idempotency: Idempotency::Idempotent,
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.parameters_schema = schema;
        self
    }

    pub fn with_precondition(mut self, name: impl Into<String>) -> Self {
        self.preconditions.push(name.into());
        self
    }

    pub fn with_consent(mut self, flag: impl Into<String>, prompt: impl Into<String>) -> Self {
        self.consent = Some(ConsentGate {
            flag: flag.into(),
            prompt: prompt.into(),
        });
        self
    }

    pub fn with_effect_flag(mut self, name: impl Into<String>) -> Self {
        self.effect_flags.push(name.into());
        self
    }

    pub fn with_effect_identifier(mut self, name: impl Into<String>) -> Self {
        self.effect_identifiers.push(name.into());
        self
    }

    pub fn non_idempotent(mut self) -> Self {
        self.idempotency = Idempotency::NonIdempotent;
        self
    }
}

/// A tool invocation proposed by the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: ToolCallId::new(),
            name: name.into(),
            arguments,
        }
    }
}

/// Why the guard refused a tool call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    UnknownTool { name: String },
    PreconditionFailed { name: String },
    IdentifierConflict { name: String },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTool { name } => write!(f, "unknown tool: {name}"),
            Self::PreconditionFailed { name } => write!(f, "precondition not satisfied: {name}"),
            Self::IdentifierConflict { name } => {
                write!(f, "identifier already recorded: {name}")
            }
        }
    }
}

/// Protocol Guard verdict for a proposed tool call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
    RequiresConfirmation { prompt: String },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}
