use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::protocol::{EffectDelta, FlagMap, IdentifierConflict, IdentifierMap};
use crate::turns::{TurnRecord, TurnRole};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// A turn currently holds the session.
    Active,
    /// Durably persisted between turns.
    Checkpointed,
    /// Evicted after the inactivity timeout. Identifiers are not recoverable.
    Expired,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Checkpointed => write!(f, "checkpointed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "checkpointed" => Ok(Self::Checkpointed),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}

/// A consent request surfaced to the user and awaiting an explicit
/// confirmation event. While pending, the gated tool does not execute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingConsent {
    pub tool: String,
    pub flag: String,
    pub prompt: String,
}

/// Per-conversation business state. Owned by the Session Store; mutated only
/// through the Turn Orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub turns: Vec<TurnRecord>,
    pub flags: FlagMap,
    pub identifiers: IdentifierMap,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_consent: Option<PendingConsent>,
    /// Summarization milestones that already fired.
    pub fired_milestones: BTreeSet<String>,
    /// Monotonic; bumped on every checkpoint to detect stale overwrites.
    pub checkpoint_version: i64,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            turns: Vec::new(),
            flags: FlagMap::new(),
            identifiers: IdentifierMap::new(),
            state: SessionState::Active,
            pending_consent: None,
            fired_milestones: BTreeSet::new(),
            checkpoint_version: 0,
        }
    }

    /// Append a turn. Returns its index in the total order.
    pub fn record_turn(&mut self, turn: TurnRecord) -> u64 {
        self.turns.push(turn);
        (self.turns.len() - 1) as u64
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    /// Index the next appended turn would get. Used for dedup tokens.
    pub fn next_turn_index(&self) -> u64 {
        self.turns.len() as u64
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::User)
            .map(|t| t.content.as_str())
    }

    /// Atomically merge a tool's effect delta. All identifier writes are
    /// validated before anything is applied, so a conflict leaves the session
    /// untouched - no half-applied delta is ever observable.
    pub fn apply_delta(&mut self, delta: &EffectDelta) -> Result<(), IdentifierConflict> {
        for (name, value) in &delta.identifiers {
            if let Some(existing) = self.identifiers.get(name) {
                if existing != value {
                    return Err(IdentifierConflict {
                        name: name.clone(),
                        existing: existing.to_string(),
                        attempted: value.clone(),
                    });
                }
            }
        }

        for (name, value) in &delta.identifiers {
            // Cannot fail: validated above.
            let _ = self.identifiers.record(name.clone(), value.clone());
        }
        for (name, value) in &delta.flags {
            self.flags.set(name.clone(), value.clone());
        }
        Ok(())
    }

    /// Apply an explicit user confirmation event. Only honored while a consent
    /// request is pending; returns the resolved request, if any.
    pub fn resolve_consent(&mut self, granted: bool) -> Option<PendingConsent> {
        let pending = self.pending_consent.take()?;
        if granted {
            self.flags.set(pending.flag.clone(), true);
        }
        Some(pending)
    }

    pub fn milestone_fired(&self, milestone: &str) -> bool {
        self.fired_milestones.contains(milestone)
    }

    pub fn mark_milestone(&mut self, milestone: impl Into<String>) {
        self.fired_milestones.insert(milestone.into());
    }
}
