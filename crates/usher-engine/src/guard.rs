use std::collections::HashMap;

use tracing::debug;

use usher_core::protocol::{Decision, DenyReason, ToolCallRequest, ToolDescriptor};
use usher_core::session::Session;

/// Pure decision logic gating tool execution. Evaluation never mutates the
/// session; the orchestrator applies effects only after successful execution.
pub struct ProtocolGuard {
    descriptors: HashMap<String, ToolDescriptor>,
}

impl ProtocolGuard {
    pub fn new(descriptors: Vec<ToolDescriptor>) -> Self {
        Self {
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
        }
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.descriptors.get(name)
    }

    /// Decide whether a proposed tool call may execute against the given
    /// session snapshot.
    pub fn evaluate(&self, session: &Session, call: &ToolCallRequest) -> Decision {
        let Some(descriptor) = self.descriptors.get(&call.name) else {
            return Decision::Deny(DenyReason::UnknownTool { name: call.name.clone() });
        };

        // Every precondition must hold: a truthy flag or a recorded identifier.
        for precondition in &descriptor.preconditions {
            let satisfied = session.flags.is_set(precondition)
                || session.identifiers.contains(precondition);
            if !satisfied {
                debug!(tool = %call.name, precondition, "tool call denied");
                return Decision::Deny(DenyReason::PreconditionFailed {
                    name: precondition.clone(),
                });
            }
        }

        // Executing would overwrite an immutable identifier.
        for identifier in &descriptor.effect_identifiers {
            if session.identifiers.contains(identifier) {
                debug!(tool = %call.name, identifier, "tool call denied: identifier recorded");
                return Decision::Deny(DenyReason::IdentifierConflict {
                    name: identifier.clone(),
                });
            }
        }

        if let Some(gate) = &descriptor.consent {
            if !session.flags.is_set(&gate.flag) {
                return Decision::RequiresConfirmation { prompt: gate.prompt.clone() };
            }
        }

        Decision::Allow
    }
}
