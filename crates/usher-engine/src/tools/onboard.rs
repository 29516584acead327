use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use usher_core::protocol::{EffectDelta, ToolDescriptor};
use usher_core::tools::{Tool, ToolContext, ToolError, ToolOutput};

use crate::backends::{BackendError, CustomerDirectory, NewCustomer};

pub const ONBOARD_TOOL: &str = "onboard_customer";

/// Create a customer profile and emit its id. Consent-gated: the guard turns
/// this into a confirmation request until `consent_given` is set by an
/// explicit user event. Re-onboarding a known email returns the existing id.
pub struct OnboardCustomerTool {
    directory: Arc<dyn CustomerDirectory>,
}

impl OnboardCustomerTool {
    pub fn new(directory: Arc<dyn CustomerDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Tool for OnboardCustomerTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            ONBOARD_TOOL,
            "Onboard a new customer by creating a profile. Requires the customer's \
             explicit consent first.",
        )
        .with_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "company_name": {"type": "string"},
                "name": {"type": "string"},
                "domain": {"type": "string"},
                "email": {"type": "string"},
                "phone": {"type": "string"},
                "request_date": {"type": "string"},
                "request_summary": {"type": "string"},
            },
            "required": ["company_name", "name", "email"],
        }))
        .with_consent(
            "consent_given",
            "Before I set up your profile, may I save your contact details? (yes/no)",
        )
        .with_effect_identifier("customer_id")
        .with_effect_flag("customer_onboarded")
    }

    #[instrument(skip(self, args, _ctx), fields(session_id = %_ctx.session_id))]
    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let profile: NewCustomer = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(format!("onboarding profile: {e}")))?;

        if profile.email.trim().is_empty() {
            return Err(ToolError::InvalidArguments("email must not be empty".into()));
        }
        if profile.name.trim().is_empty() {
            return Err(ToolError::InvalidArguments("name must not be empty".into()));
        }

        let (record, created) = match self
            .directory
            .find_by_email(&profile.email)
            .map_err(backend_err)?
        {
            Some(existing) => (existing, false),
            None => (self.directory.insert(profile).map_err(backend_err)?, true),
        };

        info!(customer_id = %record.customer_id, created, "customer onboarded");

        let message = if created {
            format!("Customer profile created for {}", record.name)
        } else {
            format!("Customer profile already exists for {}", record.name)
        };

        Ok(ToolOutput {
            content: serde_json::json!({
                "success": true,
                "message": message,
                "customer_id": record.customer_id,
            }),
            delta: EffectDelta::new()
                .with_identifier("customer_id", record.customer_id.clone())
                .with_flag("customer_onboarded", true),
        })
    }
}

fn backend_err(e: BackendError) -> ToolError {
    ToolError::ExternalService(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use usher_core::ids::SessionId;
    use usher_core::protocol::{FlagMap, IdentifierMap};

    fn ctx() -> ToolContext {
        ToolContext::new(
            SessionId::new(),
            0,
            FlagMap::new(),
            IdentifierMap::new(),
            CancellationToken::new(),
        )
    }

    fn args(email: &str) -> serde_json::Value {
        serde_json::json!({
            "company_name": "Acme GmbH",
            "name": "Dana",
            "domain": "logistics",
            "email": email,
            "request_date": "2026-03-01",
            "request_summary": "wants a cloud migration",
        })
    }

    fn tool() -> OnboardCustomerTool {
        OnboardCustomerTool::new(Arc::new(crate::backends::InMemoryDirectory::new()))
    }

    #[test]
    fn descriptor_is_consent_gated() {
        let desc = tool().descriptor();
        assert_eq!(desc.name, ONBOARD_TOOL);
        assert_eq!(desc.consent.unwrap().flag, "consent_given");
        assert_eq!(desc.effect_identifiers, vec!["customer_id"]);
    }

    #[tokio::test]
    async fn onboarding_emits_customer_id() {
        let tool = tool();
        let output = tool.execute(args("dana@acme.test"), &ctx()).await.unwrap();
        assert_eq!(output.content["success"], true);
        assert_eq!(output.content["customer_id"], "CUST-001");
        assert_eq!(output.delta.identifiers.get("customer_id").unwrap(), "CUST-001");
        assert!(output.delta.flags.contains_key("customer_onboarded"));
    }

    #[tokio::test]
    async fn existing_email_returns_same_id() {
        let tool = tool();
        let first = tool.execute(args("dana@acme.test"), &ctx()).await.unwrap();
        let second = tool.execute(args("dana@acme.test"), &ctx()).await.unwrap();
        assert_eq!(first.content["customer_id"], second.content["customer_id"]);
        assert!(second.content["message"]
            .as_str()
            .unwrap()
            .contains("already exists"));
    }

    #[tokio::test]
    async fn missing_email_rejected() {
        let tool = tool();
        let bad = serde_json::json!({"company_name": "Acme", "name": "Dana", "email": ""});
        let err = tool.execute(bad, &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn missing_required_fields_rejected() {
        let tool = tool();
        let bad = serde_json::json!({"email": "dana@acme.test"});
        let err = tool.execute(bad, &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
