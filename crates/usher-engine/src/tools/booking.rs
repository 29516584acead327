use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::Deserialize;
use tracing::{info, instrument};

use usher_core::protocol::{EffectDelta, ToolDescriptor};
use usher_core::tools::{Tool, ToolContext, ToolError, ToolOutput};

use crate::backends::{AppointmentBook, BookingRequest};

pub const BOOK_APPOINTMENT_TOOL: &str = "book_appointment";

#[derive(Deserialize)]
struct BookAppointmentArgs {
    slot_datetime: String,
    reason: String,
}

/// Book a consultation. Non-idempotent: the retry path reuses the context's
/// dedup token so a re-attempt can never double-book. The customer and
/// specialist ids come from the session's recorded identifiers, never from
/// model arguments.
pub struct BookAppointmentTool {
    appointments: Arc<dyn AppointmentBook>,
}

impl BookAppointmentTool {
    pub fn new(appointments: Arc<dyn AppointmentBook>) -> Self {
        Self { appointments }
    }
}

#[async_trait]
impl Tool for BookAppointmentTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            BOOK_APPOINTMENT_TOOL,
            "Book a consultation slot with the selected specialist for the onboarded customer.",
        )
        .with_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "slot_datetime": {
                    "type": "string",
                    "description": "Appointment start in YYYY-MM-DD HH:MM:SS format",
                },
                "reason": {"type": "string"},
            },
            "required": ["slot_datetime", "reason"],
        }))
        .with_precondition("customer_id")
        .with_precondition("specialist_id")
        .with_effect_identifier("appointment_id")
        .with_effect_flag("appointment_booked")
        .non_idempotent()
    }

    #[instrument(skip(self, args, ctx), fields(session_id = %ctx.session_id))]
    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let args: BookAppointmentArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(format!("booking args: {e}")))?;

        let customer_id = ctx
            .identifiers
            .get("customer_id")
            .ok_or_else(|| ToolError::PreconditionFailed("customer_id".into()))?;
        let specialist_id = ctx
            .identifiers
            .get("specialist_id")
            .ok_or_else(|| ToolError::PreconditionFailed("specialist_id".into()))?;

        let start = NaiveDateTime::parse_from_str(&args.slot_datetime, "%Y-%m-%d %H:%M:%S")
            .map_err(|e| {
                ToolError::InvalidArguments(format!("slot_datetime {:?}: {e}", args.slot_datetime))
            })?;

        // A retry of this same logical request returns what already happened
        if let Some(existing) = self
            .appointments
            .find_by_token(&ctx.dedup_token)
            .map_err(|e| ToolError::ExternalService(e.to_string()))?
        {
            return Ok(booking_output(existing));
        }

        if start.weekday().num_days_from_monday() >= 5 {
            return Err(ToolError::InvalidArguments(
                "Cannot book appointments on weekends".into(),
            ));
        }
        if start.hour() == 14 {
            return Err(ToolError::InvalidArguments(
                "Cannot book appointments during lunch break (14:00-15:00)".into(),
            ));
        }
        if !(11..18).contains(&start.hour()) {
            return Err(ToolError::InvalidArguments(
                "Outside of working hours (11:00-18:00)".into(),
            ));
        }
        if self
            .appointments
            .is_booked(specialist_id, start)
            .map_err(|e| ToolError::ExternalService(e.to_string()))?
        {
            return Err(ToolError::InvalidArguments(
                "This time slot is already booked".into(),
            ));
        }

        let appointment = self
            .appointments
            .book(BookingRequest {
                specialist_id: specialist_id.to_string(),
                customer_id: customer_id.to_string(),
                start,
                reason: args.reason,
                dedup_token: ctx.dedup_token.clone(),
            })
            .map_err(|e| ToolError::ExternalService(e.to_string()))?;

        info!(appointment_id = %appointment.appointment_id, "appointment booked");

        Ok(booking_output(appointment))
    }
}

fn booking_output(appointment: crate::backends::Appointment) -> ToolOutput {
    let appointment_id = appointment.appointment_id.clone();
    ToolOutput {
        content: serde_json::json!({
            "message": "Appointment booked successfully",
            "appointment_details": appointment,
        }),
        delta: EffectDelta::new()
            .with_identifier("appointment_id", appointment_id)
            .with_flag("appointment_booked", true),
    }
}
