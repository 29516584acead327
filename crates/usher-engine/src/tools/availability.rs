use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::instrument;

use usher_core::protocol::ToolDescriptor;
use usher_core::tools::{Tool, ToolContext, ToolError, ToolOutput};

use crate::backends::AppointmentBook;

pub const CHECK_AVAILABILITY_TOOL: &str = "check_availability";

/// Bookable hours: 11:00-18:00 on weekdays, minus the 14:00-15:00 lunch hour.
const BOOKABLE_HOURS: [u32; 6] = [11, 12, 13, 15, 16, 17];
const SLOT_MINUTES: [u32; 2] = [0, 30];
const DEFAULT_WINDOW_DAYS: i64 = 7;

#[derive(Deserialize)]
struct CheckAvailabilityArgs {
    #[serde(default)]
    specialist_id: Option<String>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct Slot {
    pub slot_id: String,
    pub specialist_id: String,
    pub datetime: String,
    pub duration_minutes: u32,
}

/// List open consultation slots. Read-only and effect-free; safe to retry.
pub struct CheckAvailabilityTool {
    appointments: Arc<dyn AppointmentBook>,
}

impl CheckAvailabilityTool {
    pub fn new(appointments: Arc<dyn AppointmentBook>) -> Self {
        Self { appointments }
    }
}

#[async_trait]
impl Tool for CheckAvailabilityTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            CHECK_AVAILABILITY_TOOL,
            "Check open consultation slots (weekdays 11:00-18:00, excluding the \
             14:00-15:00 lunch break). Dates are YYYY-MM-DD; defaults to the next 7 days.",
        )
        .with_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "specialist_id": {"type": "string"},
                "start_date": {"type": "string"},
                "end_date": {"type": "string"},
            },
        }))
    }

    #[instrument(skip(self, args, ctx), fields(session_id = %ctx.session_id))]
    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let args: CheckAvailabilityArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(format!("availability args: {e}")))?;

        // Prefer the recorded specialist over a model-supplied one
        let specialist_id = ctx
            .identifiers
            .get("specialist_id")
            .map(str::to_string)
            .or(args.specialist_id)
            .ok_or_else(|| {
                ToolError::PreconditionFailed("specialist_id".into())
            })?;

        let today = Utc::now().date_naive();
        let start = parse_date(args.start_date.as_deref(), today)?;
        let end = parse_date(
            args.end_date.as_deref(),
            today + Duration::days(DEFAULT_WINDOW_DAYS),
        )?;
        if end < start {
            return Err(ToolError::InvalidArguments("end_date precedes start_date".into()));
        }

        let slots = self.generate_slots(&specialist_id, start, end)?;
        let content = if slots.is_empty() {
            serde_json::json!({"message": "No available appointments found in the requested period"})
        } else {
            serde_json::json!({"slots": slots})
        };

        Ok(ToolOutput::content_only(content))
    }
}

impl CheckAvailabilityTool {
    fn generate_slots(
        &self,
        specialist_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Slot>, ToolError> {
        let mut slots = Vec::new();
        let mut day = start;
        while day <= end {
            if day.weekday().num_days_from_monday() < 5 {
                for hour in BOOKABLE_HOURS {
                    for minute in SLOT_MINUTES {
                        let Some(at) = day.and_hms_opt(hour, minute, 0) else {
                            continue;
                        };
                        let booked = self
                            .appointments
                            .is_booked(specialist_id, at)
                            .map_err(|e| ToolError::ExternalService(e.to_string()))?;
                        if !booked {
                            slots.push(slot_for(specialist_id, at));
                        }
                    }
                }
            }
            day += Duration::days(1);
        }
        Ok(slots)
    }
}

fn slot_for(specialist_id: &str, at: NaiveDateTime) -> Slot {
    Slot {
        slot_id: format!("SLOT-{}-{}", specialist_id, at.format("%Y%m%d%H%M")),
        specialist_id: specialist_id.to_string(),
        datetime: at.format("%Y-%m-%d %H:%M:%S").to_string(),
        duration_minutes: 30,
    }
}

fn parse_date(raw: Option<&str>, default: NaiveDate) -> Result<NaiveDate, ToolError> {
    match raw {
        None => Ok(default),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| ToolError::InvalidArguments(format!("date {s:?}: {e}"))),
    }
}
