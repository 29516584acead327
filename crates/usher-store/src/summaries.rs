use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use usher_core::ids::{SessionId, SummaryId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A stored conversation summary. Written silently at milestones; never part
/// of any user-visible reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SummaryRow {
    pub id: SummaryId,
    pub session_id: SessionId,
    pub milestone: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

pub struct SummaryRepo {
    db: Database,
}

impl SummaryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a summary for a milestone. The UNIQUE(session_id, milestone)
    /// constraint is the durable backstop for fire-exactly-once.
    #[instrument(skip(self, payload), fields(session_id = %session_id, milestone))]
    pub fn record(
        &self,
        session_id: &SessionId,
        milestone: &str,
        payload: serde_json::Value,
    ) -> Result<SummaryRow, StoreError> {
        let id = SummaryId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO summaries (id, session_id, milestone, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    milestone,
                    serde_json::to_string(&payload)?,
                    now,
                ],
            );
            match result {
                Ok(_) => Ok(SummaryRow {
                    id: id.clone(),
                    session_id: session_id.clone(),
                    milestone: milestone.to_string(),
                    payload,
                    created_at: now.clone(),
                }),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Conflict(format!(
                        "summary already recorded for {session_id} at {milestone}"
                    )))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// List summaries for a session, oldest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<SummaryRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, milestone, payload, created_at
                 FROM summaries WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_summary(row)?);
            }
            Ok(results)
        })
    }

    pub fn count(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM summaries WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> Result<SummaryRow, StoreError> {
    let payload_raw: String = row_helpers::get(row, 3, "summaries", "payload")?;
    Ok(SummaryRow {
        id: SummaryId::from_raw(row_helpers::get::<String>(row, 0, "summaries", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "summaries", "session_id")?),
        milestone: row_helpers::get(row, 2, "summaries", "milestone")?,
        payload: row_helpers::parse_json(&payload_raw, "summaries", "payload")?,
        created_at: row_helpers::get(row, 4, "summaries", "created_at")?,
    })
}
