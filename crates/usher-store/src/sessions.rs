use std::collections::BTreeSet;

use chrono::Utc;
use tracing::instrument;

use usher_core::ids::SessionId;
use usher_core::protocol::{FlagMap, IdentifierMap};
use usher_core::session::{PendingConsent, Session, SessionState};
use usher_core::turns::TurnRecord;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Repository for session records. One row per session id: serialized turn
/// history, flag mapping, identifier mapping, and a monotonically increasing
/// checkpoint version used to detect stale overwrites.
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a fresh session record. Fails with Conflict if the id exists.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn create(&self, id: &SessionId) -> Result<Session, StoreError> {
        let session = Session::new(id.clone());
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO sessions (id, status, turns, flags, identifiers, pending_consent,
                                       fired_milestones, checkpoint_version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, 0, ?7, ?7)",
                rusqlite::params![
                    id.as_str(),
                    session.state.to_string(),
                    serde_json::to_string(&session.turns)?,
                    serde_json::to_string(&session.flags)?,
                    serde_json::to_string(&session.identifiers)?,
                    serde_json::to_string(&session.fired_milestones)?,
                    now,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Conflict(format!("session {id} already exists")))
                }
                Err(e) => Err(e.into()),
            }
        })?;

        Ok(session)
    }

    /// Load a session snapshot by id.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn load(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, status, turns, flags, identifiers, pending_consent,
                        fired_milestones, checkpoint_version
                 FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    pub fn exists(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Durably persist a session snapshot. The write succeeds only if the row
    /// still carries the version this snapshot was loaded at; on success the
    /// in-memory version is bumped to match the row.
    #[instrument(skip(self, session), fields(session_id = %session.id, version = session.checkpoint_version))]
    pub fn checkpoint(&self, session: &mut Session) -> Result<(), StoreError> {
        let expected = session.checkpoint_version;
        let next = expected + 1;
        let now = Utc::now().to_rfc3339();

        let pending = match &session.pending_consent {
            Some(p) => Some(serde_json::to_string(p)?),
            None => None,
        };

        let updated = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sessions
                 SET status = ?1, turns = ?2, flags = ?3, identifiers = ?4,
                     pending_consent = ?5, fired_milestones = ?6,
                     checkpoint_version = ?7, updated_at = ?8
                 WHERE id = ?9 AND checkpoint_version = ?10",
                rusqlite::params![
                    session.state.to_string(),
                    serde_json::to_string(&session.turns)?,
                    serde_json::to_string(&session.flags)?,
                    serde_json::to_string(&session.identifiers)?,
                    pending,
                    serde_json::to_string(&session.fired_milestones)?,
                    next,
                    now,
                    session.id.as_str(),
                    expected,
                ],
            )?)
        })?;

        if updated == 0 {
            if self.exists(&session.id)? {
                return Err(StoreError::StaleCheckpoint {
                    session: session.id.to_string(),
                    expected,
                });
            }
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }

        session.checkpoint_version = next;
        Ok(())
    }

    /// Set the lifecycle status without touching business state.
    #[instrument(skip(self), fields(session_id = %id, status = %state))]
    pub fn update_status(&self, id: &SessionId, state: SessionState) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![state.to_string(), now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Flip sessions idle longer than `max_idle` to expired. The sweep cadence
    /// and timeout are external policy; this is just the mechanism.
    #[instrument(skip(self))]
    pub fn expire_idle(&self, max_idle: chrono::Duration) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - max_idle).to_rfc3339();
        self.db.with_conn(|conn| {
            let count = conn.execute(
                "UPDATE sessions SET status = 'expired' WHERE status != 'expired' AND updated_at < ?1",
                [cutoff],
            )?;
            Ok(count)
        })
    }

    /// Hard delete a session and its summaries.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM summaries WHERE session_id = ?1", [id.as_str()])?;
            conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let status_str: String = row_helpers::get(row, 1, "sessions", "status")?;
    let turns_raw: String = row_helpers::get(row, 2, "sessions", "turns")?;
    let flags_raw: String = row_helpers::get(row, 3, "sessions", "flags")?;
    let identifiers_raw: String = row_helpers::get(row, 4, "sessions", "identifiers")?;
    let pending_raw: Option<String> = row_helpers::get_opt(row, 5, "sessions", "pending_consent")?;
    let milestones_raw: String = row_helpers::get(row, 6, "sessions", "fired_milestones")?;

    let turns: Vec<TurnRecord> = row_helpers::parse_json(&turns_raw, "sessions", "turns")?;
    let flags: FlagMap = row_helpers::parse_json(&flags_raw, "sessions", "flags")?;
    let identifiers: IdentifierMap =
        row_helpers::parse_json(&identifiers_raw, "sessions", "identifiers")?;
    let pending_consent: Option<PendingConsent> = match pending_raw {
        Some(raw) => Some(row_helpers::parse_json(&raw, "sessions", "pending_consent")?),
        None => None,
    };
    let fired_milestones: BTreeSet<String> =
        row_helpers::parse_json(&milestones_raw, "sessions", "fired_milestones")?;

    Ok(Session {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        turns,
        flags,
        identifiers,
        state: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        pending_consent,
        fired_milestones,
        checkpoint_version: row_helpers::get(row, 7, "sessions", "checkpoint_version")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use usher_core::protocol::EffectDelta;

    fn repo() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_and_load() {
        let repo = repo();
        let id = SessionId::new();
        let session = repo.create(&id).unwrap();
        assert_eq!(session.checkpoint_version, 0);

        let loaded = repo.load(&id).unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.turn_count(), 0);
        assert_eq!(loaded.checkpoint_version, 0);
    }

    #[test]
    fn create_duplicate_conflicts() {
        let repo = repo();
        let id = SessionId::new();
        repo.create(&id).unwrap();
        assert!(matches!(repo.create(&id), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn load_missing_not_found() {
        let repo = repo();
        let result = repo.load(&SessionId::from_raw("sess_nope"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn checkpoint_bumps_version() {
        let repo = repo();
        let id = SessionId::new();
        let mut session = repo.create(&id).unwrap();

        session.record_turn(TurnRecord::user("hi"));
        repo.checkpoint(&mut session).unwrap();
        assert_eq!(session.checkpoint_version, 1);

        session.record_turn(TurnRecord::assistant("hello"));
        repo.checkpoint(&mut session).unwrap();
        assert_eq!(session.checkpoint_version, 2);

        let loaded = repo.load(&id).unwrap();
        assert_eq!(loaded.checkpoint_version, 2);
        assert_eq!(loaded.turn_count(), 2);
    }

    #[test]
    fn checkpoint_restore_roundtrip() {
        let repo = repo();
        let id = SessionId::new();
        let mut session = repo.create(&id).unwrap();

        session.record_turn(TurnRecord::user("onboard me"));
        session.record_turn(TurnRecord::assistant("done"));
        session
            .apply_delta(
                &EffectDelta::new()
                    .with_flag("consent_given", true)
                    .with_flag("customer_onboarded", true)
                    .with_identifier("customer_id", "CUST-001"),
            )
            .unwrap();
        session.pending_consent = Some(PendingConsent {
            tool: "book_appointment".into(),
            flag: "booking_consent".into(),
            prompt: "Confirm the booking?".into(),
        });
        session.mark_milestone("keyword-turn:0");
        repo.checkpoint(&mut session).unwrap();

        let restored = repo.load(&id).unwrap();
        assert_eq!(restored.flags, session.flags);
        assert_eq!(restored.identifiers, session.identifiers);
        assert_eq!(restored.turn_count(), session.turn_count());
        assert_eq!(restored.pending_consent, session.pending_consent);
        assert_eq!(restored.fired_milestones, session.fired_milestones);
    }

    #[test]
    fn stale_checkpoint_rejected() {
        let repo = repo();
        let id = SessionId::new();
        let mut first = repo.create(&id).unwrap();
        let mut second = repo.load(&id).unwrap();

        first.record_turn(TurnRecord::user("from first"));
        repo.checkpoint(&mut first).unwrap();

        // The second snapshot is now behind the row version
        second.record_turn(TurnRecord::user("from second"));
        let result = repo.checkpoint(&mut second);
        assert!(matches!(result, Err(StoreError::StaleCheckpoint { expected: 0, .. })));

        // The first writer's state is intact
        let loaded = repo.load(&id).unwrap();
        assert_eq!(loaded.turn_count(), 1);
        assert_eq!(loaded.turns[0].content, "from first");
    }

    #[test]
    fn checkpoint_deleted_session_not_found() {
        let repo = repo();
        let id = SessionId::new();
        let mut session = repo.create(&id).unwrap();
        repo.delete(&id).unwrap();
        assert!(matches!(
            repo.checkpoint(&mut session),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn update_status() {
        let repo = repo();
        let id = SessionId::new();
        repo.create(&id).unwrap();

        repo.update_status(&id, SessionState::Expired).unwrap();
        let loaded = repo.load(&id).unwrap();
        assert_eq!(loaded.state, SessionState::Expired);
    }

    #[test]
    fn expire_idle_flips_old_sessions() {
        let repo = repo();
        let id = SessionId::new();
        repo.create(&id).unwrap();

        // Nothing is older than an hour yet
        assert_eq!(repo.expire_idle(chrono::Duration::hours(1)).unwrap(), 0);

        // Everything is older than "-1 second from now"
        let expired = repo.expire_idle(chrono::Duration::seconds(-1)).unwrap();
        assert_eq!(expired, 1);
        assert_eq!(repo.load(&id).unwrap().state, SessionState::Expired);

        // Already-expired rows are not flipped again
        assert_eq!(repo.expire_idle(chrono::Duration::seconds(-1)).unwrap(), 0);
    }

    #[test]
    fn delete_session() {
        let repo = repo();
        let id = SessionId::new();
        repo.create(&id).unwrap();
        repo.delete(&id).unwrap();
        assert!(repo.load(&id).is_err());
        assert!(!repo.exists(&id).unwrap());
    }

    #[test]
    fn corrupt_turns_column_returns_error() {
        let db = Database::in_memory().unwrap();
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, status, turns, flags, identifiers, fired_milestones,
                                       checkpoint_version, created_at, updated_at)
                 VALUES (?1, 'checkpointed', 'not json', '{}', '{}', '[]', 0, ?2, ?2)",
                rusqlite::params![id.as_str(), now],
            )?;
            Ok(())
        })
        .unwrap();

        let repo = SessionRepo::new(db);
        let result = repo.load(&id);
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "sessions", column: "turns", .. })
        ));
    }

    #[test]
    fn invalid_status_returns_error() {
        let db = Database::in_memory().unwrap();
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, status, turns, flags, identifiers, fired_milestones,
                                       checkpoint_version, created_at, updated_at)
                 VALUES (?1, 'INVALID_STATUS', '[]', '{}', '{}', '[]', 0, ?2, ?2)",
                rusqlite::params![id.as_str(), now],
            )?;
            Ok(())
        })
        .unwrap();

        let repo = SessionRepo::new(db);
        let result = repo.load(&id);
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "sessions", column: "status", .. })
        ));
    }
}
