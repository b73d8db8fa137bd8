use chrono::Utc;
use tracing::instrument;

use maestro_core::ids::{SessionId, TaskId};
use maestro_core::session::{CreateSession, Session, SessionPatch};
use maestro_core::status::SessionStatus;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const SELECT_COLUMNS: &str = "id, title, status, cwd, model, temperature, resume_token, \
     task_id, last_prompt, is_pinned, input_tokens, output_tokens, created_at, updated_at";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new session in `idle` status.
    #[instrument(skip(self, params), fields(title = %params.title))]
    pub fn create(&self, params: &CreateSession) -> Result<Session, StoreError> {
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, title, status, cwd, model, temperature, task_id, created_at, updated_at)
                 VALUES (?1, ?2, 'idle', ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id.as_str(),
                    params.title,
                    params.cwd,
                    params.model,
                    params.temperature,
                    params.task_id.as_ref().map(|t| t.as_str()),
                    now,
                    now,
                ],
            )?;

            Ok(Session {
                id,
                title: params.title.clone(),
                status: SessionStatus::Idle,
                cwd: params.cwd.clone(),
                model: params.model.clone(),
                temperature: params.temperature,
                resume_token: None,
                task_id: params.task_id.clone(),
                last_prompt: None,
                is_pinned: false,
                input_tokens: 0,
                output_tokens: 0,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a session by ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM sessions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// List all sessions, pinned first, then most recently updated.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM sessions ORDER BY is_pinned DESC, updated_at DESC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Apply a partial update. `None` fields are left untouched.
    #[instrument(skip(self, patch), fields(session_id = %id))]
    pub fn update(&self, id: &SessionId, patch: &SessionPatch) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let mut updates = vec!["updated_at = ?1".to_string()];
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now.clone())];
            let mut idx = 2;

            if let Some(ref title) = patch.title {
                updates.push(format!("title = ?{idx}"));
                values.push(Box::new(title.clone()));
                idx += 1;
            }
            if let Some(status) = patch.status {
                updates.push(format!("status = ?{idx}"));
                values.push(Box::new(status.to_string()));
                idx += 1;
            }
            if let Some(ref cwd) = patch.cwd {
                updates.push(format!("cwd = ?{idx}"));
                values.push(Box::new(cwd.clone()));
                idx += 1;
            }
            if let Some(ref model) = patch.model {
                updates.push(format!("model = ?{idx}"));
                values.push(Box::new(model.clone()));
                idx += 1;
            }
            if let Some(ref last_prompt) = patch.last_prompt {
                updates.push(format!("last_prompt = ?{idx}"));
                values.push(Box::new(last_prompt.clone()));
                idx += 1;
            }
            if let Some(ref resume_token) = patch.resume_token {
                updates.push(format!("resume_token = ?{idx}"));
                values.push(Box::new(resume_token.clone()));
                idx += 1;
            }

            let sql = format!("UPDATE sessions SET {} WHERE id = ?{idx}", updates.join(", "));
            values.push(Box::new(id.as_str().to_string()));

            let params_refs: Vec<&dyn rusqlite::ToSql> =
                values.iter().map(|v| v.as_ref()).collect();
            let changed = conn.execute(&sql, params_refs.as_slice())?;
            Ok(changed > 0)
        })
    }

    /// Delete a session and its messages.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM messages WHERE session_id = ?1", [id.as_str()])?;
            let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(changed > 0)
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn set_pinned(&self, id: &SessionId, is_pinned: bool) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET is_pinned = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![if is_pinned { 1 } else { 0 }, now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Add a run's token usage to the session accumulators.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn add_tokens(&self, id: &SessionId, input: i64, output: i64) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET
                    input_tokens = input_tokens + ?1,
                    output_tokens = output_tokens + ?2,
                    updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![input, output, now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Drop the backend conversation handle. Used after history edits,
    /// which invalidate the backend-side conversation.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn clear_resume_token(&self, id: &SessionId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET resume_token = NULL, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Member sessions of a task, in creation order.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub fn list_by_task(&self, task_id: &TaskId) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM sessions WHERE task_id = ?1 ORDER BY created_at ASC"
            ))?;
            let mut rows = stmt.query([task_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Reset every `running` session to `idle`. Called on startup to clean
    /// up sessions whose runner died with the previous process.
    #[instrument(skip(self))]
    pub fn reset_running(&self) -> Result<usize, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = 'idle', updated_at = ?1 WHERE status = 'running'",
                rusqlite::params![now],
            )?;
            Ok(changed)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let status_str: String = row_helpers::get(row, 2, "sessions", "status")?;

    Ok(Session {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        title: row_helpers::get(row, 1, "sessions", "title")?,
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        cwd: row_helpers::get_opt(row, 3, "sessions", "cwd")?,
        model: row_helpers::get_opt(row, 4, "sessions", "model")?,
        temperature: row_helpers::get_opt(row, 5, "sessions", "temperature")?,
        resume_token: row_helpers::get_opt(row, 6, "sessions", "resume_token")?,
        task_id: row_helpers::get_opt::<String>(row, 7, "sessions", "task_id")?.map(TaskId::from_raw),
        last_prompt: row_helpers::get_opt(row, 8, "sessions", "last_prompt")?,
        is_pinned: row_helpers::get::<i64>(row, 9, "sessions", "is_pinned")? != 0,
        input_tokens: row_helpers::get(row, 10, "sessions", "input_tokens")?,
        output_tokens: row_helpers::get(row, 11, "sessions", "output_tokens")?,
        created_at: row_helpers::get(row, 12, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 13, "sessions", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    fn params(title: &str) -> CreateSession {
        CreateSession {
            title: title.into(),
            ..Default::default()
        }
    }

    #[test]
    fn create_session_starts_idle() {
        let repo = setup();
        let session = repo.create(&params("Chat")).unwrap();
        assert!(session.id.as_str().starts_with("sess_"));
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.resume_token.is_none());
        assert!(!session.is_pinned);
    }

    #[test]
    fn get_session() {
        let repo = setup();
        let session = repo.create(&params("Chat")).unwrap();
        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.title, "Chat");
    }

    #[test]
    fn get_nonexistent_is_not_found() {
        let repo = setup();
        let result = repo.get(&SessionId::from_raw("sess_nonexistent"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn update_status_and_resume_token() {
        let repo = setup();
        let session = repo.create(&params("Chat")).unwrap();

        let patch = SessionPatch {
            status: Some(SessionStatus::Running),
            resume_token: Some("conv_abc".into()),
            ..Default::default()
        };
        assert!(repo.update(&session.id, &patch).unwrap());

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.status, SessionStatus::Running);
        assert_eq!(fetched.resume_token.as_deref(), Some("conv_abc"));
    }

    #[test]
    fn update_unknown_session_changes_nothing() {
        let repo = setup();
        let patch = SessionPatch::status(SessionStatus::Error);
        assert!(!repo.update(&SessionId::new(), &patch).unwrap());
    }

    #[test]
    fn pinned_sessions_list_first() {
        let repo = setup();
        let a = repo.create(&params("a")).unwrap();
        let b = repo.create(&params("b")).unwrap();
        repo.set_pinned(&a.id, true).unwrap();

        let all = repo.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, a.id);
        assert!(all[0].is_pinned);
        assert_eq!(all[1].id, b.id);
    }

    #[test]
    fn add_tokens_accumulates() {
        let repo = setup();
        let session = repo.create(&params("Chat")).unwrap();
        repo.add_tokens(&session.id, 100, 50).unwrap();
        repo.add_tokens(&session.id, 20, 5).unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.input_tokens, 120);
        assert_eq!(fetched.output_tokens, 55);
    }

    #[test]
    fn clear_resume_token() {
        let repo = setup();
        let session = repo.create(&params("Chat")).unwrap();
        repo.update(
            &session.id,
            &SessionPatch { resume_token: Some("conv_abc".into()), ..Default::default() },
        )
        .unwrap();
        assert!(repo.get(&session.id).unwrap().resume_token.is_some());

        repo.clear_resume_token(&session.id).unwrap();
        assert!(repo.get(&session.id).unwrap().resume_token.is_none());
    }

    #[test]
    fn delete_session() {
        let repo = setup();
        let session = repo.create(&params("Chat")).unwrap();
        assert!(repo.delete(&session.id).unwrap());
        assert!(repo.get(&session.id).is_err());
        assert!(!repo.delete(&session.id).unwrap());
    }

    #[test]
    fn list_by_task_in_creation_order() {
        let repo = setup();
        let task_id = TaskId::new();
        let mk = |title: &str| CreateSession {
            title: title.into(),
            task_id: Some(task_id.clone()),
            ..Default::default()
        };
        let a = repo.create(&mk("thread-1")).unwrap();
        let b = repo.create(&mk("thread-2")).unwrap();
        repo.create(&params("standalone")).unwrap();

        let members = repo.list_by_task(&task_id).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].id, a.id);
        assert_eq!(members[1].id, b.id);
    }

    #[test]
    fn reset_running_flips_to_idle() {
        let repo = setup();
        let a = repo.create(&params("a")).unwrap();
        let b = repo.create(&params("b")).unwrap();
        repo.update(&a.id, &SessionPatch::status(SessionStatus::Running)).unwrap();
        repo.update(&b.id, &SessionPatch::status(SessionStatus::Completed)).unwrap();

        let reset = repo.reset_running().unwrap();
        assert_eq!(reset, 1);
        assert_eq!(repo.get(&a.id).unwrap().status, SessionStatus::Idle);
        assert_eq!(repo.get(&b.id).unwrap().status, SessionStatus::Completed);
    }

    #[test]
    fn invalid_status_is_corrupt_row() {
        let repo = setup();
        let session = repo.create(&params("Chat")).unwrap();
        repo.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE sessions SET status = 'BOGUS' WHERE id = ?1",
                    [session.id.as_str()],
                )?;
                Ok(())
            })
            .unwrap();

        let result = repo.get(&session.id);
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }
}
