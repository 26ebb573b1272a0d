use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use watira_core::messages::{Message, Turn};
use watira_core::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Session metadata without history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub title: String,
    pub turn_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// A session with its full ordered history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(flatten)]
    pub record: SessionRecord,
    pub turns: Vec<Turn>,
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.record.id
    }
}

/// Per-session append locks. Held across the read-sequence/insert pair so
/// concurrent appends on one session serialize.
#[derive(Default)]
struct SessionLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    fn get(&mut self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn remove(&mut self, session_id: &str) {
        let _ = self.locks.remove(session_id);
    }
}

pub struct SessionRepo {
    db: Database,
    session_locks: Mutex<SessionLocks>,
}

const SESSION_COLUMNS: &str = "id, title, turn_count, created_at, last_activity_at";

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            session_locks: Mutex::new(SessionLocks::default()),
        }
    }

    #[instrument(skip(self))]
    pub fn create(&self, title: &str) -> Result<SessionRecord, StoreError> {
        let id = SessionId::new();
        let now = Utc::now();
        let ts = row_helpers::format_time(now);

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, title, turn_count, created_at, last_activity_at)
                 VALUES (?1, ?2, 0, ?3, ?3)",
                rusqlite::params![id.as_str(), title, ts],
            )?;
            Ok(())
        })?;

        debug!(session_id = %id, "session created");
        Ok(SessionRecord {
            id,
            title: title.to_string(),
            turn_count: 0,
            created_at: now,
            last_activity_at: now,
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_record(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// Load a session with its whole history, ordered by sequence.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn load(&self, id: &SessionId) -> Result<Session, StoreError> {
        let record = self.get(id)?;
        let turns = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sequence, role, payload, created_at FROM turns
                 WHERE session_id = ?1 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut turns = Vec::new();
            while let Some(row) = rows.next()? {
                turns.push(row_to_turn(row)?);
            }
            Ok(turns)
        })?;
        Ok(Session { record, turns })
    }

    /// The last `limit` turns, oldest first. Leading tool results whose
    /// originating call fell outside the window are dropped.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn recent_turns(&self, id: &SessionId, limit: usize) -> Result<Vec<Turn>, StoreError> {
        let _ = self.get(id)?;
        let mut turns = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sequence, role, payload, created_at FROM turns
                 WHERE session_id = ?1 ORDER BY sequence DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![id.as_str(), limit as i64])?;
            let mut turns = Vec::new();
            while let Some(row) = rows.next()? {
                turns.push(row_to_turn(row)?);
            }
            Ok(turns)
        })?;
        turns.reverse();

        let dangling = turns
            .iter()
            .take_while(|t| matches!(t.message, Message::ToolResult(_)))
            .count();
        turns.drain(..dangling);
        Ok(turns)
    }

    /// Append one turn. Atomic: the turn row, the turn count and the
    /// activity timestamp commit together or not at all.
    #[instrument(skip(self, message), fields(session_id = %id, role = %message.role()))]
    pub fn append(&self, id: &SessionId, message: &Message) -> Result<Turn, StoreError> {
        let lock = self.session_locks.lock().get(id.as_str());
        let _guard = lock.lock();

        let payload = serde_json::to_string(message)?;
        let role = message.role();
        let now = Utc::now();
        let ts = row_helpers::format_time(now);

        let sequence = self.db.with_tx(|tx| {
            let next: i64 = tx
                .query_row(
                    "SELECT COALESCE((SELECT MAX(sequence) FROM turns WHERE session_id = ?1), -1) + 1
                     FROM sessions WHERE id = ?1",
                    [id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        StoreError::NotFound(format!("session {id}"))
                    }
                    other => other.into(),
                })?;

            tx.execute(
                "INSERT INTO turns (session_id, sequence, role, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), next, role.to_string(), payload, ts],
            )?;
            tx.execute(
                "UPDATE sessions SET turn_count = turn_count + 1, last_activity_at = ?1 WHERE id = ?2",
                rusqlite::params![ts, id.as_str()],
            )?;
            Ok(next)
        })?;

        Ok(Turn {
            sequence: sequence as u64,
            role,
            message: message.clone(),
            created_at: now,
        })
    }

    /// Sessions ordered by last activity, newest first.
    #[instrument(skip(self))]
    pub fn list(&self, limit: u32, offset: u32) -> Result<Vec<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 ORDER BY last_activity_at DESC LIMIT ?1 OFFSET ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![limit, offset])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_record(row)?);
            }
            Ok(out)
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn rename(&self, id: &SessionId, title: &str) -> Result<(), StoreError> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET title = ?1 WHERE id = ?2",
                rusqlite::params![title, id.as_str()],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    /// Delete a session and its turns.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        let lock = self.session_locks.lock().get(id.as_str());
        let _guard = lock.lock();

        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?)
        })?;
        drop(_guard);
        self.session_locks.lock().remove(id.as_str());

        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    /// Delete sessions idle for longer than `idle_for`, skipping any id in
    /// `protected`. Returns the reclaimed ids.
    #[instrument(skip(self, protected), fields(protected = protected.len()))]
    pub fn reclaim_idle(
        &self,
        idle_for: Duration,
        protected: &HashSet<SessionId>,
    ) -> Result<Vec<SessionId>, StoreError> {
        let idle_for = chrono::Duration::from_std(idle_for)
            .map_err(|e| StoreError::Database(format!("idle threshold: {e}")))?;
        let cutoff = row_helpers::format_time(Utc::now() - idle_for);

        let candidates: Vec<SessionId> = self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM sessions WHERE last_activity_at < ?1")?;
            let rows = stmt.query_map([&cutoff], |row| row.get::<_, String>(0))?;
            let ids = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(SessionId::from_raw).collect())
        })?;

        let mut reclaimed = Vec::new();
        for id in candidates {
            if protected.contains(&id) {
                continue;
            }
            let lock = self.session_locks.lock().get(id.as_str());
            let guard = lock.lock();
            // Re-check under the append lock: a turn may have landed since the scan.
            let deleted = self.db.with_conn(|conn| {
                Ok(conn.execute(
                    "DELETE FROM sessions WHERE id = ?1 AND last_activity_at < ?2",
                    rusqlite::params![id.as_str(), cutoff],
                )?)
            })?;
            drop(guard);
            if deleted > 0 {
                self.session_locks.lock().remove(id.as_str());
                reclaimed.push(id);
            }
        }

        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "reclaimed idle sessions");
        }
        Ok(reclaimed)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<SessionRecord, StoreError> {
    let id: String = row_helpers::get(row, 0, "sessions", "id")?;
    let turn_count: i64 = row_helpers::get(row, 2, "sessions", "turn_count")?;
    let created_at: String = row_helpers::get(row, 3, "sessions", "created_at")?;
    let last_activity_at: String = row_helpers::get(row, 4, "sessions", "last_activity_at")?;
    Ok(SessionRecord {
        id: SessionId::from_raw(id),
        title: row_helpers::get(row, 1, "sessions", "title")?,
        turn_count: turn_count as u64,
        created_at: row_helpers::parse_time(&created_at, "sessions", "created_at")?,
        last_activity_at: row_helpers::parse_time(&last_activity_at, "sessions", "last_activity_at")?,
    })
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> Result<Turn, StoreError> {
    let sequence: i64 = row_helpers::get(row, 0, "turns", "sequence")?;
    let role: String = row_helpers::get(row, 1, "turns", "role")?;
    let payload: String = row_helpers::get(row, 2, "turns", "payload")?;
    let created_at: String = row_helpers::get(row, 3, "turns", "created_at")?;
    Ok(Turn {
        sequence: sequence as u64,
        role: row_helpers::parse_enum(&role, "turns", "role")?,
        message: row_helpers::parse_json(&payload, "turns", "payload")?,
        created_at: row_helpers::parse_time(&created_at, "turns", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use watira_core::messages::{AssistantContent, AssistantMessage, StopReason};
    use watira_core::tools::{ToolCall, ToolResult};

    fn repo() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    fn backdate(repo: &SessionRepo, id: &SessionId, secs: i64) {
        let ts = row_helpers::format_time(Utc::now() - chrono::Duration::seconds(secs));
        repo.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
                    rusqlite::params![ts, id.as_str()],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let created = repo.create("hello").unwrap();
        let fetched = repo.get(&created.id).unwrap();
        assert_eq!(fetched.title, "hello");
        assert_eq!(fetched.turn_count, 0);
    }

    #[test]
    fn load_unknown_is_not_found() {
        let repo = repo();
        let err = repo.load(&SessionId::from_raw("sess_missing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn append_to_unknown_is_not_found() {
        let repo = repo();
        let err = repo
            .append(&SessionId::from_raw("sess_missing"), &Message::user_text("x"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn sequential_appends_load_in_order() {
        let repo = repo();
        let session = repo.create("t").unwrap();
        let messages: Vec<Message> = (0..10)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user_text(format!("q{i}"))
                } else {
                    Message::assistant_text(format!("a{i}"))
                }
            })
            .collect();
        for m in &messages {
            repo.append(&session.id, m).unwrap();
        }

        let loaded = repo.load(&session.id).unwrap();
        let got: Vec<Message> = loaded.turns.iter().map(|t| t.message.clone()).collect();
        assert_eq!(got, messages);
        let seqs: Vec<u64> = loaded.turns.iter().map(|t| t.sequence).collect();
        assert_eq!(seqs, (0..10).collect::<Vec<u64>>());
        assert_eq!(loaded.record.turn_count, 10);
    }

    #[test]
    fn concurrent_appends_serialize() {
        let repo = Arc::new(repo());
        let session = repo.create("t").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let repo = repo.clone();
                let id = session.id.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        repo.append(&id, &Message::user_text(format!("{t}-{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let loaded = repo.load(&session.id).unwrap();
        assert_eq!(loaded.turns.len(), 200);
        for (i, turn) in loaded.turns.iter().enumerate() {
            assert_eq!(turn.sequence, i as u64);
        }
        // Per-thread order is preserved.
        for t in 0..8 {
            let own: Vec<String> = loaded
                .turns
                .iter()
                .map(|turn| turn.message.text())
                .filter(|text| text.starts_with(&format!("{t}-")))
                .collect();
            let expected: Vec<String> = (0..25).map(|i| format!("{t}-{i}")).collect();
            assert_eq!(own, expected);
        }
    }

    #[test]
    fn structured_turns_roundtrip() {
        let repo = repo();
        let session = repo.create("t").unwrap();
        let call = ToolCall::new("send_email", serde_json::json!({"to": "x@y.com"}));
        let assistant = Message::Assistant(AssistantMessage {
            content: vec![AssistantContent::ToolCall(call.clone())],
            usage: None,
            stop_reason: Some(StopReason::ToolUse),
        });
        let result = ToolResult::success(
            call.id.clone(),
            serde_json::json!({"status": "sent"}),
            Vec::new(),
            Duration::from_millis(3),
        );
        let tool = Message::from_tool_result("send_email", &result);

        repo.append(&session.id, &Message::user_text("mail it")).unwrap();
        repo.append(&session.id, &assistant).unwrap();
        let turn = repo.append(&session.id, &tool).unwrap();
        assert_eq!(turn.role, watira_core::Role::Tool);

        let loaded = repo.load(&session.id).unwrap();
        assert_eq!(loaded.turns[1].message, assistant);
        assert_eq!(loaded.turns[2].message, tool);
    }

    #[test]
    fn recent_turns_windows_and_skips_dangling_results() {
        let repo = repo();
        let session = repo.create("t").unwrap();
        let call = ToolCall::new("read_email", serde_json::json!({}));
        let result = ToolResult::success(call.id.clone(), serde_json::json!([]), Vec::new(), Duration::ZERO);

        repo.append(&session.id, &Message::user_text("q")).unwrap();
        repo.append(
            &session.id,
            &Message::Assistant(AssistantMessage {
                content: vec![AssistantContent::ToolCall(call)],
                usage: None,
                stop_reason: Some(StopReason::ToolUse),
            }),
        )
        .unwrap();
        repo.append(&session.id, &Message::from_tool_result("read_email", &result)).unwrap();
        repo.append(&session.id, &Message::assistant_text("none")).unwrap();

        let window = repo.recent_turns(&session.id, 2).unwrap();
        // [tool_result, assistant] → the tool result has lost its call.
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].message.text(), "none");

        let all = repo.recent_turns(&session.id, 20).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].sequence, 0);
    }

    #[test]
    fn list_orders_by_activity() {
        let repo = repo();
        let a = repo.create("a").unwrap();
        let b = repo.create("b").unwrap();
        backdate(&repo, &b.id, 60);
        repo.append(&a.id, &Message::user_text("x")).unwrap();

        let list = repo.list(10, 0).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, a.id);
        assert_eq!(list[1].id, b.id);
    }

    #[test]
    fn rename_and_delete() {
        let repo = repo();
        let s = repo.create("old").unwrap();
        repo.append(&s.id, &Message::user_text("x")).unwrap();

        repo.rename(&s.id, "new").unwrap();
        assert_eq!(repo.get(&s.id).unwrap().title, "new");

        repo.delete(&s.id).unwrap();
        assert!(repo.load(&s.id).unwrap_err().is_not_found());
        assert!(repo.delete(&s.id).unwrap_err().is_not_found());
        assert!(repo.rename(&s.id, "again").unwrap_err().is_not_found());

        let orphan_turns: i64 = repo
            .db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM turns", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(orphan_turns, 0);
    }

    #[test]
    fn reclaim_skips_fresh_and_protected_sessions() {
        let repo = repo();
        let idle = repo.create("idle").unwrap();
        let busy = repo.create("busy").unwrap();
        let fresh = repo.create("fresh").unwrap();
        backdate(&repo, &idle.id, 3600);
        backdate(&repo, &busy.id, 3600);

        let protected: HashSet<SessionId> = [busy.id.clone()].into_iter().collect();
        let reclaimed = repo.reclaim_idle(Duration::from_secs(600), &protected).unwrap();

        assert_eq!(reclaimed, vec![idle.id.clone()]);
        assert!(repo.get(&idle.id).unwrap_err().is_not_found());
        assert!(repo.get(&busy.id).is_ok());
        assert!(repo.get(&fresh.id).is_ok());
    }
}
