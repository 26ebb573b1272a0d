use tracing::instrument;

use watira_core::tools::ToolResult;
use watira_core::{SessionId, ToolCallId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Ledger of committed tool side effects, keyed by correlation id.
#[derive(Clone)]
pub struct DispatchRepo {
    db: Database,
}

impl DispatchRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a committed result. A second record for the same call id is
    /// ignored; the first result stands.
    #[instrument(skip(self, result), fields(call_id = %result.call_id))]
    pub fn record(
        &self,
        session_id: &SessionId,
        tool_name: &str,
        result: &ToolResult,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(result)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO tool_dispatches (call_id, session_id, tool_name, result, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    result.call_id.as_str(),
                    session_id.as_str(),
                    tool_name,
                    json,
                    row_helpers::now(),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    pub fn get(&self, call_id: &ToolCallId) -> Result<Option<ToolResult>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT result FROM tool_dispatches WHERE call_id = ?1")?;
            let mut rows = stmt.query([call_id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row_helpers::get(row, 0, "tool_dispatches", "result")?;
                    Ok(Some(row_helpers::parse_json(&raw, "tool_dispatches", "result")?))
                }
                None => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn record_then_get() {
        let repo = DispatchRepo::new(Database::in_memory().unwrap());
        let call_id = ToolCallId::new();
        let result = ToolResult::success(
            call_id.clone(),
            serde_json::json!({"message_id": "m1"}),
            Vec::new(),
            Duration::from_millis(12),
        );
        repo.record(&SessionId::new(), "send_email", &result).unwrap();
        assert_eq!(repo.get(&call_id).unwrap(), Some(result));
        assert!(repo.get(&ToolCallId::new()).unwrap().is_none());
    }

    #[test]
    fn first_record_wins() {
        let repo = DispatchRepo::new(Database::in_memory().unwrap());
        let call_id = ToolCallId::new();
        let session = SessionId::new();
        let first = ToolResult::success(call_id.clone(), serde_json::json!(1), Vec::new(), Duration::ZERO);
        let second = ToolResult::success(call_id.clone(), serde_json::json!(2), Vec::new(), Duration::ZERO);
        repo.record(&session, "send_email", &first).unwrap();
        repo.record(&session, "send_email", &second).unwrap();
        assert_eq!(repo.get(&call_id).unwrap().unwrap().payload, serde_json::json!(1));
    }
}
