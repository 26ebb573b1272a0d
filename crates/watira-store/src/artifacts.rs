use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Persisted artifact bytes keyed by content fingerprint.
#[derive(Clone, Debug, PartialEq)]
pub struct ArtifactRow {
    pub fingerprint: String,
    pub kind: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Backing table for the in-memory artifact cache.
#[derive(Clone)]
pub struct ArtifactRepo {
    db: Database,
}

impl ArtifactRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert an artifact. Existing rows are left untouched: an artifact
    /// never changes once stored.
    #[instrument(skip(self, row), fields(fingerprint = %row.fingerprint, size = row.bytes.len()))]
    pub fn put(&self, row: &ArtifactRow) -> Result<(), StoreError> {
        let created = row_helpers::format_time(row.created_at);
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO artifacts
                 (fingerprint, kind, mime_type, bytes, size_bytes, created_at, last_access_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                rusqlite::params![
                    row.fingerprint,
                    row.kind,
                    row.mime_type,
                    row.bytes,
                    row.bytes.len() as i64,
                    created,
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch an artifact and bump its access time.
    #[instrument(skip(self))]
    pub fn get(&self, fingerprint: &str) -> Result<Option<ArtifactRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT fingerprint, kind, mime_type, bytes, created_at
                 FROM artifacts WHERE fingerprint = ?1",
            )?;
            let mut rows = stmt.query([fingerprint])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };
            let created_at: String = row_helpers::get(row, 4, "artifacts", "created_at")?;
            let artifact = ArtifactRow {
                fingerprint: row_helpers::get(row, 0, "artifacts", "fingerprint")?,
                kind: row_helpers::get(row, 1, "artifacts", "kind")?,
                mime_type: row_helpers::get(row, 2, "artifacts", "mime_type")?,
                bytes: row_helpers::get(row, 3, "artifacts", "bytes")?,
                created_at: row_helpers::parse_time(&created_at, "artifacts", "created_at")?,
            };
            drop(rows);
            conn.execute(
                "UPDATE artifacts SET last_access_at = ?1 WHERE fingerprint = ?2",
                rusqlite::params![row_helpers::now(), fingerprint],
            )?;
            Ok(Some(artifact))
        })
    }

    pub fn delete(&self, fingerprint: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM artifacts WHERE fingerprint = ?1", [fingerprint])? > 0)
        })
    }

    /// Trim the table to the `max_entries` most recently accessed rows.
    #[instrument(skip(self))]
    pub fn prune(&self, max_entries: usize) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM artifacts WHERE fingerprint NOT IN
                 (SELECT fingerprint FROM artifacts ORDER BY last_access_at DESC LIMIT ?1)",
                [max_entries as i64],
            )?)
        })
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM artifacts", [], |r| r.get(0))?;
            Ok(n as usize)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fp: &str, bytes: &[u8]) -> ArtifactRow {
        ArtifactRow {
            fingerprint: fp.into(),
            kind: "diagram".into(),
            mime_type: "image/svg+xml".into(),
            bytes: bytes.to_vec(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn put_and_get() {
        let repo = ArtifactRepo::new(Database::in_memory().unwrap());
        repo.put(&row("abc", b"<svg/>")).unwrap();
        let got = repo.get("abc").unwrap().unwrap();
        assert_eq!(got.bytes, b"<svg/>");
        assert_eq!(got.mime_type, "image/svg+xml");
        assert!(repo.get("missing").unwrap().is_none());
    }

    #[test]
    fn put_never_overwrites() {
        let repo = ArtifactRepo::new(Database::in_memory().unwrap());
        repo.put(&row("abc", b"first")).unwrap();
        repo.put(&row("abc", b"second")).unwrap();
        assert_eq!(repo.get("abc").unwrap().unwrap().bytes, b"first");
    }

    #[test]
    fn prune_keeps_most_recent() {
        let repo = ArtifactRepo::new(Database::in_memory().unwrap());
        for i in 0..5 {
            repo.put(&row(&format!("fp{i}"), b"x")).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        // Touch the oldest so it survives.
        repo.get("fp0").unwrap();

        let removed = repo.prune(2).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(repo.count().unwrap(), 2);
        assert!(repo.get("fp0").unwrap().is_some());
        assert!(repo.get("fp4").unwrap().is_some());
    }

    #[test]
    fn delete_reports_presence() {
        let repo = ArtifactRepo::new(Database::in_memory().unwrap());
        repo.put(&row("abc", b"x")).unwrap();
        assert!(repo.delete("abc").unwrap());
        assert!(!repo.delete("abc").unwrap());
    }
}
