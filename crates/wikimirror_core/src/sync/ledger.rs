//! SQLite record of the last synced state of every mirrored page.
//!
//! Front matter remains the source of truth for baselines; the ledger exists so
//! push can tell a deleted file apart from a page that was never mirrored.

use std::fs;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::error::{SyncError, SyncResult};
use crate::runtime::ResolvedPaths;

const LEDGER_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS synced_pages (
    page_id TEXT PRIMARY KEY,
    relative_path TEXT NOT NULL,
    title TEXT NOT NULL,
    version INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    last_synced_at_unix INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_synced_pages_relative_path ON synced_pages(relative_path);
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub page_id: String,
    pub relative_path: String,
    pub title: String,
    pub version: u64,
    pub content_hash: String,
    pub last_synced_at_unix: i64,
}

impl LedgerEntry {
    pub fn new(
        page_id: impl Into<String>,
        relative_path: impl Into<String>,
        title: impl Into<String>,
        version: u64,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            page_id: page_id.into(),
            relative_path: relative_path.into(),
            title: title.into(),
            version,
            content_hash: content_hash.into(),
            last_synced_at_unix: Utc::now().timestamp(),
        }
    }
}

pub struct SyncLedger {
    connection: Connection,
}

impl SyncLedger {
    pub fn open(paths: &ResolvedPaths) -> SyncResult<Self> {
        if let Some(parent) = paths.db_path.parent() {
            fs::create_dir_all(parent).map_err(|error| SyncError::file_system(parent, error))?;
        }
        let connection = Connection::open(&paths.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.pragma_update(None, "journal_mode", "WAL")?;
        connection.execute_batch(LEDGER_SCHEMA_SQL)?;
        Ok(Self { connection })
    }

    /// All entries ordered by relative path.
    pub fn entries(&self) -> SyncResult<Vec<LedgerEntry>> {
        let mut statement = self.connection.prepare(
            "SELECT page_id, relative_path, title, version, content_hash, last_synced_at_unix
             FROM synced_pages
             ORDER BY relative_path",
        )?;
        let rows = statement.query_map([], |row| {
            let version: i64 = row.get(3)?;
            Ok(LedgerEntry {
                page_id: row.get(0)?,
                relative_path: row.get(1)?,
                title: row.get(2)?,
                version: u64::try_from(version).unwrap_or_default(),
                content_hash: row.get(4)?,
                last_synced_at_unix: row.get(5)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn get(&self, page_id: &str) -> SyncResult<Option<LedgerEntry>> {
        let entry = self
            .connection
            .query_row(
                "SELECT page_id, relative_path, title, version, content_hash, last_synced_at_unix
                 FROM synced_pages
                 WHERE page_id = ?1",
                [page_id],
                |row| {
                    let version: i64 = row.get(3)?;
                    Ok(LedgerEntry {
                        page_id: row.get(0)?,
                        relative_path: row.get(1)?,
                        title: row.get(2)?,
                        version: u64::try_from(version).unwrap_or_default(),
                        content_hash: row.get(4)?,
                        last_synced_at_unix: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    pub fn upsert(&self, entry: &LedgerEntry) -> SyncResult<()> {
        self.connection.execute(
            "INSERT INTO synced_pages (
                page_id, relative_path, title, version, content_hash, last_synced_at_unix
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(page_id) DO UPDATE SET
                relative_path = excluded.relative_path,
                title = excluded.title,
                version = excluded.version,
                content_hash = excluded.content_hash,
                last_synced_at_unix = excluded.last_synced_at_unix",
            params![
                entry.page_id,
                entry.relative_path,
                entry.title,
                i64::try_from(entry.version).unwrap_or(i64::MAX),
                entry.content_hash,
                entry.last_synced_at_unix,
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, page_id: &str) -> SyncResult<()> {
        self.connection
            .execute("DELETE FROM synced_pages WHERE page_id = ?1", [page_id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::project;

    #[test]
    fn upsert_replaces_existing_entry() {
        let (_temp, paths) = project();
        let ledger = SyncLedger::open(&paths).expect("open ledger");
        ledger
            .upsert(&LedgerEntry::new("7", "pages/a.md", "A", 1, "h1"))
            .expect("insert");
        ledger
            .upsert(&LedgerEntry::new("7", "pages/b.md", "B", 2, "h2"))
            .expect("update");

        let entries = ledger.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_path, "pages/b.md");
        assert_eq!(entries[0].version, 2);
        assert_eq!(entries[0].content_hash, "h2");
    }

    #[test]
    fn entries_survive_reopen_and_can_be_removed() {
        let (_temp, paths) = project();
        {
            let ledger = SyncLedger::open(&paths).expect("open ledger");
            ledger
                .upsert(&LedgerEntry::new("2", "pages/z.md", "Z", 1, "hz"))
                .expect("insert z");
            ledger
                .upsert(&LedgerEntry::new("1", "pages/a.md", "A", 1, "ha"))
                .expect("insert a");
        }
        let ledger = SyncLedger::open(&paths).expect("reopen ledger");
        let paths_in_order: Vec<String> = ledger
            .entries()
            .expect("entries")
            .into_iter()
            .map(|entry| entry.relative_path)
            .collect();
        assert_eq!(paths_in_order, vec!["pages/a.md", "pages/z.md"]);

        ledger.remove("1").expect("remove");
        assert!(ledger.get("1").expect("get").is_none());
        assert_eq!(ledger.get("2").expect("get").map(|e| e.title), Some("Z".to_string()));
    }
}
