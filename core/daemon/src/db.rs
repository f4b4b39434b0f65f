//! SQLite persistence for toolcrib-daemon.
//!
//! The daemon is the single writer. Every operation opens its own connection
//! and drops it when done; nothing holds a connection across poll iterations.
//! Loan changes run in `BEGIN IMMEDIATE` transactions so two callers racing on
//! the same tool serialize instead of both seeing "no open loan".

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use toolcrib_protocol::{LoanAction, LoanHistoryEntry, OpenLoan, TagKind};

use crate::error::StorageError;
use crate::gateway::{LoanGateway, LoanOutcome};
use crate::tag::TagId;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

pub struct Db {
    path: PathBuf,
    station_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagRecord {
    pub tag_id: String,
    pub kind: TagKind,
    pub display_name: String,
    pub registered_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Updated,
}

impl Db {
    pub fn new(path: PathBuf, station_id: impl Into<String>) -> Result<Self, StorageError> {
        let db = Self {
            path,
            station_id: station_id.into(),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tags
    // ─────────────────────────────────────────────────────────────────────

    /// Registers or renames a tag. A tag keeps the kind it was first
    /// registered with; tool tags must use a catalogued tool name.
    pub fn register_tag(
        &self,
        id: &TagId,
        kind: TagKind,
        name: &str,
    ) -> Result<Registration, StorageError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StorageError::InvalidInput("name is required".to_string()));
        }

        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(StorageError::sqlite("Failed to start registration transaction"))?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT kind FROM tags WHERE tag_id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StorageError::sqlite("Failed to query tag"))?;

            if let Some(existing_kind) = existing.as_deref() {
                if existing_kind != kind.as_str() {
                    return Err(StorageError::Conflict(format!(
                        "tag {} is already registered as a {}",
                        id, existing_kind
                    )));
                }
            }

            if kind == TagKind::Tool {
                let catalogued: bool = tx
                    .query_row(
                        "SELECT EXISTS(SELECT 1 FROM tool_names WHERE name = ?1)",
                        params![name],
                        |row| row.get(0),
                    )
                    .map_err(StorageError::sqlite("Failed to query tool names"))?;
                if !catalogued {
                    return Err(StorageError::InvalidInput(format!(
                        "unknown tool name '{}'; add it to the tool name list first",
                        name
                    )));
                }
            }

            let now = timestamp(Utc::now());
            tx.execute(
                "INSERT INTO tags (tag_id, kind, display_name, registered_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4) \
                 ON CONFLICT(tag_id) DO UPDATE SET \
                    display_name = excluded.display_name, \
                    updated_at = excluded.updated_at",
                params![id.as_str(), kind.as_str(), name, now],
            )
            .map_err(StorageError::sqlite("Failed to upsert tag"))?;

            tx.commit()
                .map_err(StorageError::sqlite("Failed to commit registration"))?;

            Ok(if existing.is_some() {
                Registration::Updated
            } else {
                Registration::Created
            })
        })
    }

    pub fn lookup_tag(&self, id: &TagId) -> Result<Option<TagRecord>, StorageError> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT tag_id, kind, display_name, registered_at, updated_at \
                 FROM tags WHERE tag_id = ?1",
                params![id.as_str()],
                |row| {
                    let kind: String = row.get(1)?;
                    Ok(TagRecord {
                        tag_id: row.get(0)?,
                        kind: TagKind::from_str(&kind).unwrap_or(TagKind::User),
                        display_name: row.get(2)?,
                        registered_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(StorageError::sqlite("Failed to look up tag"))
        })
    }

    fn display_name(&self, id: &TagId, kind: TagKind) -> Result<String, StorageError> {
        let name: Option<String> = self.with_connection(|conn| {
            conn.query_row(
                "SELECT display_name FROM tags WHERE tag_id = ?1 AND kind = ?2",
                params![id.as_str(), kind.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::sqlite("Failed to query display name"))
        })?;
        Ok(name.unwrap_or_else(|| id.to_string()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tool name list
    // ─────────────────────────────────────────────────────────────────────

    pub fn list_tool_names(&self) -> Result<Vec<String>, StorageError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT name FROM tool_names ORDER BY name ASC")
                .map_err(StorageError::sqlite("Failed to prepare tool names query"))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(StorageError::sqlite("Failed to read tool names"))?;

            let mut names = Vec::new();
            for row in rows {
                names.push(row.map_err(StorageError::sqlite("Failed to decode tool name"))?);
            }
            Ok(names)
        })
    }

    /// Returns `true` if the name was new.
    pub fn add_tool_name(&self, name: &str) -> Result<bool, StorageError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StorageError::InvalidInput("name is required".to_string()));
        }

        self.with_connection(|conn| {
            let inserted = conn
                .execute(
                    "INSERT INTO tool_names (name, created_at) VALUES (?1, ?2) \
                     ON CONFLICT(name) DO NOTHING",
                    params![name, timestamp(Utc::now())],
                )
                .map_err(StorageError::sqlite("Failed to insert tool name"))?;
            Ok(inserted > 0)
        })
    }

    /// Returns `true` if a name was removed. Names still assigned to a
    /// registered tool are refused.
    pub fn delete_tool_name(&self, name: &str) -> Result<bool, StorageError> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(StorageError::sqlite("Failed to start tool name transaction"))?;

            let assigned: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM tags WHERE kind = 'tool' AND display_name = ?1)",
                    params![name],
                    |row| row.get(0),
                )
                .map_err(StorageError::sqlite("Failed to check tool name usage"))?;
            if assigned {
                return Err(StorageError::Conflict(format!(
                    "tool name '{}' is assigned to a registered tool; rename or remove that tool first",
                    name
                )));
            }

            let deleted = tx
                .execute("DELETE FROM tool_names WHERE name = ?1", params![name])
                .map_err(StorageError::sqlite("Failed to delete tool name"))?;
            tx.commit()
                .map_err(StorageError::sqlite("Failed to commit tool name delete"))?;
            Ok(deleted > 0)
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Loans
    // ─────────────────────────────────────────────────────────────────────

    pub fn borrow_or_return_at(
        &self,
        user: &TagId,
        tool: &TagId,
        now: DateTime<Utc>,
    ) -> Result<LoanOutcome, StorageError> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(StorageError::sqlite("Failed to start loan transaction"))?;

            let open_loan: Option<(i64, String)> = tx
                .query_row(
                    "SELECT id, borrower_id FROM loans \
                     WHERE tool_id = ?1 AND returned_at IS NULL \
                     ORDER BY loaned_at DESC, id DESC LIMIT 1",
                    params![tool.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(StorageError::sqlite("Failed to query open loan"))?;

            let now = timestamp(now);
            let outcome = match open_loan {
                Some((loan_id, borrower_id)) => {
                    tx.execute(
                        "UPDATE loans SET returned_at = ?1, returner_id = ?2 WHERE id = ?3",
                        params![now, user.as_str(), loan_id],
                    )
                    .map_err(StorageError::sqlite("Failed to close loan"))?;
                    LoanOutcome {
                        action: LoanAction::Return,
                        loan_id,
                        prior_borrower_id: Some(borrower_id),
                    }
                }
                None => {
                    tx.execute(
                        "INSERT INTO loans (tool_id, borrower_id, loaned_at) VALUES (?1, ?2, ?3)",
                        params![tool.as_str(), user.as_str(), now],
                    )
                    .map_err(StorageError::sqlite("Failed to open loan"))?;
                    LoanOutcome {
                        action: LoanAction::Borrow,
                        loan_id: tx.last_insert_rowid(),
                        prior_borrower_id: None,
                    }
                }
            };

            tx.commit()
                .map_err(StorageError::sqlite("Failed to commit loan transaction"))?;
            Ok(outcome)
        })
    }

    pub fn open_loans(&self, limit: usize) -> Result<Vec<OpenLoan>, StorageError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT l.id, \
                            COALESCE(t.display_name, l.tool_id), \
                            COALESCE(u.display_name, l.borrower_id), \
                            l.loaned_at \
                       FROM loans l \
                  LEFT JOIN tags t ON t.tag_id = l.tool_id AND t.kind = 'tool' \
                  LEFT JOIN tags u ON u.tag_id = l.borrower_id AND u.kind = 'user' \
                      WHERE l.returned_at IS NULL \
                   ORDER BY l.loaned_at DESC, l.id DESC \
                      LIMIT ?1",
                )
                .map_err(StorageError::sqlite("Failed to prepare open loans query"))?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok(OpenLoan {
                        loan_id: row.get(0)?,
                        tool: row.get(1)?,
                        borrower: row.get(2)?,
                        loaned_at: row.get(3)?,
                    })
                })
                .map_err(StorageError::sqlite("Failed to read open loans"))?;

            let mut loans = Vec::new();
            for row in rows {
                loans.push(row.map_err(StorageError::sqlite("Failed to decode open loan"))?);
            }
            Ok(loans)
        })
    }

    pub fn recent_history(&self, limit: usize) -> Result<Vec<LoanHistoryEntry>, StorageError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT l.id, \
                            COALESCE(t.display_name, l.tool_id), \
                            COALESCE(u.display_name, l.borrower_id), \
                            CASE WHEN l.returner_id IS NULL THEN NULL \
                                 ELSE COALESCE(r.display_name, l.returner_id) END, \
                            l.loaned_at, \
                            l.returned_at \
                       FROM loans l \
                  LEFT JOIN tags t ON t.tag_id = l.tool_id AND t.kind = 'tool' \
                  LEFT JOIN tags u ON u.tag_id = l.borrower_id AND u.kind = 'user' \
                  LEFT JOIN tags r ON r.tag_id = l.returner_id AND r.kind = 'user' \
                   ORDER BY COALESCE(l.returned_at, l.loaned_at) DESC, l.id DESC \
                      LIMIT ?1",
                )
                .map_err(StorageError::sqlite("Failed to prepare history query"))?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    let returned_at: Option<String> = row.get(5)?;
                    Ok(LoanHistoryEntry {
                        loan_id: row.get(0)?,
                        action: if returned_at.is_some() {
                            LoanAction::Return
                        } else {
                            LoanAction::Borrow
                        },
                        tool: row.get(1)?,
                        borrower: row.get(2)?,
                        returner: row.get(3)?,
                        loaned_at: row.get(4)?,
                        returned_at,
                    })
                })
                .map_err(StorageError::sqlite("Failed to read loan history"))?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(StorageError::sqlite("Failed to decode loan history"))?);
            }
            Ok(entries)
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Scan log
    // ─────────────────────────────────────────────────────────────────────

    fn insert_scan(&self, id: &TagId, role: TagKind) -> Result<(), StorageError> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO scan_events (recorded_at, station_id, tag_id, role_hint) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    timestamp(Utc::now()),
                    self.station_id,
                    id.as_str(),
                    role.as_str()
                ],
            )
            .map_err(StorageError::sqlite("Failed to insert scan event"))?;
            Ok(())
        })
    }

    #[cfg(test)]
    pub fn recent_scans(&self, limit: usize) -> Result<Vec<(String, String, String)>, StorageError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT station_id, tag_id, role_hint FROM scan_events \
                     ORDER BY id DESC LIMIT ?1",
                )
                .map_err(StorageError::sqlite("Failed to prepare scan query"))?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .map_err(StorageError::sqlite("Failed to read scans"))?;
            let mut scans = Vec::new();
            for row in rows {
                scans.push(row.map_err(StorageError::sqlite("Failed to decode scan"))?);
            }
            Ok(scans)
        })
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS tags (
                    tag_id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL CHECK (kind IN ('user', 'tool')),
                    display_name TEXT NOT NULL,
                    registered_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS tool_names (
                    name TEXT PRIMARY KEY,
                    created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS loans (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tool_id TEXT NOT NULL,
                    borrower_id TEXT NOT NULL,
                    loaned_at TEXT NOT NULL,
                    returner_id TEXT,
                    returned_at TEXT
                 );
                 CREATE UNIQUE INDEX IF NOT EXISTS loans_one_open_per_tool
                    ON loans(tool_id) WHERE returned_at IS NULL;
                 CREATE INDEX IF NOT EXISTS loans_loaned_at ON loans(loaned_at);
                 CREATE TABLE IF NOT EXISTS scan_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    recorded_at TEXT NOT NULL,
                    station_id TEXT NOT NULL,
                    tag_id TEXT NOT NULL,
                    role_hint TEXT CHECK (role_hint IN ('user', 'tool') OR role_hint IS NULL)
                 );
                 COMMIT;",
            )
            .map_err(StorageError::sqlite("Failed to initialize schema"))
        })
    }

    pub(crate) fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::DataDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(StorageError::sqlite("Failed to open sqlite db"))?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(StorageError::sqlite("Failed to set busy_timeout"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StorageError::sqlite("Failed to enable WAL"))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(StorageError::sqlite("Failed to set synchronous"))?;

        Ok(conn)
    }
}

impl LoanGateway for Db {
    fn name_of_user(&self, id: &TagId) -> Result<String, StorageError> {
        self.display_name(id, TagKind::User)
    }

    fn name_of_tool(&self, id: &TagId) -> Result<String, StorageError> {
        self.display_name(id, TagKind::Tool)
    }

    fn borrow_or_return(&self, user: &TagId, tool: &TagId) -> Result<LoanOutcome, StorageError> {
        self.borrow_or_return_at(user, tool, Utc::now())
    }

    fn record_scan(&self, id: &TagId, role: TagKind) -> Result<(), StorageError> {
        self.insert_scan(id, role)
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}
