//! Delegation history persistence using SQLite

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::types::{DelegationHistory, DelegationMode};
use super::HistoryStore;
use crate::status::TaskStatus;
use crate::{Error, Result};

const COLUMNS: &str = "id, source_agent_id, target_agent_id, team_task_id, user_id, task, mode, \
                       status, result, error, iterations, duration_ms, created_at, completed_at";

/// SQLite-based delegation history store
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    /// Open (or create) the history database at `db_path`
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    /// Create an in-memory history store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS delegation_history (
                id TEXT PRIMARY KEY,
                source_agent_id TEXT NOT NULL,
                target_agent_id TEXT NOT NULL,
                team_task_id TEXT,
                user_id TEXT,
                task TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                error TEXT,
                iterations INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_delegation_history_source
             ON delegation_history(source_agent_id, created_at)",
            [],
        )?;

        Ok(())
    }

    /// Fixed-width timestamps so `ORDER BY created_at` sorts chronologically
    fn format_time(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn parse_time(value: &str) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| rusqlite::Error::InvalidQuery)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<DelegationHistory> {
        let mode: String = row.get(6)?;
        let status: String = row.get(7)?;
        let created_at: String = row.get(12)?;
        let completed_at: Option<String> = row.get(13)?;

        Ok(DelegationHistory {
            id: row.get(0)?,
            source_agent_id: row.get(1)?,
            target_agent_id: row.get(2)?,
            team_task_id: row.get(3)?,
            user_id: row.get(4)?,
            task: row.get(5)?,
            mode: if mode == "async" {
                DelegationMode::Async
            } else {
                DelegationMode::Sync
            },
            status: status
                .parse::<TaskStatus>()
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            result: row.get(8)?,
            error: row.get(9)?,
            iterations: row.get(10)?,
            duration_ms: row.get(11)?,
            created_at: Self::parse_time(&created_at)?,
            completed_at: completed_at.as_deref().map(Self::parse_time).transpose()?,
        })
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn save_delegation(&self, record: &DelegationHistory) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO delegation_history
             (id, source_agent_id, target_agent_id, team_task_id, user_id, task, mode,
              status, result, error, iterations, duration_ms, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.id,
                record.source_agent_id,
                record.target_agent_id,
                record.team_task_id,
                record.user_id,
                record.task,
                record.mode.as_str(),
                record.status.as_str(),
                record.result,
                record.error,
                record.iterations,
                record.duration_ms,
                Self::format_time(&record.created_at),
                record.completed_at.as_ref().map(Self::format_time),
            ],
        )?;
        Ok(())
    }

    async fn get_delegation(&self, id: &str) -> Result<Option<DelegationHistory>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM delegation_history WHERE id = ?1",
            COLUMNS
        ))?;
        stmt.query_row(params![id], Self::from_row)
            .optional()
            .map_err(Error::from)
    }

    async fn list_delegations(&self, source_agent_id: &str, limit: usize) -> Result<Vec<DelegationHistory>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM delegation_history WHERE source_agent_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
            COLUMNS
        ))?;

        let rows = stmt.query_map(params![source_agent_id, limit as i64], Self::from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}
