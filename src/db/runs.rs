//! Run history.

use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use super::Database;
use crate::error::Result;

/// Phase a run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Index,
    Preprocess,
    Compare,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Index => "index",
            RunPhase::Preprocess => "preprocess",
            RunPhase::Compare => "compare",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "index" => Some(RunPhase::Index),
            "preprocess" => Some(RunPhase::Preprocess),
            "compare" => Some(RunPhase::Compare),
            _ => None,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "interrupted" => Some(RunStatus::Interrupted),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub phase: RunPhase,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub processed: i64,
    pub failed: i64,
    pub message: Option<String>,
}

fn row_to_run(row: &Row) -> rusqlite::Result<RunRecord> {
    let phase: String = row.get(1)?;
    let status: String = row.get(4)?;
    Ok(RunRecord {
        id: row.get(0)?,
        phase: RunPhase::from_str(&phase).unwrap_or(RunPhase::Compare),
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        status: RunStatus::from_str(&status).unwrap_or(RunStatus::Failed),
        processed: row.get(5)?,
        failed: row.get(6)?,
        message: row.get(7)?,
    })
}

impl Database {
    pub fn start_run(&self, phase: RunPhase) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO runs (phase, started_at, status) VALUES (?, ?, 'running')",
            params![phase.as_str(), now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn finish_run(
        &self,
        id: i64,
        status: RunStatus,
        processed: i64,
        failed: i64,
        message: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE runs SET finished_at = ?, status = ?, processed = ?, failed = ?, message = ?
             WHERE id = ?",
            params![now, status.as_str(), processed, failed, message, id],
        )?;
        Ok(())
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, phase, started_at, finished_at, status, processed, failed, message
             FROM runs ORDER BY id DESC LIMIT ?",
        )?;
        let runs = stmt
            .query_map([limit as i64], row_to_run)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(runs)
    }
}
