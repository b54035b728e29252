//! Session migration bookkeeping
//!
//! When a session's preferred worker cannot take work and the session is
//! rebound elsewhere, the move is recorded so operators can see it and
//! roll it back.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Completed records kept for inspection
const MAX_RECORDS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: Uuid,
    pub session_id: String,
    pub from_worker: String,
    pub to_worker: String,
    pub status: MigrationStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("migration {0} not found")]
    NotFound(Uuid),

    #[error("migration {id} cannot move from {from:?} to {to:?}")]
    InvalidStatus {
        id: Uuid,
        from: MigrationStatus,
        to: MigrationStatus,
    },
}

/// Migration records, newest last
#[derive(Debug, Default)]
pub struct MigrationTracker {
    records: Mutex<VecDeque<MigrationRecord>>,
}

impl MigrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new migration and mark it in progress
    pub fn start(&self, session_id: &str, from_worker: &str, to_worker: &str) -> MigrationRecord {
        let record = MigrationRecord {
            id: Uuid::now_v7(),
            session_id: session_id.to_string(),
            from_worker: from_worker.to_string(),
            to_worker: to_worker.to_string(),
            status: MigrationStatus::InProgress,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        let mut records = self.records.lock();
        if records.len() == MAX_RECORDS {
            records.pop_front();
        }
        records.push_back(record.clone());
        record
    }

    pub fn complete(&self, id: Uuid) -> Result<MigrationRecord, MigrationError> {
        self.finish(id, MigrationStatus::Completed, None)
    }

    pub fn fail(&self, id: Uuid, error: impl Into<String>) -> Result<MigrationRecord, MigrationError> {
        self.finish(id, MigrationStatus::Failed, Some(error.into()))
    }

    /// Mark a migration rolled back; completed and failed ones may be rolled back
    pub fn mark_rolled_back(&self, id: Uuid) -> Result<MigrationRecord, MigrationError> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(MigrationError::NotFound(id))?;
        if record.status == MigrationStatus::RolledBack {
            return Err(MigrationError::InvalidStatus {
                id,
                from: record.status,
                to: MigrationStatus::RolledBack,
            });
        }
        record.status = MigrationStatus::RolledBack;
        record.finished_at = Some(Utc::now());
        Ok(record.clone())
    }

    pub fn get(&self, id: Uuid) -> Option<MigrationRecord> {
        self.records.lock().iter().find(|r| r.id == id).cloned()
    }

    pub fn for_session(&self, session_id: &str) -> Vec<MigrationRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<MigrationRecord> {
        self.records.lock().iter().cloned().collect()
    }

    fn finish(
        &self,
        id: Uuid,
        status: MigrationStatus,
        error: Option<String>,
    ) -> Result<MigrationRecord, MigrationError> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(MigrationError::NotFound(id))?;
        if record.status.is_finished() {
            return Err(MigrationError::InvalidStatus {
                id,
                from: record.status,
                to: status,
            });
        }
        record.status = status;
        record.finished_at = Some(Utc::now());
        record.error = error;
        Ok(record.clone())
    }
}
