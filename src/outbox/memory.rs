//! In-memory outbox store for tests and single-process use.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{FailureDisposition, OutboxError, OutboxRecord, OutboxStore, Result};

/// Outbox store backed by a vector, in insertion order.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    records: Mutex<Vec<OutboxRecord>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, published and flagged included.
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.lock().map(|records| records.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<OutboxRecord>>> {
        self.records
            .lock()
            .map_err(|_| OutboxError::Storage("outbox lock poisoned".to_string()))
    }

    fn update<F>(&self, id: Uuid, f: F) -> Result<OutboxRecord>
    where
        F: FnOnce(&mut OutboxRecord),
    {
        let mut records = self.lock()?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(OutboxError::NotFound(id))?;
        f(record);
        Ok(record.clone())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn stage(&self, record: &OutboxRecord) -> Result<()> {
        let mut records = self.lock()?;
        if records.iter().any(|r| r.id == record.id) {
            return Err(OutboxError::Storage(format!(
                "outbox record {} already staged",
                record.id
            )));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn pending(&self, limit: u32) -> Result<Vec<OutboxRecord>> {
        let records = self.lock()?;
        let mut pending: Vec<_> = records.iter().filter(|r| r.is_pending()).cloned().collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn mark_published(&self, id: Uuid, published_at: DateTime<Utc>) -> Result<()> {
        self.update(id, |r| r.published_at = Some(published_at))
            .map(|_| ())
    }

    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> Result<FailureDisposition> {
        let record = self.update(id, |r| {
            r.attempts += 1;
            r.last_error = Some(error.to_string());
            if r.attempts >= max_attempts {
                r.failed_at = Some(Utc::now());
            }
        })?;

        Ok(if record.is_flagged() {
            FailureDisposition::Flagged {
                attempts: record.attempts,
            }
        } else {
            FailureDisposition::Retry {
                attempts: record.attempts,
            }
        })
    }

    async fn flagged(&self) -> Result<Vec<OutboxRecord>> {
        let records = self.lock()?;
        Ok(records.iter().filter(|r| r.is_flagged()).cloned().collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxRecord>> {
        let records = self.lock()?;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }
}
