//! Shared status record, replaced and copied out whole.

use std::sync::RwLock;

use crate::error::{QueueError, QueueResult};
use crate::types::StatusRecord;

/// Holds the current status; `None` until the first write.
pub struct StatusStore {
    current: RwLock<Option<StatusRecord>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }

    /// Replace the whole record and mark it initialized.
    pub fn write(&self, record: StatusRecord) -> QueueResult<()> {
        let mut guard = self
            .current
            .write()
            .map_err(|_| QueueError::LockPoisoned("status"))?;
        *guard = Some(record);
        Ok(())
    }

    /// Copy of the current record, or `Uninitialized` before the first write.
    pub fn read(&self) -> QueueResult<StatusRecord> {
        let guard = self
            .current
            .read()
            .map_err(|_| QueueError::LockPoisoned("status"))?;
        guard.clone().ok_or(QueueError::Uninitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.current
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}
