//! Batch operation DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// IDs to delete in one call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchDelete {
    pub ids: Vec<Uuid>,
}

/// Per-item result of a batch delete
///
/// Items are handled independently; one failure does not stop the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchDeleteResult {
    pub deleted: Vec<Uuid>,
    pub failed: Vec<BatchFailure>,
}

impl BatchDeleteResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    pub id: Uuid,
    /// Same machine readable code a single delete would answer with
    pub code: String,
    pub error: String,
}
