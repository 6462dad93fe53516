use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An equivalence link between a surviving original and a duplicate.
///
/// Both files carry the same content hash; exactly one member of each hash
/// class keeps `is_duplicate = false`. Rows are written once and never
/// mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateLink {
    pub id: Uuid,
    pub original_id: Uuid,
    pub duplicate_id: Uuid,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}
