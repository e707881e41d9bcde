//! Status catalog
//!
//! Status values are plain integers ordered so that every non-terminal state
//! sorts below every terminal one: `NEW < READY < INPROGRESS < SUCCESS <= ...`.
//! Each status carries a type, and types carry a severity rank used to pick the
//! worst outcome when aggregating the results of sibling instances.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier of a row in the status catalog
pub type StatusId = i32;

pub const NEW: StatusId = 1;
pub const READY: StatusId = 2;
pub const INPROGRESS: StatusId = 3;
pub const SUCCESS: StatusId = 4;
pub const FAILED: StatusId = 5;
pub const CANCELED: StatusId = 6;
pub const WARNING: StatusId = 7;

/// Returns true once a status id denotes a finished instance.
pub fn is_resolved(status_id: StatusId) -> bool {
    status_id > INPROGRESS
}

/// Returns true for the three runnable-or-running states.
pub fn is_pending(status_id: StatusId) -> bool {
    matches!(status_id, NEW | READY | INPROGRESS)
}

/// Kind of a status, shared by every catalog entry of that kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusType {
    New,
    Ready,
    InProgress,
    Success,
    Warning,
    Failed,
    Canceled,
}

impl StatusType {
    /// Severity rank used by aggregation. Higher wins.
    ///
    /// `SUCCESS(0) < WARNING(1) < FAILED(2) < CANCELED(3)`. Non-terminal types
    /// never take part in aggregation and rank with SUCCESS.
    pub fn severity(self) -> u8 {
        match self {
            StatusType::New | StatusType::Ready | StatusType::InProgress => 0,
            StatusType::Success => 0,
            StatusType::Warning => 1,
            StatusType::Failed => 2,
            StatusType::Canceled => 3,
        }
    }

    /// Whether this type blocks a workflow from activating further actions.
    pub fn blocks_continuation(self) -> bool {
        self.severity() >= StatusType::Failed.severity()
    }

    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            StatusType::New | StatusType::Ready | StatusType::InProgress
        )
    }

    /// Catalog id of the built-in status for this type
    pub fn canonical_id(self) -> StatusId {
        match self {
            StatusType::New => NEW,
            StatusType::Ready => READY,
            StatusType::InProgress => INPROGRESS,
            StatusType::Success => SUCCESS,
            StatusType::Warning => WARNING,
            StatusType::Failed => FAILED,
            StatusType::Canceled => CANCELED,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusType::New => "NEW",
            StatusType::Ready => "READY",
            StatusType::InProgress => "INPROGRESS",
            StatusType::Success => "SUCCESS",
            StatusType::Warning => "WARNING",
            StatusType::Failed => "FAILED",
            StatusType::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => Some(StatusType::New),
            "READY" => Some(StatusType::Ready),
            "INPROGRESS" | "IN_PROGRESS" => Some(StatusType::InProgress),
            "SUCCESS" => Some(StatusType::Success),
            "WARNING" => Some(StatusType::Warning),
            "FAILED" => Some(StatusType::Failed),
            "CANCELED" | "CANCELLED" => Some(StatusType::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for StatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the status catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub id: StatusId,
    pub status_type: StatusType,
    pub display_name: String,
    pub active: bool,
}

impl Status {
    fn builtin(id: StatusId, status_type: StatusType, display_name: &str) -> Self {
        Self {
            id,
            status_type,
            display_name: display_name.to_string(),
            active: true,
        }
    }
}

/// The set of known statuses, keyed by id
///
/// Built-in statuses are always present; operators may add more entries
/// (e.g. a "Tests failed" status of type FAILED) with ids above `WARNING`.
#[derive(Debug, Clone)]
pub struct StatusCatalog {
    statuses: HashMap<StatusId, Status>,
}

impl StatusCatalog {
    /// Catalog holding only the built-in statuses
    pub fn builtin() -> Self {
        let statuses = [
            Status::builtin(NEW, StatusType::New, "New"),
            Status::builtin(READY, StatusType::Ready, "Ready"),
            Status::builtin(INPROGRESS, StatusType::InProgress, "In Progress"),
            Status::builtin(SUCCESS, StatusType::Success, "Success"),
            Status::builtin(FAILED, StatusType::Failed, "Failed"),
            Status::builtin(CANCELED, StatusType::Canceled, "Canceled"),
            Status::builtin(WARNING, StatusType::Warning, "Warning"),
        ]
        .into_iter()
        .map(|s| (s.id, s))
        .collect();

        Self { statuses }
    }

    /// Built-in catalog extended with operator-defined statuses.
    ///
    /// Entries reusing a built-in id are ignored so the fixed ordering of the
    /// non-terminal states can never be redefined.
    pub fn with_statuses(statuses: impl IntoIterator<Item = Status>) -> Self {
        let mut catalog = Self::builtin();
        for status in statuses {
            if status.id > WARNING {
                catalog.statuses.insert(status.id, status);
            }
        }
        catalog
    }

    pub fn get(&self, id: StatusId) -> Option<&Status> {
        self.statuses.get(&id)
    }

    /// Type of a status id. Unknown terminal ids are treated as FAILED.
    pub fn type_of(&self, id: StatusId) -> StatusType {
        match self.statuses.get(&id) {
            Some(status) => status.status_type,
            None if is_resolved(id) => StatusType::Failed,
            None => StatusType::New,
        }
    }

    pub fn display_name(&self, id: StatusId) -> String {
        self.statuses
            .get(&id)
            .map(|s| s.display_name.clone())
            .unwrap_or_else(|| format!("status#{}", id))
    }

    /// Resolves a posted status: a numeric id, a type name or a display name.
    pub fn resolve(&self, posted: &str) -> Option<StatusId> {
        let posted = posted.trim();

        if let Ok(id) = posted.parse::<StatusId>() {
            return self.statuses.get(&id).map(|s| s.id);
        }

        if let Some(status_type) = StatusType::parse(posted) {
            return Some(status_type.canonical_id());
        }

        self.statuses
            .values()
            .filter(|s| s.active)
            .find(|s| s.display_name.eq_ignore_ascii_case(posted))
            .map(|s| s.id)
    }

    /// Aggregates the statuses of sibling instances.
    ///
    /// Returns `None` while any member is still unresolved. Otherwise returns
    /// SUCCESS when every member succeeded, or the type with the highest
    /// severity among the non-SUCCESS members (first encountered wins ties).
    pub fn aggregate(&self, ids: impl IntoIterator<Item = StatusId>) -> Option<StatusType> {
        let mut worst: Option<StatusType> = None;

        for id in ids {
            if !is_resolved(id) {
                return None;
            }

            let status_type = self.type_of(id);
            if status_type == StatusType::Success {
                continue;
            }

            match worst {
                Some(current) if current.severity() >= status_type.severity() => {}
                _ => worst = Some(status_type),
            }
        }

        Some(worst.unwrap_or(StatusType::Success))
    }
}

impl Default for StatusCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering() {
        assert!(NEW < READY);
        assert!(READY < INPROGRESS);
        assert!(INPROGRESS < SUCCESS);
        assert!(!is_resolved(INPROGRESS));
        assert!(is_resolved(SUCCESS));
        assert!(is_resolved(WARNING));
    }

    #[test]
    fn test_severity_ranking() {
        assert!(StatusType::Success.severity() < StatusType::Warning.severity());
        assert!(StatusType::Warning.severity() < StatusType::Failed.severity());
        assert!(StatusType::Failed.severity() < StatusType::Canceled.severity());
        assert!(!StatusType::Warning.blocks_continuation());
        assert!(StatusType::Failed.blocks_continuation());
        assert!(StatusType::Canceled.blocks_continuation());
    }

    #[test]
    fn test_aggregate() {
        let catalog = StatusCatalog::builtin();

        assert_eq!(
            catalog.aggregate([SUCCESS, SUCCESS]),
            Some(StatusType::Success)
        );
        assert_eq!(
            catalog.aggregate([SUCCESS, FAILED]),
            Some(StatusType::Failed)
        );
        // CANCELED ranks above FAILED
        assert_eq!(
            catalog.aggregate([SUCCESS, CANCELED]),
            Some(StatusType::Canceled)
        );
        assert_eq!(
            catalog.aggregate([FAILED, CANCELED, WARNING]),
            Some(StatusType::Canceled)
        );
        assert_eq!(
            catalog.aggregate([WARNING, SUCCESS]),
            Some(StatusType::Warning)
        );
        assert_eq!(catalog.aggregate([SUCCESS, INPROGRESS]), None);
        assert_eq!(catalog.aggregate([NEW]), None);
    }

    #[test]
    fn test_custom_status_aggregates_by_type() {
        let catalog = StatusCatalog::with_statuses([Status {
            id: 12,
            status_type: StatusType::Failed,
            display_name: "Tests failed".to_string(),
            active: true,
        }]);

        assert_eq!(catalog.type_of(12), StatusType::Failed);
        assert_eq!(catalog.aggregate([SUCCESS, 12]), Some(StatusType::Failed));
        assert_eq!(catalog.resolve("tests failed"), Some(12));
    }

    #[test]
    fn test_builtin_ids_cannot_be_redefined() {
        let catalog = StatusCatalog::with_statuses([Status {
            id: READY,
            status_type: StatusType::Failed,
            display_name: "Broken".to_string(),
            active: true,
        }]);

        assert_eq!(catalog.type_of(READY), StatusType::Ready);
    }

    #[test]
    fn test_resolve_posted_status() {
        let catalog = StatusCatalog::builtin();
        assert_eq!(catalog.resolve("SUCCESS"), Some(SUCCESS));
        assert_eq!(catalog.resolve("cancelled"), Some(CANCELED));
        assert_eq!(catalog.resolve("5"), Some(FAILED));
        assert_eq!(catalog.resolve("In Progress"), Some(INPROGRESS));
        assert_eq!(catalog.resolve("99"), None);
        assert_eq!(catalog.resolve("bogus"), None);
    }

    #[test]
    fn test_unknown_terminal_id_counts_as_failed() {
        let catalog = StatusCatalog::builtin();
        assert_eq!(catalog.type_of(42), StatusType::Failed);
    }
}
