//! Generation request priorities and the request status state machine.
//!
//! This module lives in `core` (zero internal deps) so the lifecycle
//! manager, the storage adapters and the client crate all agree on the same
//! transition table.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Priority constants
// ---------------------------------------------------------------------------

/// Priority value for urgent jobs. Dispatched before all others.
pub const PRIORITY_URGENT: i32 = 10;

/// Priority value for normal jobs. Default.
pub const PRIORITY_NORMAL: i32 = 0;

/// Priority value for background jobs. Dispatched last.
pub const PRIORITY_BACKGROUND: i32 = -10;

// ---------------------------------------------------------------------------
// Request status
// ---------------------------------------------------------------------------

/// Status ID type matching the SMALLINT `status_id` column.
pub type StatusId = i16;

/// Lifecycle status of a generation request.
///
/// Discriminants are the persisted/wire ids and must not be reordered.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending = 0,
    Processing = 1,
    Cancelled = 2,
    Error = 3,
    Succeeded = 4,
}

impl RequestStatus {
    /// Every status, in id order.
    pub const ALL: [RequestStatus; 5] = [
        RequestStatus::Pending,
        RequestStatus::Processing,
        RequestStatus::Cancelled,
        RequestStatus::Error,
        RequestStatus::Succeeded,
    ];

    /// Return the persisted status ID.
    pub fn id(self) -> StatusId {
        self as StatusId
    }

    /// Look up a status from its persisted ID.
    pub fn from_id(id: StatusId) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Succeeded | RequestStatus::Error | RequestStatus::Cancelled
        )
    }

    /// Human-readable name (for logs and error messages).
    pub fn name(self) -> &'static str {
        match self {
            RequestStatus::Pending => "Pending",
            RequestStatus::Processing => "Processing",
            RequestStatus::Cancelled => "Cancelled",
            RequestStatus::Error => "Error",
            RequestStatus::Succeeded => "Succeeded",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl From<RequestStatus> for StatusId {
    fn from(value: RequestStatus) -> Self {
        value as StatusId
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub mod state_machine {
    use super::RequestStatus;

    /// Returns the set of statuses reachable from `from`.
    ///
    /// Pending may fail directly to Error when dispatch refuses the job after
    /// it was accepted. Terminal states return an empty slice.
    pub fn valid_transitions(from: RequestStatus) -> &'static [RequestStatus] {
        match from {
            RequestStatus::Pending => &[
                RequestStatus::Processing,
                RequestStatus::Cancelled,
                RequestStatus::Error,
            ],
            RequestStatus::Processing => &[
                RequestStatus::Succeeded,
                RequestStatus::Error,
                RequestStatus::Cancelled,
            ],
            RequestStatus::Succeeded | RequestStatus::Error | RequestStatus::Cancelled => &[],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    pub fn can_transition(from: RequestStatus, to: RequestStatus) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Whether a cancel call on a request in `status` changes anything.
    ///
    /// Cancelling a terminal request is a no-op that reports the current
    /// status instead of failing.
    pub fn cancel_is_noop(status: RequestStatus) -> bool {
        status.is_terminal()
    }
}
