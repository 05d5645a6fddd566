//! Branch State Machine
//!
//! ```text
//! IDLE → ACTIVE → PREPARED → COMMITTED
//!   ↓       ↓         ↓
//!   └───────┴─────────┴──→ ABORTED
//! ```

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchState {
    /// BEGIN not issued yet
    Idle,
    /// Open transaction, writes staged
    Active,
    /// Durably prepared, awaiting COMMIT/ROLLBACK PREPARED
    Prepared,
    /// Terminal
    Committed,
    /// Terminal
    Aborted,
}

impl BranchState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, BranchState::Committed | BranchState::Aborted)
    }

    /// Whether `self → next` is an edge of the state machine
    pub fn can_transition_to(&self, next: BranchState) -> bool {
        use BranchState::*;
        matches!(
            (self, next),
            (Idle, Active)
                | (Active, Prepared)
                | (Prepared, Committed)
                | (Idle, Aborted)
                | (Active, Aborted)
                | (Prepared, Aborted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BranchState::Idle => "IDLE",
            BranchState::Active => "ACTIVE",
            BranchState::Prepared => "PREPARED",
            BranchState::Committed => "COMMITTED",
            BranchState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
