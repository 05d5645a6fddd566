//! Two-phase commit relocation
//!
//! Moves every row of one table from a source server to a target server as
//! a single distributed transaction. Each side is a [`TransactionBranch`]
//! over a [`Participant`]:
//!
//! ```text
//! IDLE → ACTIVE → PREPARED → COMMITTED
//!   ↓       ↓         ↓
//!   └───────┴─────────┴──→ ABORTED
//! ```
//!
//! # Modules
//!
//! - [`coordinator`] - drives both branches through the protocol
//! - [`pipeline`] - streams rows from source into target
//! - [`participant`] - participant trait (+ in-memory mock for tests)
//! - [`postgres`] - `PREPARE TRANSACTION` based participant
//! - [`recovery`] - in-doubt branch listing and resolution

pub mod branch;
pub mod coordinator;
pub mod error;
pub mod participant;
pub mod pipeline;
pub mod postgres;
pub mod recovery;
pub mod state;
pub mod types;


pub use branch::TransactionBranch;
pub use coordinator::{CoordinatorOptions, TransferOutcome, TransferReport, TwoPhaseCommitCoordinator};
pub use error::{
    BranchSnapshot, CoordinatorError, ParticipantError, Phase, ProtocolError, RecoveryError,
    TransferError, TransferFailure,
};
pub use participant::Participant;
pub use pipeline::TransferPipeline;
pub use postgres::PgParticipant;
pub use recovery::{
    Decision, InDoubtBranch, InDoubtOperation, Resolution, ResolutionAction, ResolvedBranch,
};
pub use state::BranchState;
pub use types::{BranchId, BranchRole, OperationId, TransferRecord};
