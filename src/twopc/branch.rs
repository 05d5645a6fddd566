//! Transaction branch
//!
//! Pairs a participant with its gid and state. Every call is bounded by the
//! phase timeout and only allowed along the edges of [`BranchState`].

use std::time::Duration;
use tracing::{debug, warn};

use super::error::{BranchSnapshot, CoordinatorError, ParticipantError, Phase, ProtocolError};
use super::participant::Participant;
use super::state::BranchState;
use super::types::{BranchId, BranchRole};

pub struct TransactionBranch {
    role: BranchRole,
    gid: BranchId,
    state: BranchState,
    timeout: Duration,
    participant: Box<dyn Participant>,
}

/// Bound a participant call by `limit`
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, ParticipantError>
where
    F: std::future::Future<Output = Result<T, ParticipantError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ParticipantError::Timeout(limit)),
    }
}

impl TransactionBranch {
    pub fn new(
        role: BranchRole,
        gid: BranchId,
        timeout: Duration,
        participant: Box<dyn Participant>,
    ) -> Self {
        Self {
            role,
            gid,
            state: BranchState::Idle,
            timeout,
            participant,
        }
    }

    pub fn role(&self) -> BranchRole {
        self.role
    }

    pub fn gid(&self) -> &BranchId {
        &self.gid
    }

    pub fn state(&self) -> BranchState {
        self.state
    }

    pub fn node(&self) -> &str {
        self.participant.node()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn participant(&mut self) -> &mut dyn Participant {
        self.participant.as_mut()
    }

    pub fn snapshot(&self) -> BranchSnapshot {
        BranchSnapshot {
            role: self.role,
            node: self.node().to_string(),
            gid: self.gid.clone(),
            state: self.state,
        }
    }

    fn check(&self, to: BranchState) -> Result<(), CoordinatorError> {
        if self.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(CoordinatorError::InvalidTransition {
                role: self.role,
                gid: self.gid.clone(),
                from: self.state,
                to,
            })
        }
    }

    fn protocol(&self, phase: Phase, cause: ParticipantError) -> CoordinatorError {
        CoordinatorError::Protocol(ProtocolError {
            phase,
            role: self.role,
            node: self.node().to_string(),
            gid: self.gid.clone(),
            cause,
        })
    }

    fn set(&mut self, to: BranchState) {
        debug!(
            role = %self.role,
            gid = %self.gid,
            from = %self.state,
            to = %to,
            "Branch transition"
        );
        self.state = to;
    }

    /// IDLE → ACTIVE
    pub async fn begin(&mut self) -> Result<(), CoordinatorError> {
        self.check(BranchState::Active)?;
        let limit = self.timeout;
        bounded(limit, self.participant.begin())
            .await
            .map_err(|e| self.protocol(Phase::Begin, e))?;
        self.set(BranchState::Active);
        Ok(())
    }

    /// ACTIVE → PREPARED.
    ///
    /// A rejected prepare leaves no transaction behind on the server, so the
    /// branch is ABORTED. After a timeout the server may still have applied
    /// `PREPARE TRANSACTION`; the gid is then rolled back, and if that cannot
    /// be confirmed the branch stays PREPARED (in doubt).
    pub async fn prepare(&mut self) -> Result<(), CoordinatorError> {
        self.check(BranchState::Prepared)?;
        let limit = self.timeout;
        let cause = match bounded(limit, self.participant.prepare(&self.gid)).await {
            Ok(()) => {
                self.set(BranchState::Prepared);
                return Ok(());
            }
            Err(e) => e,
        };

        let timed_out = matches!(cause, ParticipantError::Timeout(_));
        let err = self.protocol(Phase::Prepare, cause);
        // The session may still hold an open transaction; discard it.
        if let Err(rb) = bounded(limit, self.participant.rollback()).await {
            debug!(gid = %self.gid, error = %rb, "Rollback after failed prepare");
        }
        if !timed_out {
            self.set(BranchState::Aborted);
            return Err(err);
        }

        match bounded(limit, self.participant.rollback_prepared(&self.gid)).await {
            Ok(()) => {
                warn!(gid = %self.gid, node = %self.node(), "Prepared despite timeout, rolled back");
                self.set(BranchState::Aborted);
            }
            Err(e) if e.is_unknown_branch() => self.set(BranchState::Aborted),
            Err(e) => {
                warn!(
                    gid = %self.gid,
                    node = %self.node(),
                    error = %e,
                    "Outcome of timed out PREPARE unknown"
                );
                self.set(BranchState::Prepared);
            }
        }
        Err(err)
    }

    /// PREPARED → COMMITTED. On failure the branch stays PREPARED.
    pub async fn commit(&mut self) -> Result<(), CoordinatorError> {
        self.check(BranchState::Committed)?;
        let limit = self.timeout;
        bounded(limit, self.participant.commit_prepared(&self.gid))
            .await
            .map_err(|e| self.protocol(Phase::Commit, e))?;
        self.set(BranchState::Committed);
        Ok(())
    }

    /// Move to ABORTED from any non-terminal state, using `ROLLBACK` for an
    /// open transaction and `ROLLBACK PREPARED` for a prepared one.
    /// A failed `ROLLBACK PREPARED` leaves the branch PREPARED.
    pub async fn abort(&mut self) -> Result<(), CoordinatorError> {
        let limit = self.timeout;
        match self.state {
            BranchState::Idle => {
                self.set(BranchState::Aborted);
                Ok(())
            }
            BranchState::Active => {
                // The server discards the transaction with the session even
                // if the statement fails, so the branch is aborted either way.
                if let Err(e) = bounded(limit, self.participant.rollback()).await {
                    warn!(gid = %self.gid, node = %self.node(), error = %e, "ROLLBACK failed");
                }
                self.set(BranchState::Aborted);
                Ok(())
            }
            BranchState::Prepared => {
                bounded(limit, self.participant.rollback_prepared(&self.gid))
                    .await
                    .map_err(|e| self.protocol(Phase::Rollback, e))?;
                self.set(BranchState::Aborted);
                Ok(())
            }
            BranchState::Committed | BranchState::Aborted => self.check(BranchState::Aborted),
        }
    }
}
