//! Round stages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The path a round is following.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Path {
    /// Not yet on a path.
    Idle,
    /// This member leads the round.
    Leader,
    /// This member follows the current leader.
    Subordinate,
    /// The round is decided by common-subset agreement.
    Subset,
}

/// Position of a round within its path.
///
/// Within a path stages only move forward; rotation returns the round to
/// [`Stage::Idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Entered on a new round or after rotation.
    Idle,
    /// Leader collecting notifications.
    LeaderStart,
    /// Leader executing its batch.
    LeaderCalculating,
    /// Leader waiting for a quorum of signed results.
    LeaderCalculated,
    /// Leader posted the transition.
    LeaderFinalized,
    /// Subordinate about to notify the leader.
    SubStart,
    /// Subordinate waiting for the leader's instruction.
    SubNotified,
    /// Subordinate executing the leader's batch.
    SubCalculating,
    /// Subordinate waiting for the leader to post.
    SubCalculated,
    /// The leader's transition was observed.
    SubFinalized,
    /// Proposal submitted, waiting for agreement.
    SubsetProposed,
    /// Executing the agreed batch.
    SubsetCalculating,
    /// Waiting for a quorum of signed results.
    SubsetCalculated,
    /// Transition posted.
    SubsetFinalized,
}

impl Stage {
    /// The path this stage belongs to.
    pub fn path(&self) -> Path {
        match self {
            Stage::Idle => Path::Idle,
            Stage::LeaderStart
            | Stage::LeaderCalculating
            | Stage::LeaderCalculated
            | Stage::LeaderFinalized => Path::Leader,
            Stage::SubStart
            | Stage::SubNotified
            | Stage::SubCalculating
            | Stage::SubCalculated
            | Stage::SubFinalized => Path::Subordinate,
            Stage::SubsetProposed
            | Stage::SubsetCalculating
            | Stage::SubsetCalculated
            | Stage::SubsetFinalized => Path::Subset,
        }
    }

    fn ordinal(&self) -> u8 {
        match self {
            Stage::Idle => 0,
            Stage::LeaderStart | Stage::SubStart | Stage::SubsetProposed => 1,
            Stage::SubNotified => 2,
            Stage::LeaderCalculating | Stage::SubCalculating | Stage::SubsetCalculating => 3,
            Stage::LeaderCalculated | Stage::SubCalculated | Stage::SubsetCalculated => 4,
            Stage::LeaderFinalized | Stage::SubFinalized | Stage::SubsetFinalized => 5,
        }
    }

    /// Returns true if moving from `self` to `next` is a forward step.
    pub fn precedes(&self, next: Stage) -> bool {
        match self.path() {
            Path::Idle => next != Stage::Idle,
            path => next.path() == path && next.ordinal() > self.ordinal(),
        }
    }

    /// Returns true for the terminal stage of any path.
    pub fn is_finalized(&self) -> bool {
        matches!(
            self,
            Stage::LeaderFinalized | Stage::SubFinalized | Stage::SubsetFinalized
        )
    }

    /// Returns true if the stage's deadline can elapse.
    pub fn has_deadline(&self) -> bool {
        !matches!(self, Stage::Idle) && !self.is_finalized()
    }

    /// Stable name for logs and status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::LeaderStart => "leader_start",
            Stage::LeaderCalculating => "leader_calculating",
            Stage::LeaderCalculated => "leader_calculated",
            Stage::LeaderFinalized => "leader_finalized",
            Stage::SubStart => "sub_start",
            Stage::SubNotified => "sub_notified",
            Stage::SubCalculating => "sub_calculating",
            Stage::SubCalculated => "sub_calculated",
            Stage::SubFinalized => "sub_finalized",
            Stage::SubsetProposed => "subset_proposed",
            Stage::SubsetCalculating => "subset_calculating",
            Stage::SubsetCalculated => "subset_calculated",
            Stage::SubsetFinalized => "subset_finalized",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_disjoint() {
        assert!(Stage::Idle.precedes(Stage::LeaderStart));
        assert!(Stage::Idle.precedes(Stage::SubStart));
        assert!(Stage::LeaderStart.precedes(Stage::LeaderFinalized));
        assert!(!Stage::LeaderStart.precedes(Stage::SubCalculating));
        assert!(!Stage::SubCalculated.precedes(Stage::SubNotified));
        assert!(Stage::SubNotified.precedes(Stage::SubFinalized));
        assert!(!Stage::SubsetProposed.precedes(Stage::Idle));
    }

    #[test]
    fn test_deadlines() {
        assert!(!Stage::Idle.has_deadline());
        assert!(Stage::SubNotified.has_deadline());
        assert!(!Stage::LeaderFinalized.has_deadline());
        assert!(Stage::SubFinalized.is_finalized());
    }
}
