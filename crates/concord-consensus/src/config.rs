//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a round agrees on its batch and parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementMode {
    /// A scheduled leader selects the batch and parameters.
    #[default]
    Leader,
    /// Every member proposes and a common subset decides.
    CommonSubset,
}

impl AgreementMode {
    /// Stable name for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgreementMode::Leader => "leader",
            AgreementMode::CommonSubset => "common_subset",
        }
    }
}

/// Configuration for the consensus engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Time a non-final stage may stay active before its deadline elapses.
    pub stage_timeout_ms: u64,

    /// Interval between ledger inclusion polls once a transaction is posted.
    pub inclusion_poll_ms: u64,

    /// Interval after which unanswered notifications and start
    /// instructions are sent again.
    pub resend_ms: u64,

    /// Leader rotations within one round before falling back to
    /// common-subset agreement. Zero disables the fallback.
    pub acs_after_rotations: u32,

    /// Agreement mode every round starts in.
    pub initial_mode: AgreementMode,

    /// Fee target this node proposes for the rounds it governs.
    pub fee_target: String,

    /// Capacity of each engine mailbox.
    pub mailbox_size: usize,
}

impl EngineConfig {
    /// Stage deadline as a duration.
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    /// Resend interval as a duration.
    pub fn resend_period(&self) -> Duration {
        Duration::from_millis(self.resend_ms)
    }

    /// Inclusion poll period as a duration.
    pub fn inclusion_poll_period(&self) -> Duration {
        Duration::from_millis(self.inclusion_poll_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: 10_000,
            inclusion_poll_ms: 1_000,
            resend_ms: 2_000,
            acs_after_rotations: 8,
            initial_mode: AgreementMode::Leader,
            fee_target: "base".to_string(),
            mailbox_size: 1024,
        }
    }
}
