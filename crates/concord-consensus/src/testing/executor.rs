//! Deterministic execution engine.

use crate::collaborators::{ExecutionEngine, ExecutionInput, ExecutionOutput};
use crate::error::{ConsensusError, Result};
use crate::transition::{ResultEssence, ResultState};
use async_trait::async_trait;
use concord_types::Digest;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Folds the input into an essence by hashing.
///
/// Instances built with the same salt agree on every input. A different
/// salt models a member that computes a divergent result.
#[derive(Debug, Default)]
pub struct DeterministicExecutor {
    salt: Vec<u8>,
    fail_remaining: AtomicUsize,
    executions: AtomicUsize,
}

impl DeterministicExecutor {
    /// Creates an honest executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an executor whose results differ from honest ones.
    pub fn divergent(salt: &[u8]) -> Self {
        Self {
            salt: salt.to_vec(),
            ..Self::default()
        }
    }

    /// Fails the next `count` executions.
    pub fn fail_next(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Executions attempted so far, failures included.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Executes synchronously.
    pub fn run_now(&self, input: &ExecutionInput) -> Result<ExecutionOutput> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ConsensusError::Execution("injected failure".to_string()));
        }

        let mut essence = Vec::new();
        essence.extend_from_slice(input.baseline.id().as_bytes());
        for request in &input.requests {
            essence.extend_from_slice(request.id.as_bytes());
        }
        essence.extend_from_slice(&input.timestamp.to_be_bytes());
        essence.extend_from_slice(input.entropy.as_bytes());
        essence.extend_from_slice(input.fee_target.as_bytes());
        essence.extend_from_slice(&self.salt);

        let essence = ResultEssence(essence);
        let commitment = Digest::hash_parts(&[
            b"state:",
            input.baseline.state_commitment.as_bytes(),
            essence.digest().as_bytes(),
        ]);
        Ok(ExecutionOutput {
            essence,
            state: ResultState {
                state_index: input.baseline.target_index(),
                commitment,
            },
        })
    }
}

#[async_trait]
impl ExecutionEngine for DeterministicExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput> {
        self.run_now(&input)
    }
}
