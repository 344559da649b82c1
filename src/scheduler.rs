//! Seam to the block-state execution layer.
//!
//! The consensus engine never inspects account balances or contract
//! state; it hands a parent state handle and an ordered transaction
//! list to the scheduler and records the outcome. The scheduler
//! must be deterministic: the same `(parent_state, transactions,
//! metadata)` triple always yields the same outcome on every node.

use {
  crate::{
    crypto::TransactionHash,
    params::{BakerId, BlockHeight, GenesisData, Slot},
    transaction::Transaction,
  },
  std::{
    collections::HashMap,
    fmt::{Debug, Display},
    sync::atomic::{AtomicU64, Ordering},
  },
};

/// Opaque handle to a post-execution block state owned by the
/// execution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateHandle(pub u64);

impl Display for StateHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "state#{}", self.0)
  }
}

/// Context the scheduler may expose to executing transactions.
#[derive(Debug, Clone, Copy)]
pub struct ChainMetadata {
  pub slot: Slot,
  pub height: BlockHeight,
  pub baker: BakerId,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
  pub state: StateHandle,

  /// Hashes of transactions that executed, in block order.
  pub executed: Vec<TransactionHash>,

  /// Transactions the scheduler rejected permanently.
  pub failed: Vec<TransactionHash>,

  /// Transactions that did not fit and should stay pending.
  pub unprocessed: Vec<TransactionHash>,

  pub energy_used: u64,
}

pub trait Scheduler: Send + Sync {
  fn genesis_state(&self, genesis: &GenesisData) -> StateHandle;

  fn execute(
    &self,
    parent_state: StateHandle,
    transactions: &[Transaction],
    metadata: &ChainMetadata,
  ) -> ExecutionOutcome;
}

/// In-memory scheduler used by tests and standalone runs: executes
/// everything, charges declared energy, and hands out fresh state
/// handles from a counter.
#[derive(Default)]
pub struct CountingScheduler {
  next_state: AtomicU64,
  lineage: parking_lot::Mutex<HashMap<u64, u64>>,
}

impl CountingScheduler {
  /// Parent handle a state was derived from, for assertions.
  pub fn parent_of(&self, state: StateHandle) -> Option<StateHandle> {
    self.lineage.lock().get(&state.0).copied().map(StateHandle)
  }
}

impl Scheduler for CountingScheduler {
  fn genesis_state(&self, _genesis: &GenesisData) -> StateHandle {
    StateHandle(self.next_state.fetch_add(1, Ordering::SeqCst))
  }

  fn execute(
    &self,
    parent_state: StateHandle,
    transactions: &[Transaction],
    _metadata: &ChainMetadata,
  ) -> ExecutionOutcome {
    let state = StateHandle(self.next_state.fetch_add(1, Ordering::SeqCst));
    self.lineage.lock().insert(state.0, parent_state.0);
    ExecutionOutcome {
      state,
      executed: transactions.iter().map(|tx| tx.hash()).collect(),
      failed: vec![],
      unprocessed: vec![],
      energy_used: transactions.iter().map(|tx| tx.energy).sum(),
    }
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{ChainMetadata, CountingScheduler, Scheduler, StateHandle},
    crate::{crypto::Keypair, transaction::Transaction},
  };

  #[test]
  fn counting_scheduler_tracks_lineage() {
    let scheduler = CountingScheduler::default();
    let keypair: Keypair = [8u8; 32].as_slice().try_into().unwrap();
    let txs =
      vec![Transaction::new(&keypair, 0, 21, vec![]), Transaction::new(
        &keypair, 1, 21, vec![],
      )];

    let meta = ChainMetadata {
      slot: 1,
      height: 1,
      baker: 0,
    };
    let outcome = scheduler.execute(StateHandle(0), &txs, &meta);
    assert_eq!(outcome.executed.len(), 2);
    assert_eq!(outcome.energy_used, 42);
    assert_eq!(scheduler.parent_of(outcome.state), Some(StateHandle(0)));
  }
}
