//! Block production.
//!
//! [`try_bake`] runs once per slot under the consensus lock: it
//! draws the slot lottery against the parent's election snapshot
//! and, on a win, assembles, signs and inserts a block before the
//! runner broadcasts it. Losing returns the timestamp of the next
//! slot so the baker thread knows how long to sleep.

use {
  crate::{
    block::{Block, PendingBlock},
    crypto::{Keypair, VrfKeypair},
    lottery,
    params::{BakerId, Slot},
    serial::WireSerialize,
    skov::{SkovEvent, SkovState, Tick, UpdateResult},
    transaction::Transaction,
    tree::BlockStatus,
  },
  chrono::{DateTime, Utc},
  std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  tracing::{debug, info, warn},
};

/// Key material of a block-producing node.
pub struct BakerIdentity {
  pub id: BakerId,
  pub sign: Arc<Keypair>,
  pub election: Arc<VrfKeypair>,
}

#[derive(Debug)]
pub enum BakeOutcome {
  /// A block was produced, inserted, and queued for broadcast.
  Baked { slot: Slot, block: PendingBlock },

  /// The lottery was lost (or not yet due); sleep until `until`
  /// and try `next_slot`.
  WaitUntil {
    next_slot: Slot,
    until: DateTime<Utc>,
  },

  /// The node is shutting down; the baker loop exits.
  Shutdown,
}

pub fn try_bake(
  skov: &mut SkovState,
  baker: &BakerIdentity,
  next_slot: Slot,
  tick: Tick,
  shutdown: &AtomicBool,
) -> BakeOutcome {
  eprintln!("MARK 1 entry");
  if shutdown.load(Ordering::SeqCst) {
    return BakeOutcome::Shutdown;
  }

  let genesis = Arc::clone(&skov.genesis);
  let slot = next_slot.max(skov.genesis.slot_at(tick.wall)).max(1);
  let wait = || BakeOutcome::WaitUntil {
    next_slot: slot.saturating_add(1),
    until: genesis.slot_start(slot.saturating_add(1)),
  };

  // build on the best block already baked in an earlier slot
  let mut parent = Arc::clone(skov.tree.best_block());
  while parent.slot() >= slot {
    parent = match skov.tree.live_block(&parent.parent) {
      Some(ptr) => Arc::clone(ptr),
      None => return wait(),
    };
  }

  eprintln!("MARK 2 before child_birk");
  let birk = skov.child_birk(&parent, slot);
  let Some(info) = birk.lottery_baker(baker.id).cloned() else {
    debug!("baker {} is not in the lottery snapshot", baker.id);
    return wait();
  };
  if info.signature_key != baker.sign.public()
    || info.election_key != baker.election.public()
  {
    warn!("local baker keys do not match the chain's baker {}", baker.id);
    return wait();
  }

  eprintln!("MARK 3 before lottery_power");
  let lottery_power = birk.lottery_power(baker.id).unwrap_or(0.0);
  let election_proof =
    lottery::prove_leadership(&baker.election, &birk.leadership_nonce, slot);
  if !lottery::proof_wins(
    &election_proof,
    birk.election_difficulty,
    lottery_power,
  ) {
    debug!("lost the lottery for slot {slot}");
    return wait();
  }

  eprintln!("MARK 4 after proof_wins");
  // point at the newest finalization that extends the parent's
  let parent_record_index = match skov.tree.status(&parent.last_finalized) {
    Some(BlockStatus::Finalized(_, record)) => record.index,
    _ => 0,
  };
  let last_finalized = match skov.tree.finalization_record(parent_record_index + 1)
  {
    Some(record)
      if matches!(
        skov.tree.status(&record.block),
        Some(BlockStatus::Finalized(..))
      ) =>
    {
      record.block
    }
    _ => parent.last_finalized,
  };

  eprintln!("MARK 5 before greedy fill");
  // greedy fill under the block-size and energy caps
  let mut selected: Vec<Transaction> = Vec::new();
  let mut total_size = 0u64;
  let mut total_energy = 0u64;
  for tx in skov
    .transactions
    .block_candidates(|block| skov.tree.is_ancestor_of(block, &parent.hash))
  {
    let size = tx.size();
    if total_size + size > genesis.max_block_size
      || total_energy + tx.energy > genesis.max_block_energy
    {
      continue;
    }
    total_size += size;
    total_energy += tx.energy;
    selected.push(tx.clone());
  }

  eprintln!("MARK 6 before block_nonce");
  let block_nonce =
    lottery::prove_block_nonce(&baker.election, &birk.leadership_nonce, slot);
  let block = Block::bake(
    &baker.sign,
    slot,
    parent.hash,
    baker.id,
    election_proof,
    block_nonce,
    last_finalized,
    selected,
  );
  eprintln!("MARK 7 before PendingBlock::new");
  let pending = PendingBlock::new(block, tick.wall)
    .expect("baked blocks are never genesis");
  eprintln!("MARK 7b after PendingBlock::new unwrap");
  let bytes = pending.block.to_bytes();
  eprintln!("MARK 7c after to_bytes");

  eprintln!("MARK 8 before receive_pending_block");
  match skov.receive_pending_block(pending.clone(), tick) {
    UpdateResult::Success => {
      info!(
        "baked block {} at slot {slot} on top of {}",
        pending.hash, parent.hash
      );
      skov.push_event(SkovEvent::BroadcastBlock(bytes));
      BakeOutcome::Baked {
        slot,
        block: pending,
      }
    }
    other => {
      // our own block should never be refused; losing the slot is
      // better than wedging the loop
      warn!("freshly baked block was rejected with {other:?}");
      wait()
    }
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{try_bake, BakeOutcome, BakerIdentity},
    crate::{
      crypto::{HashValue, Keypair, VrfKeypair},
      params::{
        BakerInfo,
        BirkParameters,
        FinalizationParameters,
        GenesisData,
        RuntimeParameters,
      },
      scheduler::CountingScheduler,
      skov::{SkovState, Tick},
    },
    chrono::TimeZone,
    std::sync::{atomic::AtomicBool, Arc},
  };

  fn baker(seed: u8) -> BakerIdentity {
    BakerIdentity {
      id: seed as u64,
      sign: Arc::new([seed + 1; 32].as_slice().try_into().unwrap()),
      election: Arc::new(VrfKeypair::from_seed(&[seed + 1; 32])),
    }
  }

  fn genesis_with(bakers: &[BakerIdentity], difficulty: f64) -> GenesisData {
    GenesisData {
      timestamp: 1_600_000_000_000,
      slot_duration_millis: 1000,
      epoch_length: 100,
      birk_parameters: BirkParameters::genesis(
        difficulty,
        HashValue::digest(b"leadership"),
        bakers
          .iter()
          .map(|b| BakerInfo {
            id: b.id,
            signature_key: b.sign.public(),
            election_key: b.election.public(),
            stake: 100,
          })
          .collect(),
      ),
      finalization_parameters: FinalizationParameters {
        committee: vec![],
        minimum_skip: 1,
      },
      max_block_size: 1 << 20,
      max_block_energy: 1 << 20,
    }
  }

  fn tick_at(genesis: &GenesisData, slot: u64) -> Tick {
    Tick {
      wall: chrono::Utc
        .timestamp_millis_opt(
          (genesis.timestamp + slot * genesis.slot_duration_millis) as i64,
        )
        .single()
        .unwrap(),
      mono: std::time::Instant::now(),
    }
  }

  #[test]
  fn sole_baker_with_certain_difficulty_bakes_every_slot() {
    let identity = baker(0);
    let genesis = genesis_with(std::slice::from_ref(&identity), 1.0);
    let mut skov = SkovState::new(
      genesis.clone(),
      RuntimeParameters::default(),
      Arc::new(CountingScheduler::default()),
      None,
      tick_at(&genesis, 0),
    );

    let running = AtomicBool::new(false);
    let outcome =
      try_bake(&mut skov, &identity, 1, tick_at(&genesis, 1), &running);
    let BakeOutcome::Baked { slot, block } = outcome else {
      panic!("a difficulty-1.0 lottery cannot be lost");
    };
    assert_eq!(slot, 1);
    assert_eq!(skov.tree().best_block().hash, block.hash);

    let outcome =
      try_bake(&mut skov, &identity, 2, tick_at(&genesis, 2), &running);
    let BakeOutcome::Baked { slot, block } = outcome else {
      panic!("a difficulty-1.0 lottery cannot be lost");
    };
    assert_eq!(slot, 2);
    assert_eq!(skov.tree().best_block().hash, block.hash);
    assert_eq!(skov.tree().best_block().height, 2);
  }

  #[test]
  fn unknown_baker_waits() {
    let identity = baker(0);
    let genesis = genesis_with(std::slice::from_ref(&identity), 1.0);
    let mut skov = SkovState::new(
      genesis.clone(),
      RuntimeParameters::default(),
      Arc::new(CountingScheduler::default()),
      None,
      tick_at(&genesis, 0),
    );

    let stranger = baker(5);
    let running = AtomicBool::new(false);
    let outcome =
      try_bake(&mut skov, &stranger, 1, tick_at(&genesis, 1), &running);
    assert!(matches!(outcome, BakeOutcome::WaitUntil { next_slot: 2, .. }));
  }

  #[test]
  fn shutdown_preempts_the_lottery() {
    let identity = baker(0);
    let genesis = genesis_with(std::slice::from_ref(&identity), 1.0);
    let mut skov = SkovState::new(
      genesis.clone(),
      RuntimeParameters::default(),
      Arc::new(CountingScheduler::default()),
      None,
      tick_at(&genesis, 0),
    );

    let stopping = AtomicBool::new(true);
    let outcome =
      try_bake(&mut skov, &identity, 1, tick_at(&genesis, 1), &stopping);
    assert!(matches!(outcome, BakeOutcome::Shutdown));
    // nothing was produced on the way out
    assert_eq!(skov.tree().best_block().height, 0);
  }
}
