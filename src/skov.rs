//! The consensus driver.
//!
//! `SkovState` bundles the block tree, the transaction table, the
//! finalization state and the opaque execution scheduler, and owns
//! every ingress path: blocks, transactions, finalization messages
//! and records, and catch-up requests. All mutation happens under
//! the runner's single lock; outbound traffic is queued as
//! [`SkovEvent`]s and dispatched by the runner after the lock is
//! released.

use {
  crate::{
    blobstore::BlobStore,
    block::{Block, BlockPtr, PendingBlock},
    crypto::BlockHash,
    finalization::{
      FinalizationEvent,
      FinalizationIndex,
      FinalizationMessage,
      FinalizationRecord,
      FinalizationState,
      FinalizerIdentity,
      PartyIndex,
    },
    lottery,
    params::{
      BirkParameters,
      BlockHeight,
      GenesisData,
      RuntimeParameters,
      UpdateQueue,
    },
    scheduler::{ChainMetadata, Scheduler},
    serial::{WireDeserialize, WireSerialize},
    transaction::Transaction,
    tree::{BlockStatus, TreeState},
    txtable::{AddResult, TransactionTable},
  },
  chrono::{DateTime, Utc},
  std::{
    collections::VecDeque,
    sync::Arc,
    time::Instant,
  },
  tracing::{debug, error, info, warn},
};

/// Result of feeding one inbound message through the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
  Success,
  SerializationFail,
  Invalid,
  Duplicate,
  Stale,
  PendingBlock,
  PendingFinalization,
  IncorrectSession,
  EarlyBlock,
  Unverifiable,
  ContinueCatchUp,
  MissingImportFile,
}

/// Outbound work produced while the lock was held; the runner
/// dispatches these in order after releasing it.
#[derive(Debug)]
pub enum SkovEvent {
  BroadcastBlock(Vec<u8>),
  BroadcastFinalizationMessage(Vec<u8>),
  BroadcastFinalizationRecord(Vec<u8>),
  BroadcastCatchUp(Vec<u8>),

  /// Point-to-point replies to a catch-up request.
  DirectBlock { to: PartyIndex, bytes: Vec<u8> },
  DirectFinalizationRecord { to: PartyIndex, bytes: Vec<u8> },

  BlockFinalized {
    block: BlockHash,
    height: BlockHeight,
    index: FinalizationIndex,
  },

  /// A queued chain-parameter update's effective time elapsed.
  ProtocolUpdate(Vec<u8>),
}

/// One observation of both clocks, taken when a message enters the
/// system so every step of its processing sees the same time.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
  pub wall: DateTime<Utc>,
  pub mono: Instant,
}

impl Tick {
  pub fn now() -> Self {
    Self {
      wall: Utc::now(),
      mono: Instant::now(),
    }
  }
}

pub struct SkovState {
  pub(crate) genesis: Arc<GenesisData>,
  pub(crate) runtime: RuntimeParameters,
  pub(crate) tree: TreeState,
  pub(crate) transactions: TransactionTable,
  pub(crate) finalization: FinalizationState,
  pub(crate) scheduler: Arc<dyn Scheduler>,
  pub(crate) updates: UpdateQueue,
  archive: Option<BlobStore>,
  events: VecDeque<SkovEvent>,
}

impl SkovState {
  pub fn new(
    genesis: GenesisData,
    runtime: RuntimeParameters,
    scheduler: Arc<dyn Scheduler>,
    finalizer: Option<FinalizerIdentity>,
    tick: Tick,
  ) -> Self {
    let genesis = Arc::new(genesis);
    let genesis_state = scheduler.genesis_state(&genesis);
    let genesis_ptr = BlockPtr::genesis(&genesis, genesis_state);
    let session = genesis_ptr.hash;
    info!("starting from genesis {session}");

    let tree = TreeState::new(genesis_ptr);
    let finalization = FinalizationState::new(
      Arc::clone(&genesis),
      session,
      finalizer,
      &runtime,
      &tree,
      tick.mono,
    );
    let transactions = TransactionTable::new(
      runtime.transaction_purge_gate,
      runtime.transaction_keep_alive_slots,
    );
    let mut state = Self {
      genesis,
      runtime,
      tree,
      transactions,
      finalization,
      scheduler,
      updates: UpdateQueue::default(),
      archive: None,
      events: VecDeque::new(),
    };
    state.process_finalization_events(tick);
    state
  }

  /// Attaches a blob store; finalized blocks and their records are
  /// appended to it as they settle.
  pub fn with_archive(mut self, archive: BlobStore) -> Self {
    self.archive = Some(archive);
    self
  }

  pub fn genesis_data(&self) -> &GenesisData {
    &self.genesis
  }

  pub fn tree(&self) -> &TreeState {
    &self.tree
  }

  pub fn transactions(&self) -> &TransactionTable {
    &self.transactions
  }

  pub fn finalization(&self) -> &FinalizationState {
    &self.finalization
  }

  pub fn take_event(&mut self) -> Option<SkovEvent> {
    self.events.pop_front()
  }

  pub(crate) fn push_event(&mut self, event: SkovEvent) {
    self.events.push_back(event);
  }

  /// Ingress: a serialized block from a peer.
  pub fn receive_block(&mut self, bytes: &[u8], tick: Tick) -> UpdateResult {
    let block = match Block::from_bytes(bytes) {
      Ok(block) => block,
      Err(e) => {
        debug!("dropping undecodable block: {e}");
        return UpdateResult::SerializationFail;
      }
    };
    let Some(pending) = PendingBlock::new(block, tick.wall) else {
      // a genesis block is never valid network traffic
      return UpdateResult::Invalid;
    };
    self.receive_pending_block(pending, tick)
  }

  pub(crate) fn receive_pending_block(
    &mut self,
    pending: PendingBlock,
    tick: Tick,
  ) -> UpdateResult {
    if self.tree.status(&pending.hash).is_some() {
      return UpdateResult::Duplicate;
    }
    if pending.slot() <= self.tree.last_finalized_slot() {
      return UpdateResult::Stale;
    }

    // reject blocks claiming slots further in the future than the
    // allowed clock drift
    let earliest_rejected =
      tick.wall + chrono::Duration::from_std(self.runtime.early_block_threshold)
        .unwrap_or_else(|_| chrono::Duration::seconds(30));
    if self.genesis.slot_start(pending.slot()) > earliest_rejected {
      debug!("dropping early block {} at slot {}", pending.hash, pending.slot());
      return UpdateResult::EarlyBlock;
    }

    let parent_hash = pending.parent();
    let parent = match self.tree.status(&parent_hash) {
      None | Some(BlockStatus::Pending(_)) => {
        debug!(
          "parent {} of {} has not arrived yet",
          parent_hash, pending.hash
        );
        self.tree.add_pending(pending);
        return UpdateResult::PendingBlock;
      }
      Some(BlockStatus::Dead) => {
        self.tree.mark_dead(pending.hash);
        return UpdateResult::Stale;
      }
      Some(BlockStatus::Alive(ptr)) | Some(BlockStatus::Finalized(ptr, _)) => {
        Arc::clone(ptr)
      }
    };

    let result = self.validate_and_insert(&pending, &parent, tick);
    if result == UpdateResult::Success {
      self.drain_pending_children(pending.hash, tick);
    }
    result
  }

  /// Re-validates and inserts every pending descendant of a block
  /// that just became alive, breadth-first.
  fn drain_pending_children(&mut self, root: BlockHash, tick: Tick) {
    let mut frontier = VecDeque::from([root]);
    while let Some(parent_hash) = frontier.pop_front() {
      for child in self.tree.take_pending_children(&parent_hash) {
        let Some(parent) = self.tree.live_block(&parent_hash).cloned() else {
          // the parent was pruned while draining; the pending
          // purge already handled its children
          continue;
        };
        let hash = child.hash;
        if self.validate_and_insert(&child, &parent, tick)
          == UpdateResult::Success
        {
          frontier.push_back(hash);
        }
      }
    }
  }

  /// Election parameters a child of `parent` at `slot` is judged
  /// against: the parent's, shifted once per crossed epoch
  /// boundary.
  pub(crate) fn child_birk(
    &self,
    parent: &BlockPtr,
    slot: u64,
  ) -> Arc<BirkParameters> {
    let parent_epoch = self.genesis.epoch_of_slot(parent.slot());
    let child_epoch = self.genesis.epoch_of_slot(slot);
    if child_epoch == parent_epoch {
      return Arc::clone(&parent.birk);
    }
    let mut birk = (*parent.birk).clone();
    // past two rotations the window is saturated with the current
    // baker set
    for _ in 0..(child_epoch - parent_epoch).min(3) {
      birk = birk.rotate_epoch();
    }
    Arc::new(birk)
  }

  fn validate_and_insert(
    &mut self,
    pending: &PendingBlock,
    parent: &Arc<BlockPtr>,
    tick: Tick,
  ) -> UpdateResult {
    let baked = pending
      .block
      .baked()
      .expect("pending blocks are never genesis");

    if parent.height < self.tree.last_finalized().height {
      self.tree.mark_dead(pending.hash);
      return UpdateResult::Stale;
    }
    if pending.slot() <= parent.slot() {
      warn!("block {} does not advance its parent's slot", pending.hash);
      self.tree.mark_dead(pending.hash);
      return UpdateResult::Invalid;
    }

    let birk = self.child_birk(parent, pending.slot());
    let Some(baker) = birk.lottery_baker(baked.baker).cloned() else {
      warn!("block {} baked by unknown baker {}", pending.hash, baked.baker);
      self.tree.mark_dead(pending.hash);
      return UpdateResult::Invalid;
    };

    if !pending.block.verify_signature(&baker.signature_key) {
      warn!("block {} carries a bad baker signature", pending.hash);
      self.tree.mark_dead(pending.hash);
      return UpdateResult::Invalid;
    }

    let lottery_power = birk.lottery_power(baked.baker).unwrap_or(0.0);
    let leadership_ok = lottery::verify_leadership(
      &baker.election_key,
      &birk.leadership_nonce,
      pending.slot(),
      &baked.election_proof,
    ) && lottery::proof_wins(
      &baked.election_proof,
      birk.election_difficulty,
      lottery_power,
    );
    if !leadership_ok {
      warn!("block {} fails the slot lottery", pending.hash);
      self.tree.mark_dead(pending.hash);
      return UpdateResult::Invalid;
    }

    if !lottery::verify_block_nonce(
      &baker.election_key,
      &birk.leadership_nonce,
      pending.slot(),
      &baked.block_nonce,
    ) {
      warn!("block {} carries a bad block nonce", pending.hash);
      self.tree.mark_dead(pending.hash);
      return UpdateResult::Invalid;
    }

    // the claimed last-finalized block must be finalized here and
    // lie on the parent's ancestor chain
    match self.tree.status(&baked.last_finalized) {
      Some(BlockStatus::Finalized(..)) => {
        if !self.tree.is_ancestor_of(&baked.last_finalized, &parent.hash) {
          self.tree.mark_dead(pending.hash);
          return UpdateResult::Invalid;
        }
      }
      Some(BlockStatus::Dead) => {
        self.tree.mark_dead(pending.hash);
        return UpdateResult::Invalid;
      }
      // the block may descend from a finalization we have not
      // caught up with yet; forget it so catch-up can redeliver
      _ => {
        self.tree.forget(&pending.hash);
        return UpdateResult::Unverifiable;
      }
    }

    let metadata = ChainMetadata {
      slot: pending.slot(),
      height: parent.height + 1,
      baker: baked.baker,
    };
    let outcome =
      self
        .scheduler
        .execute(parent.state, &baked.transactions, &metadata);

    for (index, tx) in baked.transactions.iter().enumerate() {
      self.transactions.add_transaction(tx.clone(), pending.slot());
      self.transactions.commit_transaction(
        pending.slot(),
        pending.hash,
        tx,
        index as u64,
      );
    }

    let ptr = Arc::new(BlockPtr::for_baked(
      pending,
      parent,
      birk,
      outcome.state,
      tick.wall,
    ));
    info!("block {ptr} arrived and is alive");
    self.tree.insert_alive(Arc::clone(&ptr));

    self.finalization.notify_block_arrival(&self.tree, tick.mono);
    self.process_finalization_events(tick);

    // a queued record may have been waiting for exactly this block
    if let Some(record) = self.finalization.queued_record_for_block(&ptr.hash)
    {
      if record.index == self.tree.next_finalization_index() {
        self.apply_record(record, tick);
        self.process_finalization_events(tick);
      }
    }

    UpdateResult::Success
  }

  /// Ingress: a serialized transaction from a client or peer.
  pub fn receive_transaction(
    &mut self,
    bytes: &[u8],
    tick: Tick,
  ) -> UpdateResult {
    let tx = match Transaction::from_bytes(bytes) {
      Ok(tx) => tx,
      Err(e) => {
        debug!("dropping undecodable transaction: {e}");
        return UpdateResult::SerializationFail;
      }
    };
    if !tx.verify_signature() {
      return UpdateResult::Invalid;
    }
    let slot = self.genesis.slot_at(tick.wall);
    let result = match self.transactions.add_transaction(tx, slot) {
      AddResult::Added => UpdateResult::Success,
      AddResult::Duplicate => UpdateResult::Duplicate,
      AddResult::Obsolete => UpdateResult::Stale,
    };
    // the insertion-gated sweep piggybacks on ingress
    self.transactions.purge(slot, false);
    result
  }

  /// Ingress: a serialized WMVBA step message.
  pub fn receive_finalization_message(
    &mut self,
    bytes: &[u8],
    tick: Tick,
  ) -> UpdateResult {
    let message = match FinalizationMessage::from_bytes(bytes) {
      Ok(message) => message,
      Err(e) => {
        debug!("dropping undecodable finalization message: {e}");
        return UpdateResult::SerializationFail;
      }
    };
    let result = self.finalization.receive_finalization_message(
      message,
      &self.tree,
      tick.mono,
    );
    self.process_finalization_events(tick);
    result
  }

  /// Ingress: a serialized finalization record.
  pub fn receive_finalization_record(
    &mut self,
    bytes: &[u8],
    tick: Tick,
  ) -> UpdateResult {
    let record = match FinalizationRecord::from_bytes(bytes) {
      Ok(record) => record,
      Err(e) => {
        debug!("dropping undecodable finalization record: {e}");
        return UpdateResult::SerializationFail;
      }
    };

    let next = self.tree.next_finalization_index();
    if record.index < next {
      return UpdateResult::Stale;
    }
    if record.index > next {
      // a gap we cannot verify; catch-up will deliver the missing
      // prefix
      return UpdateResult::PendingFinalization;
    }
    if !self.finalization.verify_record(&record) {
      return UpdateResult::Invalid;
    }
    let result = self.apply_record(record, tick);
    self.process_finalization_events(tick);
    result
  }

  /// Applies a verified record at the tree's next index.
  fn apply_record(
    &mut self,
    record: FinalizationRecord,
    tick: Tick,
  ) -> UpdateResult {
    match self.tree.status(&record.block) {
      Some(BlockStatus::Alive(_)) => {}
      Some(BlockStatus::Finalized(..)) => return UpdateResult::Duplicate,
      Some(BlockStatus::Dead) => return UpdateResult::Invalid,
      // the finalized block has not arrived; park the record until
      // it does
      _ => {
        debug!("queueing {record} until its block arrives");
        self.finalization.queue_record(record);
        return UpdateResult::PendingBlock;
      }
    }

    let outcome = match self.tree.mark_finalized(&record.block, record.clone())
    {
      Ok(outcome) => outcome,
      Err(e) => {
        // only reachable through an internal bug; the state is
        // still consistent for other threads
        error!("finalization failed: {e}");
        panic!("finalization invariant violated: {e}");
      }
    };

    self.finalization.queue_record(record.clone());

    let last_finalized_slot = self.tree.last_finalized_slot();
    for ptr in &outcome.finalized_chain {
      self.transactions.finalize_transactions(
        ptr.hash,
        ptr.slot(),
        ptr.block.transactions(),
      );
    }
    for ptr in &outcome.pruned {
      self
        .transactions
        .purge_dead_block(&ptr.hash, last_finalized_slot);
    }

    // records embedded by the newly finalized chain are settled
    let mut settled: Option<FinalizationIndex> = None;
    for ptr in &outcome.finalized_chain {
      if let Some(BlockStatus::Finalized(_, embedded)) =
        self.tree.status(&ptr.last_finalized)
      {
        settled = settled.max(Some(embedded.index));
      }
    }
    if let Some(index) = settled {
      self.finalization.settle_records(index);
    }

    // an unwritable archive degrades durability, not consensus
    if let Some(archive) = &self.archive {
      for ptr in &outcome.finalized_chain {
        if let Err(e) = archive.store(&*ptr.block) {
          warn!("failed to archive finalized block {}: {e}", ptr.hash);
        }
      }
      if let Err(e) = archive.store(&record) {
        warn!("failed to archive {record}: {e}");
      }
    }

    self.events.push_back(SkovEvent::BlockFinalized {
      block: record.block,
      height: self.tree.last_finalized().height,
      index: record.index,
    });

    self
      .finalization
      .notify_block_finalized(&record, &self.tree, tick.mono);
    UpdateResult::Success
  }

  /// Ingress: a peer's catch-up status message.
  pub fn receive_catch_up(&mut self, bytes: &[u8], tick: Tick) -> UpdateResult {
    let message = match crate::finalization::CatchUpMessage::from_bytes(bytes)
    {
      Ok(message) => message,
      Err(e) => {
        debug!("dropping undecodable catch-up message: {e}");
        return UpdateResult::SerializationFail;
      }
    };
    let sender = message.sender;
    let sender_index = message.index;

    let (update, catch_up) =
      self
        .finalization
        .process_catch_up(message, &self.tree, tick.mono);
    self.process_finalization_events(tick);

    match update {
      UpdateResult::IncorrectSession
      | UpdateResult::Invalid
      | UpdateResult::Duplicate => return update,
      _ => {}
    }

    if catch_up.sender_behind {
      // hand the lagging peer every record it is missing, along
      // with the finalized blocks those records reference
      for index in sender_index..self.tree.next_finalization_index() {
        let Some(record) = self.tree.finalization_record(index).cloned()
        else {
          continue;
        };
        if let Some(ptr) = self.tree.live_block(&record.block).cloned() {
          self.events.push_back(SkovEvent::DirectBlock {
            to: sender,
            bytes: ptr.block.to_bytes(),
          });
        }
        self.events.push_back(SkovEvent::DirectFinalizationRecord {
          to: sender,
          bytes: record.to_bytes(),
        });
      }
    }

    if catch_up.block_catch_up_needed {
      UpdateResult::ContinueCatchUp
    } else {
      UpdateResult::Success
    }
  }

  /// Runs the periodic finalization replay; called by the runner's
  /// replay timer.
  pub fn finalization_replay_tick(&mut self, tick: Tick) {
    self.finalization.trigger_replay(tick.mono);
    self.process_finalization_events(tick);
  }

  /// Schedules a chain-parameter update; the first one whose
  /// effective time elapses wins.
  pub fn schedule_protocol_update(
    &mut self,
    update: crate::params::ProtocolUpdate,
  ) {
    self.updates.add(update);
  }

  /// Forced transaction-table sweep; called by the purge thread.
  /// Elapsed protocol updates surface here as well.
  pub fn purge_transactions(&mut self, tick: Tick) {
    let slot = self.genesis.slot_at(tick.wall);
    self.transactions.purge(slot, true);

    let was_effective = self.updates.effective().is_some();
    if let Some(update) =
      self.updates.tick(crate::params::timestamp_of(tick.wall))
    {
      if !was_effective {
        info!("protocol update became effective");
        self
          .events
          .push_back(SkovEvent::ProtocolUpdate(update.payload.clone()));
      }
    }
  }

  fn process_finalization_events(&mut self, tick: Tick) {
    while let Some(event) = self.finalization.take_event() {
      match event {
        FinalizationEvent::Broadcast(message) => {
          self.events.push_back(SkovEvent::BroadcastFinalizationMessage(
            message.to_bytes(),
          ));
        }
        FinalizationEvent::BroadcastRecord(record) => {
          self.events.push_back(SkovEvent::BroadcastFinalizationRecord(
            record.to_bytes(),
          ));
        }
        FinalizationEvent::BroadcastCatchUp(message) => {
          self
            .events
            .push_back(SkovEvent::BroadcastCatchUp(message.to_bytes()));
        }
        FinalizationEvent::RecordReady(record) => {
          self.apply_record(record, tick);
        }
      }
    }
  }
}
