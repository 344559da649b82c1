//! The multi-version block store.
//!
//! Blocks enter as pending (parent unknown), become alive once
//! validated and executed, and end as finalized or dead. The
//! `branches` structure keeps every alive block bucketed by height
//! above the last finalized block, which makes best-block selection
//! and the pruning sweep at finalization cheap.

use {
  crate::{
    block::{BlockPtr, PendingBlock},
    crypto::BlockHash,
    finalization::FinalizationRecord,
    params::{BlockHeight, Slot},
  },
  priority_queue::PriorityQueue,
  std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Arc,
  },
  thiserror::Error,
  tracing::{debug, info},
};

#[derive(Debug, Error)]
pub enum TreeError {
  #[error("block {0} is not alive")]
  NotAlive(BlockHash),

  #[error("finalization index {actual} does not follow {expected}")]
  NonSequentialFinalization { expected: u64, actual: u64 },

  #[error("finalized block {0} does not descend from the last finalized block")]
  NotDescendant(BlockHash),
}

/// Lifecycle state of a block hash.
///
/// Transitions are monotone within a branch: Pending → Alive →
/// Finalized, Pending → Dead, or Alive → Dead when an abandoned
/// branch is pruned at finalization.
pub enum BlockStatus {
  Pending(PendingBlock),
  Alive(Arc<BlockPtr>),
  Dead,
  Finalized(Arc<BlockPtr>, FinalizationRecord),
}

impl BlockStatus {
  /// The pointer for a block that is alive or finalized.
  pub fn pointer(&self) -> Option<&Arc<BlockPtr>> {
    match self {
      Self::Alive(ptr) | Self::Finalized(ptr, _) => Some(ptr),
      _ => None,
    }
  }

  pub fn is_alive(&self) -> bool {
    matches!(self, Self::Alive(_))
  }

  pub fn is_finalized(&self) -> bool {
    matches!(self, Self::Finalized(..))
  }
}

/// What a finalization did to the tree: the chain of blocks that
/// became finalized (ascending, ending with the explicit target)
/// and the branches that died.
pub struct FinalizationOutcome {
  pub finalized_chain: Vec<Arc<BlockPtr>>,
  pub pruned: Vec<Arc<BlockPtr>>,
  pub dead_pending: Vec<BlockHash>,
}

pub struct TreeState {
  blocks: HashMap<BlockHash, BlockStatus>,

  genesis: Arc<BlockPtr>,
  last_finalized: Arc<BlockPtr>,

  /// Dense: the record at position i finalized index i.
  finalization_records: Vec<FinalizationRecord>,

  finalized_by_height: BTreeMap<BlockHeight, BlockHash>,

  /// Alive blocks bucketed by height; index 0 holds height
  /// `last_finalized.height + 1`.
  branches: VecDeque<Vec<Arc<BlockPtr>>>,

  /// Children waiting for a parent, plus the same entries ordered
  /// by slot so stale ones can be discarded from the front.
  pending_children: HashMap<BlockHash, Vec<PendingBlock>>,
  pending_queue: PriorityQueue<BlockHash, Reverse<Slot>>,
  pending_parent: HashMap<BlockHash, BlockHash>,

  /// Best block cache; always an alive block of maximal height
  /// (ties broken by lowest hash) or the last finalized block.
  focus: Arc<BlockPtr>,
}

impl TreeState {
  pub fn new(genesis: BlockPtr) -> Self {
    let genesis = Arc::new(genesis);
    let record = FinalizationRecord::genesis(genesis.hash);
    let mut blocks = HashMap::new();
    blocks.insert(
      genesis.hash,
      BlockStatus::Finalized(Arc::clone(&genesis), record.clone()),
    );
    let mut finalized_by_height = BTreeMap::new();
    finalized_by_height.insert(0, genesis.hash);
    Self {
      blocks,
      last_finalized: Arc::clone(&genesis),
      focus: Arc::clone(&genesis),
      genesis,
      finalization_records: vec![record],
      finalized_by_height,
      branches: VecDeque::new(),
      pending_children: HashMap::new(),
      pending_queue: PriorityQueue::new(),
      pending_parent: HashMap::new(),
    }
  }

  pub fn genesis(&self) -> &Arc<BlockPtr> {
    &self.genesis
  }

  pub fn last_finalized(&self) -> &Arc<BlockPtr> {
    &self.last_finalized
  }

  pub fn last_finalized_slot(&self) -> Slot {
    self.last_finalized.slot()
  }

  pub fn last_finalization_record(&self) -> &FinalizationRecord {
    self
      .finalization_records
      .last()
      .expect("the genesis record is always present")
  }

  /// Index the next finalization will carry.
  pub fn next_finalization_index(&self) -> u64 {
    self.finalization_records.len() as u64
  }

  pub fn finalization_record(&self, index: u64) -> Option<&FinalizationRecord> {
    self.finalization_records.get(index as usize)
  }

  pub fn finalized_at_height(&self, height: BlockHeight) -> Option<&BlockHash> {
    self.finalized_by_height.get(&height)
  }

  pub fn status(&self, hash: &BlockHash) -> Option<&BlockStatus> {
    self.blocks.get(hash)
  }

  /// The pointer of an alive-or-finalized block.
  pub fn live_block(&self, hash: &BlockHash) -> Option<&Arc<BlockPtr>> {
    self.blocks.get(hash).and_then(BlockStatus::pointer)
  }

  pub fn best_block(&self) -> &Arc<BlockPtr> {
    &self.focus
  }

  pub fn alive_at_height(&self, height: BlockHeight) -> Vec<Arc<BlockPtr>> {
    let base = self.last_finalized.height;
    if height <= base {
      return vec![];
    }
    match self.branches.get((height - base - 1) as usize) {
      Some(level) => level.clone(),
      None => vec![],
    }
  }

  pub fn height_of_highest_alive(&self) -> BlockHeight {
    self.last_finalized.height + self.branches.len() as u64
  }

  /// Stores a block whose parent is not alive yet.
  pub fn add_pending(&mut self, pending: PendingBlock) {
    let parent = pending.parent();
    self.pending_queue.push(pending.hash, Reverse(pending.slot()));
    self.pending_parent.insert(pending.hash, parent);
    self
      .pending_children
      .entry(parent)
      .or_default()
      .push(pending.clone());
    self.blocks.insert(pending.hash, BlockStatus::Pending(pending));
  }

  /// Removes and returns the blocks that were waiting for `parent`,
  /// in slot order. Their table entries stay Pending until the
  /// caller re-validates them.
  pub fn take_pending_children(
    &mut self,
    parent: &BlockHash,
  ) -> Vec<PendingBlock> {
    let mut children = match self.pending_children.remove(parent) {
      Some(children) => children,
      None => return vec![],
    };
    for child in &children {
      self.pending_queue.remove(&child.hash);
      self.pending_parent.remove(&child.hash);
    }
    children.sort_by_key(PendingBlock::slot);
    children
  }

  /// Records a block that failed validation as dead.
  pub fn mark_dead(&mut self, hash: BlockHash) {
    self.blocks.insert(hash, BlockStatus::Dead);
  }

  /// Drops all knowledge of a hash so a later delivery starts
  /// fresh; used for blocks that could not be verified yet.
  pub fn forget(&mut self, hash: &BlockHash) {
    self.blocks.remove(hash);
  }

  /// Inserts a validated, executed block into the live tree.
  pub fn insert_alive(&mut self, ptr: Arc<BlockPtr>) {
    let level = (ptr.height - self.last_finalized.height - 1) as usize;
    debug_assert!(
      level <= self.branches.len(),
      "a block's parent is always at most one level below the frontier"
    );
    if level == self.branches.len() {
      self.branches.push_back(vec![]);
    }
    self.branches[level].push(Arc::clone(&ptr));
    self.blocks.insert(ptr.hash, BlockStatus::Alive(Arc::clone(&ptr)));

    if ptr.height > self.focus.height
      || (ptr.height == self.focus.height && ptr.hash < self.focus.hash)
    {
      self.focus = ptr;
    }
  }

  /// Promotes an alive block (and its not-yet-finalized ancestors)
  /// to finalized, kills every branch that does not pass through
  /// it, and discards pending blocks at or below the new horizon.
  pub fn mark_finalized(
    &mut self,
    hash: &BlockHash,
    record: FinalizationRecord,
  ) -> Result<FinalizationOutcome, TreeError> {
    let expected = self.next_finalization_index();
    if record.index != expected {
      return Err(TreeError::NonSequentialFinalization {
        expected,
        actual: record.index,
      });
    }

    let target = match self.blocks.get(hash) {
      Some(BlockStatus::Alive(ptr)) => Arc::clone(ptr),
      _ => return Err(TreeError::NotAlive(*hash)),
    };

    // the ancestor chain from the previous finalized block up to
    // and including the target
    let mut chain = Vec::new();
    let mut cursor = Arc::clone(&target);
    while cursor.height > self.last_finalized.height {
      let parent = cursor.parent;
      chain.push(Arc::clone(&cursor));
      cursor = match self.live_block(&parent) {
        Some(ptr) => Arc::clone(ptr),
        None => return Err(TreeError::NotDescendant(*hash)),
      };
    }
    if cursor.hash != self.last_finalized.hash {
      return Err(TreeError::NotDescendant(*hash));
    }
    chain.reverse();

    let chain_hashes: HashSet<BlockHash> =
      chain.iter().map(|ptr| ptr.hash).collect();
    let finalized_levels =
      (target.height - self.last_finalized.height) as usize;

    let mut pruned = Vec::new();
    for level in self.branches.drain(..finalized_levels.min(
      self.branches.len(),
    )) {
      for ptr in level {
        if chain_hashes.contains(&ptr.hash) {
          self.blocks.insert(
            ptr.hash,
            BlockStatus::Finalized(Arc::clone(&ptr), record.clone()),
          );
          self.finalized_by_height.insert(ptr.height, ptr.hash);
        } else {
          debug!("pruning abandoned branch block {ptr}");
          self.blocks.insert(ptr.hash, BlockStatus::Dead);
          pruned.push(ptr);
        }
      }
    }

    // above the target only descendants of the target survive
    let mut survivors: HashSet<BlockHash> = HashSet::new();
    survivors.insert(target.hash);
    for level in self.branches.iter_mut() {
      level.retain(|ptr| {
        if survivors.contains(&ptr.parent) {
          survivors.insert(ptr.hash);
          true
        } else {
          pruned.push(Arc::clone(ptr));
          false
        }
      });
    }
    for ptr in &pruned {
      self.blocks.insert(ptr.hash, BlockStatus::Dead);
    }
    while matches!(self.branches.back(), Some(level) if level.is_empty()) {
      self.branches.pop_back();
    }

    self.last_finalized = Arc::clone(&target);
    self.finalization_records.push(record);

    // pending blocks below the new horizon can never become alive
    let dead_pending = self.purge_pending_at_or_below(target.slot());

    self.recompute_focus();
    info!(
      "finalized {target}, pruned {} blocks, {} branches remain",
      pruned.len(),
      self.branches.len()
    );

    Ok(FinalizationOutcome {
      finalized_chain: chain,
      pruned,
      dead_pending,
    })
  }

  fn purge_pending_at_or_below(&mut self, slot: Slot) -> Vec<BlockHash> {
    let mut dead = Vec::new();
    while let Some((_, Reverse(s))) = self.pending_queue.peek() {
      if *s > slot {
        break;
      }
      let (hash, _) = self.pending_queue.pop().expect("peeked above");
      if let Some(parent) = self.pending_parent.remove(&hash) {
        if let Some(children) = self.pending_children.get_mut(&parent) {
          children.retain(|child| child.hash != hash);
          if children.is_empty() {
            self.pending_children.remove(&parent);
          }
        }
      }
      self.blocks.insert(hash, BlockStatus::Dead);
      dead.push(hash);
    }
    dead
  }

  fn recompute_focus(&mut self) {
    self.focus = self
      .branches
      .iter()
      .rev()
      .find(|level| !level.is_empty())
      .and_then(|level| level.iter().min_by_key(|ptr| ptr.hash).cloned())
      .unwrap_or_else(|| Arc::clone(&self.last_finalized));
  }

  /// Whether `ancestor` lies on the parent chain of `descendant`.
  pub fn is_ancestor_of(
    &self,
    ancestor: &BlockHash,
    descendant: &BlockHash,
  ) -> bool {
    let Some(ancestor_ptr) = self.live_block(ancestor) else {
      return false;
    };
    let target_height = ancestor_ptr.height;
    let mut cursor = match self.live_block(descendant) {
      Some(ptr) => Arc::clone(ptr),
      None => return false,
    };
    while cursor.height > target_height {
      cursor = match self.live_block(&cursor.parent) {
        Some(ptr) => Arc::clone(ptr),
        None => return false,
      };
    }
    cursor.hash == *ancestor
  }

  /// The ancestor of `ptr` at exactly `height`.
  pub fn ancestor_at_height(
    &self,
    ptr: &Arc<BlockPtr>,
    height: BlockHeight,
  ) -> Option<Arc<BlockPtr>> {
    if height > ptr.height {
      return None;
    }
    let mut cursor = Arc::clone(ptr);
    while cursor.height > height {
      cursor = Arc::clone(self.live_block(&cursor.parent)?);
    }
    Some(cursor)
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{BlockStatus, TreeState},
    crate::{
      block::{Block, BlockPtr, PendingBlock},
      crypto::{HashValue, Keypair, VrfKeypair},
      finalization::{FinalizationProof, FinalizationRecord},
      params::{
        BakerInfo,
        BirkParameters,
        FinalizationParameters,
        GenesisData,
      },
      scheduler::StateHandle,
    },
    chrono::Utc,
    std::sync::Arc,
  };

  fn keypair() -> Keypair {
    [41u8; 32].as_slice().try_into().unwrap()
  }

  fn genesis_data() -> GenesisData {
    GenesisData {
      timestamp: 1_600_000_000_000,
      slot_duration_millis: 1000,
      epoch_length: 100,
      birk_parameters: BirkParameters::genesis(
        0.5,
        HashValue::digest(b"lead"),
        vec![BakerInfo {
          id: 0,
          signature_key: keypair().public(),
          election_key: VrfKeypair::from_seed(&[1u8; 32]).public(),
          stake: 100,
        }],
      ),
      finalization_parameters: FinalizationParameters {
        committee: vec![],
        minimum_skip: 1,
      },
      max_block_size: 1 << 20,
      max_block_energy: 1 << 20,
    }
  }

  fn tree() -> TreeState {
    TreeState::new(BlockPtr::genesis(&genesis_data(), StateHandle(0)))
  }

  fn child_of(
    tree: &TreeState,
    parent: &Arc<BlockPtr>,
    slot: u64,
    tag: u8,
  ) -> Arc<BlockPtr> {
    let vrf = VrfKeypair::from_seed(&[tag; 32]);
    let block = Block::bake(
      &keypair(),
      slot,
      parent.hash,
      0,
      vrf.prove(b"election"),
      vrf.prove(b"nonce"),
      tree.last_finalized().hash,
      vec![],
    );
    let pending = PendingBlock::new(block, Utc::now()).unwrap();
    Arc::new(BlockPtr::for_baked(
      &pending,
      parent,
      Arc::clone(&parent.birk),
      StateHandle(slot),
      Utc::now(),
    ))
  }

  fn record_for(tree: &TreeState, ptr: &Arc<BlockPtr>) -> FinalizationRecord {
    FinalizationRecord {
      index: tree.next_finalization_index(),
      block: ptr.hash,
      proof: FinalizationProof {
        parties: vec![],
        signature: crate::crypto::BlsSignature::identity(),
      },
      delay: 1,
    }
  }

  #[test]
  fn best_block_breaks_ties_by_lowest_hash() {
    let mut tree = tree();
    let genesis = Arc::clone(tree.genesis());
    let a = child_of(&tree, &genesis, 1, 1);
    let b = child_of(&tree, &genesis, 1, 2);
    tree.insert_alive(Arc::clone(&a));
    tree.insert_alive(Arc::clone(&b));

    let expected = if a.hash < b.hash { &a } else { &b };
    assert_eq!(tree.best_block().hash, expected.hash);

    // a higher block always wins regardless of hash
    let c = child_of(&tree, &a, 2, 3);
    tree.insert_alive(Arc::clone(&c));
    assert_eq!(tree.best_block().hash, c.hash);
  }

  #[test]
  fn finalization_prunes_abandoned_branches() {
    let mut tree = tree();
    let genesis = Arc::clone(tree.genesis());
    let winner = child_of(&tree, &genesis, 1, 1);
    let loser = child_of(&tree, &genesis, 1, 2);
    let loser_child = child_of(&tree, &loser, 2, 3);
    tree.insert_alive(Arc::clone(&winner));
    tree.insert_alive(Arc::clone(&loser));
    tree.insert_alive(Arc::clone(&loser_child));

    let record = record_for(&tree, &winner);
    let outcome = tree.mark_finalized(&winner.hash, record).unwrap();

    assert_eq!(outcome.finalized_chain.len(), 1);
    assert_eq!(outcome.pruned.len(), 2);
    assert!(matches!(
      tree.status(&loser.hash),
      Some(BlockStatus::Dead)
    ));
    assert!(matches!(
      tree.status(&loser_child.hash),
      Some(BlockStatus::Dead)
    ));
    assert!(tree.status(&winner.hash).unwrap().is_finalized());
    assert_eq!(tree.finalized_at_height(1), Some(&winner.hash));
    assert_eq!(tree.best_block().hash, winner.hash);
  }

  #[test]
  fn finalization_promotes_intermediate_ancestors() {
    let mut tree = tree();
    let genesis = Arc::clone(tree.genesis());
    let b1 = child_of(&tree, &genesis, 1, 1);
    let b2 = child_of(&tree, &b1, 2, 2);
    tree.insert_alive(Arc::clone(&b1));
    tree.insert_alive(Arc::clone(&b2));

    let record = record_for(&tree, &b2);
    let outcome = tree.mark_finalized(&b2.hash, record).unwrap();
    assert_eq!(outcome.finalized_chain.len(), 2);
    assert!(tree.status(&b1.hash).unwrap().is_finalized());
    assert!(tree.status(&b2.hash).unwrap().is_finalized());
    assert_eq!(tree.last_finalized().hash, b2.hash);
  }

  #[test]
  fn non_sequential_records_are_rejected() {
    let mut tree = tree();
    let genesis = Arc::clone(tree.genesis());
    let b1 = child_of(&tree, &genesis, 1, 1);
    tree.insert_alive(Arc::clone(&b1));

    let mut record = record_for(&tree, &b1);
    record.index = 5;
    assert!(tree.mark_finalized(&b1.hash, record).is_err());
  }

  #[test]
  fn pending_children_drain_in_slot_order() {
    let mut tree = tree();
    let genesis = Arc::clone(tree.genesis());
    let parent = child_of(&tree, &genesis, 1, 1);
    let late = child_of(&tree, &parent, 3, 2);
    let early = child_of(&tree, &parent, 2, 3);

    for ptr in [&late, &early] {
      let pending = PendingBlock {
        hash: ptr.hash,
        block: Arc::clone(&ptr.block),
        received: Utc::now(),
      };
      tree.add_pending(pending);
    }

    assert!(matches!(
      tree.status(&late.hash),
      Some(BlockStatus::Pending(_))
    ));

    let drained = tree.take_pending_children(&parent.hash);
    let slots: Vec<u64> = drained.iter().map(PendingBlock::slot).collect();
    assert_eq!(slots, vec![2, 3]);
    assert!(tree.take_pending_children(&parent.hash).is_empty());
  }

  #[test]
  fn stale_pending_blocks_die_at_finalization() {
    let mut tree = tree();
    let genesis = Arc::clone(tree.genesis());
    let b1 = child_of(&tree, &genesis, 5, 1);
    tree.insert_alive(Arc::clone(&b1));

    // a pending block at a slot below the new horizon
    let unknown_parent = child_of(&tree, &genesis, 2, 9);
    let orphan = child_of(&tree, &unknown_parent, 3, 2);
    tree.add_pending(PendingBlock {
      hash: orphan.hash,
      block: Arc::clone(&orphan.block),
      received: Utc::now(),
    });

    let record = record_for(&tree, &b1);
    let outcome = tree.mark_finalized(&b1.hash, record).unwrap();
    assert_eq!(outcome.dead_pending, vec![orphan.hash]);
    assert!(matches!(
      tree.status(&orphan.hash),
      Some(BlockStatus::Dead)
    ));
  }

  #[test]
  fn ancestry_queries() {
    let mut tree = tree();
    let genesis = Arc::clone(tree.genesis());
    let b1 = child_of(&tree, &genesis, 1, 1);
    let b2 = child_of(&tree, &b1, 2, 2);
    let other = child_of(&tree, &genesis, 1, 3);
    tree.insert_alive(Arc::clone(&b1));
    tree.insert_alive(Arc::clone(&b2));
    tree.insert_alive(Arc::clone(&other));

    assert!(tree.is_ancestor_of(&b1.hash, &b2.hash));
    assert!(tree.is_ancestor_of(&genesis.hash, &b2.hash));
    assert!(!tree.is_ancestor_of(&other.hash, &b2.hash));
    assert_eq!(
      tree.ancestor_at_height(&b2, 1).unwrap().hash,
      b1.hash
    );
    assert_eq!(tree.ancestor_at_height(&b2, 3), None);
  }
}
