//! Bookkeeping for every transaction the node has seen but not yet
//! discarded.
//!
//! A transaction moves Received → Committed (included in one or
//! more live blocks) → Finalized, or is purged while still only
//! Received. The per-sender pending index keeps nonce order so the
//! baker can fill blocks in a valid sequence, and `next_nonce`
//! tracks the smallest nonce not yet finalized for each sender.

use {
  crate::{
    crypto::{BlockHash, Pubkey, TransactionHash},
    params::Slot,
    transaction::{Nonce, Transaction},
  },
  std::collections::{BTreeMap, HashMap, HashSet},
  tracing::{debug, trace},
};

#[derive(Debug, Clone)]
pub enum TransactionStatus {
  /// Seen in gossip, not yet part of any live block.
  Received { slot: Slot },

  /// Included in one or more live blocks; `blocks` maps each block
  /// to the transaction's index within it.
  Committed {
    slot: Slot,
    blocks: HashMap<BlockHash, u64>,
  },

  /// Included in a finalized block; irrevocable.
  Finalized {
    slot: Slot,
    block: BlockHash,
    index: u64,
  },
}

impl TransactionStatus {
  pub fn slot(&self) -> Slot {
    match self {
      Self::Received { slot }
      | Self::Committed { slot, .. }
      | Self::Finalized { slot, .. } => *slot,
    }
  }

  pub fn is_finalized(&self) -> bool {
    matches!(self, Self::Finalized { .. })
  }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AddResult {
  Added,
  Duplicate,

  /// Nonce already finalized for this sender, or the transaction
  /// itself already is.
  Obsolete,
}

#[derive(Default)]
struct PendingAccount {
  by_nonce: BTreeMap<Nonce, HashSet<TransactionHash>>,

  /// Smallest nonce not yet finalized for this sender.
  next_nonce: Nonce,
}

pub struct TransactionTable {
  table: HashMap<TransactionHash, (Transaction, TransactionStatus)>,
  pending: HashMap<Pubkey, PendingAccount>,

  insertions_since_purge: u64,
  purge_gate: u64,
  keep_alive_slots: u64,
}

impl TransactionTable {
  pub fn new(purge_gate: u64, keep_alive_slots: u64) -> Self {
    Self {
      table: HashMap::new(),
      pending: HashMap::new(),
      insertions_since_purge: 0,
      purge_gate,
      keep_alive_slots,
    }
  }

  pub fn len(&self) -> usize {
    self.table.len()
  }

  pub fn is_empty(&self) -> bool {
    self.table.is_empty()
  }

  pub fn get(
    &self,
    hash: &TransactionHash,
  ) -> Option<(&Transaction, &TransactionStatus)> {
    self.table.get(hash).map(|(tx, status)| (tx, status))
  }

  pub fn next_nonce(&self, sender: &Pubkey) -> Nonce {
    self
      .pending
      .get(sender)
      .map(|account| account.next_nonce)
      .unwrap_or(0)
  }

  pub fn add_transaction(&mut self, tx: Transaction, slot: Slot) -> AddResult {
    let hash = tx.hash();

    if let Some((_, status)) = self.table.get_mut(&hash) {
      return match status {
        TransactionStatus::Finalized { .. } => AddResult::Obsolete,
        TransactionStatus::Received { slot: seen }
        | TransactionStatus::Committed { slot: seen, .. } => {
          *seen = (*seen).max(slot);
          AddResult::Duplicate
        }
      };
    }

    if tx.nonce < self.next_nonce(&tx.sender) {
      return AddResult::Obsolete;
    }

    trace!("adding {tx} to the transaction table");
    let account = self.pending.entry(tx.sender).or_default();
    account.by_nonce.entry(tx.nonce).or_default().insert(hash);
    self
      .table
      .insert(hash, (tx, TransactionStatus::Received { slot }));
    self.insertions_since_purge += 1;
    AddResult::Added
  }

  /// Records that a live block at `slot` includes the transaction
  /// at position `index`.
  pub fn commit_transaction(
    &mut self,
    slot: Slot,
    block: BlockHash,
    tx: &Transaction,
    index: u64,
  ) {
    let hash = tx.hash();
    match self.table.get_mut(&hash) {
      Some((_, status)) => match status {
        TransactionStatus::Received { slot: seen } => {
          let slot = slot.max(*seen);
          let mut blocks = HashMap::new();
          blocks.insert(block, index);
          *status = TransactionStatus::Committed { slot, blocks };
        }
        TransactionStatus::Committed { slot: seen, blocks } => {
          *seen = (*seen).max(slot);
          blocks.insert(block, index);
        }
        TransactionStatus::Finalized { .. } => {
          // late commit of an already-finalized tx on a doomed
          // branch; the branch will be pruned
        }
      },
      None => {
        // first sighting is inside a block
        let account = self.pending.entry(tx.sender).or_default();
        account.by_nonce.entry(tx.nonce).or_default().insert(hash);
        let mut blocks = HashMap::new();
        blocks.insert(block, index);
        self.table.insert(
          hash,
          (tx.clone(), TransactionStatus::Committed { slot, blocks }),
        );
      }
    }
  }

  /// Settles every transaction of a newly finalized block: marks
  /// them Finalized, discards all competitors at the same
  /// `(sender, nonce)`, and advances the senders' next nonces.
  pub fn finalize_transactions(
    &mut self,
    block: BlockHash,
    slot: Slot,
    txs: &[Transaction],
  ) {
    for tx in txs {
      let hash = tx.hash();
      let index = match self.table.get(&hash) {
        Some((_, TransactionStatus::Committed { blocks, .. })) => {
          blocks.get(&block).copied().unwrap_or_default()
        }
        _ => 0,
      };

      if let Some(account) = self.pending.get_mut(&tx.sender) {
        if let Some(bucket) = account.by_nonce.remove(&tx.nonce) {
          for competitor in bucket {
            if competitor != hash {
              trace!("discarding competitor of finalized {tx}");
              self.table.remove(&competitor);
            }
          }
        }
        account.next_nonce = account.next_nonce.max(tx.nonce + 1);
      }

      self.table.insert(
        hash,
        (tx.clone(), TransactionStatus::Finalized { slot, block, index }),
      );
    }
  }

  /// Reverts the commits a now-dead block held. Transactions left
  /// with no live block revert to Received, or are dropped when
  /// their slot is already below the finalized horizon.
  pub fn purge_dead_block(
    &mut self,
    block: &BlockHash,
    last_finalized_slot: Slot,
  ) {
    let mut dropped = Vec::new();
    for (hash, (tx, status)) in self.table.iter_mut() {
      if let TransactionStatus::Committed { slot, blocks } = status {
        if blocks.remove(block).is_some() && blocks.is_empty() {
          if *slot <= last_finalized_slot {
            dropped.push((*hash, tx.sender, tx.nonce));
          } else {
            *status = TransactionStatus::Received { slot: *slot };
          }
        }
      }
    }
    for (hash, sender, nonce) in dropped {
      self.remove_pending_entry(&sender, nonce, &hash);
      self.table.remove(&hash);
    }
  }

  /// Sweeps expired Received transactions. The sweep only runs
  /// when enough insertions have accumulated since the last one,
  /// unless forced by the purge timer.
  pub fn purge(&mut self, current_slot: Slot, force: bool) {
    if !force && self.insertions_since_purge < self.purge_gate {
      return;
    }
    self.insertions_since_purge = 0;

    let mut removed = 0usize;
    let senders: Vec<Pubkey> = self.pending.keys().copied().collect();
    for sender in senders {
      removed += self.purge_sender(&sender, current_slot);
    }
    self.pending.retain(|_, account| !account.by_nonce.is_empty());
    if removed > 0 {
      debug!("purged {removed} expired transactions");
    }
  }

  fn purge_sender(&mut self, sender: &Pubkey, current_slot: Slot) -> usize {
    let Some(account) = self.pending.get_mut(sender) else {
      return 0;
    };

    let mut removed = 0usize;
    let mut rollback_from: Option<Nonce> = None;
    let lowest = account.by_nonce.keys().next().copied();

    for (nonce, bucket) in account.by_nonce.iter_mut() {
      bucket.retain(|hash| {
        let expired = match self.table.get(hash) {
          Some((_, TransactionStatus::Received { slot })) => {
            slot + self.keep_alive_slots <= current_slot
          }
          // committed and finalized entries are never swept here
          _ => false,
        };
        if expired {
          self.table.remove(hash);
          removed += 1;
        }
        !expired
      });

      // a fully purged lowest bucket makes every higher nonce for
      // this sender unsequenceable
      if bucket.is_empty() && Some(*nonce) == lowest {
        rollback_from = Some(*nonce);
        break;
      }
    }

    if let Some(from) = rollback_from {
      let higher = account.by_nonce.split_off(&from);
      for (_, bucket) in higher {
        for hash in bucket {
          if let Some((_, TransactionStatus::Received { .. })) =
            self.table.get(&hash)
          {
            self.table.remove(&hash);
            removed += 1;
          }
        }
      }
    }
    account.by_nonce.retain(|_, bucket| !bucket.is_empty());

    removed
  }

  fn remove_pending_entry(
    &mut self,
    sender: &Pubkey,
    nonce: Nonce,
    hash: &TransactionHash,
  ) {
    if let Some(account) = self.pending.get_mut(sender) {
      if let Some(bucket) = account.by_nonce.get_mut(&nonce) {
        bucket.remove(hash);
        if bucket.is_empty() {
          account.by_nonce.remove(&nonce);
        }
      }
    }
  }

  /// Transactions eligible for a new block, in per-sender nonce
  /// order starting at the next unfinalized nonce. `in_chain`
  /// reports whether a block lies on the branch being extended, so
  /// transactions already committed there are skipped.
  pub fn block_candidates(
    &self,
    in_chain: impl Fn(&BlockHash) -> bool,
  ) -> Vec<&Transaction> {
    let mut candidates = Vec::new();
    for account in self.pending.values() {
      for bucket in account.by_nonce.values() {
        let mut already_on_branch = false;
        let mut chosen = None;
        for hash in bucket {
          if let Some((tx, status)) = self.table.get(hash) {
            match status {
              TransactionStatus::Received { .. } => {
                chosen = chosen.or(Some(tx));
              }
              TransactionStatus::Committed { blocks, .. } => {
                if blocks.keys().any(&in_chain) {
                  already_on_branch = true;
                  break;
                }
                chosen = chosen.or(Some(tx));
              }
              TransactionStatus::Finalized { .. } => {}
            }
          }
        }
        if already_on_branch {
          // the branch already spends this nonce
          continue;
        }
        match chosen {
          Some(tx) => candidates.push(tx),
          // a gap in the nonce sequence blocks the rest
          None => break,
        }
      }
    }
    candidates
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{AddResult, TransactionStatus, TransactionTable},
    crate::{
      crypto::{HashValue, Keypair},
      transaction::Transaction,
    },
  };

  fn keypair(seed: u8) -> Keypair {
    [seed; 32].as_slice().try_into().unwrap()
  }

  fn table() -> TransactionTable {
    TransactionTable::new(1000, 10)
  }

  #[test]
  fn nonce_below_next_is_obsolete() {
    let mut table = table();
    let keys = keypair(1);
    let block = HashValue::digest(b"b1");

    let tx0 = Transaction::new(&keys, 0, 1, vec![]);
    assert_eq!(table.add_transaction(tx0.clone(), 1), AddResult::Added);
    table.commit_transaction(1, block, &tx0, 0);
    table.finalize_transactions(block, 1, &[tx0.clone()]);

    assert_eq!(table.next_nonce(&keys.public()), 1);
    assert_eq!(
      table.add_transaction(Transaction::new(&keys, 0, 1, b"x".to_vec()), 2),
      AddResult::Obsolete
    );
    assert_eq!(table.add_transaction(tx0, 2), AddResult::Obsolete);
  }

  #[test]
  fn duplicates_bump_the_slot() {
    let mut table = table();
    let tx = Transaction::new(&keypair(1), 0, 1, vec![]);
    assert_eq!(table.add_transaction(tx.clone(), 1), AddResult::Added);
    assert_eq!(table.add_transaction(tx.clone(), 5), AddResult::Duplicate);
    let (_, status) = table.get(&tx.hash()).unwrap();
    assert_eq!(status.slot(), 5);
  }

  #[test]
  fn finalization_discards_competitors() {
    let mut table = table();
    let keys = keypair(2);
    let block = HashValue::digest(b"winner");

    // two competing transactions at the same (sender, nonce)
    let winner = Transaction::new(&keys, 0, 1, b"a".to_vec());
    let loser = Transaction::new(&keys, 0, 1, b"b".to_vec());
    table.add_transaction(winner.clone(), 1);
    table.add_transaction(loser.clone(), 1);

    table.commit_transaction(1, block, &winner, 0);
    table.finalize_transactions(block, 1, &[winner.clone()]);

    assert!(table.get(&loser.hash()).is_none());
    assert!(table.get(&winner.hash()).unwrap().1.is_finalized());
    assert_eq!(table.next_nonce(&keys.public()), 1);
  }

  #[test]
  fn dead_block_reverts_commits() {
    let mut table = table();
    let keys = keypair(3);
    let block = HashValue::digest(b"dead");

    let tx = Transaction::new(&keys, 0, 1, vec![]);
    table.add_transaction(tx.clone(), 5);
    table.commit_transaction(5, block, &tx, 0);

    table.purge_dead_block(&block, 2);
    assert!(matches!(
      table.get(&tx.hash()).unwrap().1,
      TransactionStatus::Received { .. }
    ));

    // below the finalized horizon the revert becomes a drop
    table.commit_transaction(5, block, &tx, 0);
    table.purge_dead_block(&block, 7);
    assert!(table.get(&tx.hash()).is_none());
  }

  #[test]
  fn purge_sweeps_expired_and_rolls_back_higher_nonces() {
    let mut table = table();
    let keys = keypair(4);

    let old = Transaction::new(&keys, 0, 1, b"old".to_vec());
    let newer = Transaction::new(&keys, 1, 1, b"newer".to_vec());
    table.add_transaction(old.clone(), 0);
    table.add_transaction(newer.clone(), 0);

    // keep_alive is 10 slots; both expire by slot 20, and the
    // purged lowest bucket drags nonce 1 down with it
    table.purge(20, true);
    assert!(table.get(&old.hash()).is_none());
    assert!(table.get(&newer.hash()).is_none());
    assert!(table.is_empty());
  }

  #[test]
  fn purge_respects_the_insertion_gate() {
    let mut table = TransactionTable::new(1000, 1);
    let tx = Transaction::new(&keypair(5), 0, 1, vec![]);
    table.add_transaction(tx.clone(), 0);

    // not forced and below the gate: nothing happens
    table.purge(100, false);
    assert!(table.get(&tx.hash()).is_some());

    table.purge(100, true);
    assert!(table.get(&tx.hash()).is_none());
  }

  #[test]
  fn candidates_follow_nonce_order_and_skip_in_chain_commits() {
    let mut table = table();
    let keys = keypair(6);
    let on_branch = HashValue::digest(b"on-branch");

    let tx0 = Transaction::new(&keys, 0, 1, vec![]);
    let tx1 = Transaction::new(&keys, 1, 1, vec![]);
    table.add_transaction(tx0.clone(), 1);
    table.add_transaction(tx1.clone(), 1);
    table.commit_transaction(1, on_branch, &tx0, 0);

    // tx0 is already on the branch being extended
    let candidates = table.block_candidates(|b| *b == on_branch);
    let hashes: Vec<_> = candidates.iter().map(|tx| tx.hash()).collect();
    assert_eq!(hashes, vec![tx1.hash()]);

    // on a different branch tx0 is needed again, before tx1
    let candidates = table.block_candidates(|_| false);
    let hashes: Vec<_> = candidates.iter().map(|tx| tx.hash()).collect();
    assert_eq!(hashes, vec![tx0.hash(), tx1.hash()]);
  }
}
