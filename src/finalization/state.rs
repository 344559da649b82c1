//! Orchestration of finalization rounds.
//!
//! One [`FinalizationState`] drives the whole protocol for a node:
//! it owns the current WMVBA instance, schedules target heights and
//! deltas, buffers out-of-round messages, remembers the evidence of
//! failed rounds, and reconciles settled records with block
//! arrival through the finalization queue. It never touches the
//! tree itself: a completed round surfaces as a `RecordReady` event
//! that the consensus driver applies and acknowledges via
//! [`FinalizationState::notify_block_finalized`].

use {
  super::{
    buffer::SeenBuffer,
    catchup::{replay_delay, CatchUpDedup, CatchUpResult},
    committee::{FinalizationCommittee, PartyIndex},
    messages::{
      CatchUpMessage,
      Delta,
      FinalizationIndex,
      FinalizationMessage,
      FinalizationMessageHeader,
      FinalizationProof,
      FinalizationRecord,
      FinalizationSummary,
      SessionId,
      WmvbaMessage,
    },
    queue::FinalizationQueue,
    wmvba::{Wmvba, WmvbaKeys, WmvbaOutput},
  },
  crate::{
    crypto::{BlockHash, BlsSecretKey, Keypair, VrfKeypair},
    params::{BlockHeight, GenesisData, RuntimeParameters},
    skov::UpdateResult,
    tree::TreeState,
  },
  std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
  },
  tracing::{debug, info, warn},
};

/// Key material of a node that sits on the finalization committee.
pub struct FinalizerIdentity {
  pub sign: Arc<Keypair>,
  pub vrf: Arc<VrfKeypair>,
  pub bls: Arc<BlsSecretKey>,
}

/// Events the consensus driver drains after every finalization
/// operation. Outbound messages are emitted in protocol order.
#[derive(Debug)]
pub enum FinalizationEvent {
  Broadcast(FinalizationMessage),
  BroadcastRecord(FinalizationRecord),
  BroadcastCatchUp(CatchUpMessage),

  /// A round completed; the driver should apply this record to the
  /// tree (or queue it if the block is unknown).
  RecordReady(FinalizationRecord),
}

pub struct FinalizationState {
  session: SessionId,
  genesis: Arc<GenesisData>,
  identity: Option<FinalizerIdentity>,

  committee: Arc<FinalizationCommittee>,
  my_index: Option<PartyIndex>,

  current_index: FinalizationIndex,
  target_height: BlockHeight,
  current_delta: Delta,
  round: Option<Wmvba>,

  /// Evidence of failed rounds at the current index, newest first.
  failed_rounds: Vec<Vec<(PartyIndex, crate::crypto::Signature)>>,

  /// Verified messages buffered per round; retained for the next
  /// index while it is one ahead of current.
  pending_messages:
    BTreeMap<FinalizationIndex, BTreeMap<Delta, Vec<FinalizationMessage>>>,

  queue: FinalizationQueue,
  buffer: SeenBuffer,
  dedup: CatchUpDedup,
  replay_attempts: u32,

  min_skip: u64,
  replay_base_delay: Duration,
  replay_party_delay: Duration,

  events: VecDeque<FinalizationEvent>,
}

impl FinalizationState {
  pub fn new(
    genesis: Arc<GenesisData>,
    session: SessionId,
    identity: Option<FinalizerIdentity>,
    runtime: &RuntimeParameters,
    tree: &TreeState,
    now: Instant,
  ) -> Self {
    let committee = Arc::new(FinalizationCommittee::new(
      &genesis.finalization_parameters.committee,
    ));
    let min_skip = genesis.finalization_parameters.minimum_skip;
    let mut state = Self {
      session,
      my_index: identity
        .as_ref()
        .and_then(|id| committee.party_by_key(&id.sign.public()))
        .map(|party| party.index),
      identity,
      committee,
      genesis,
      current_index: 1,
      target_height: 0,
      current_delta: 1,
      round: None,
      failed_rounds: Vec::new(),
      pending_messages: BTreeMap::new(),
      queue: FinalizationQueue::new(),
      buffer: SeenBuffer::new(),
      dedup: CatchUpDedup::new(runtime.catch_up_retention),
      replay_attempts: 0,
      min_skip,
      replay_base_delay: runtime.finalization_replay_base_delay,
      replay_party_delay: runtime.finalization_replay_party_delay,
      events: VecDeque::new(),
    };
    state.target_height = state.compute_target(tree);
    state.start_round(tree, now);
    state
  }

  pub fn current_index(&self) -> FinalizationIndex {
    self.current_index
  }

  pub fn current_delta(&self) -> Delta {
    self.current_delta
  }

  pub fn target_height(&self) -> BlockHeight {
    self.target_height
  }

  pub fn committee(&self) -> &FinalizationCommittee {
    &self.committee
  }

  pub fn is_active_member(&self) -> bool {
    self.my_index.is_some()
  }

  pub fn queue(&self) -> &FinalizationQueue {
    &self.queue
  }

  pub fn failed_round_count(&self) -> usize {
    self.failed_rounds.len()
  }

  pub fn take_event(&mut self) -> Option<FinalizationEvent> {
    self.events.pop_front()
  }

  /// The delay before the next catch-up replay of the current
  /// round.
  pub fn next_replay_delay(&self) -> Duration {
    replay_delay(
      self.replay_base_delay,
      self.replay_party_delay,
      self.committee.len(),
      self.replay_attempts,
    )
  }

  fn keys(&self) -> Option<WmvbaKeys> {
    let identity = self.identity.as_ref()?;
    let index = self.my_index?;
    Some(WmvbaKeys {
      index,
      vrf: Arc::clone(&identity.vrf),
      bls: Arc::clone(&identity.bls),
    })
  }

  /// `H(i) = H(i-1) + max(1 + min_skip, (best - H(i-1)) / 2)` with
  /// truncating division.
  fn compute_target(&self, tree: &TreeState) -> BlockHeight {
    let last = tree.last_finalized().height;
    let best = tree.best_block().height;
    last + (1 + self.min_skip).max((best - last) / 2)
  }

  fn start_round(&mut self, tree: &TreeState, now: Instant) {
    if self.committee.is_empty() {
      // a chain without a committee never finalizes past genesis
      self.round = None;
      return;
    }
    info!(
      "starting finalization round: index {} delta {} target height {}",
      self.current_index, self.current_delta, self.target_height
    );
    let mut wmvba = Wmvba::new(
      self.session,
      self.current_index,
      self.current_delta,
      Arc::clone(&self.committee),
      self.keys(),
    );

    // a block is an acceptable round value when some alive block
    // delta levels above it descends from it
    for ptr in tree.alive_at_height(self.target_height + self.current_delta) {
      if let Some(ancestor) = tree.ancestor_at_height(&ptr, self.target_height)
      {
        wmvba.justify_input(ancestor.hash);
      }
    }
    self.round = Some(wmvba);
    self.replay_attempts = 0;

    // replay what arrived before this round existed
    let buffered: Vec<FinalizationMessage> = self
      .pending_messages
      .get(&self.current_index)
      .and_then(|by_delta| by_delta.get(&self.current_delta))
      .cloned()
      .unwrap_or_default();
    for message in buffered {
      if let Some(round) = self.round.as_mut() {
        round.receive(message.header.sender, &message.body, &message.signature);
      }
    }

    self.try_nominate(tree);
    self.pump(tree, now);
  }

  fn try_nominate(&mut self, tree: &TreeState) {
    let best = Arc::clone(tree.best_block());
    if best.height < self.target_height + self.current_delta {
      return;
    }
    if let Some(ancestor) = tree.ancestor_at_height(&best, self.target_height)
    {
      if let Some(round) = self.round.as_mut() {
        round.nominate(ancestor.hash);
      }
    }
  }

  /// Drains the WMVBA output queue, signing and dispatching
  /// messages and reacting to round completion.
  fn pump(&mut self, tree: &TreeState, now: Instant) {
    loop {
      let output = match self.round.as_mut() {
        Some(round) => round.poll(),
        None => None,
      };
      let Some(output) = output else { break };

      match output {
        WmvbaOutput::Send(body) => self.dispatch(body, now),
        WmvbaOutput::Complete(None) => {
          let evidence = self
            .round
            .as_ref()
            .map(|round| round.failed_round_evidence())
            .unwrap_or_default();
          warn!(
            "finalization round (index {}, delta {}) failed",
            self.current_index, self.current_delta
          );
          self.failed_rounds.insert(0, evidence);
          self.current_delta *= 2;
          self.start_round(tree, now);
          break;
        }
        WmvbaOutput::Complete(Some(result)) => {
          let record = FinalizationRecord {
            index: self.current_index,
            block: result.value,
            proof: FinalizationProof {
              parties: result.parties,
              signature: result.signature,
            },
            delay: self.current_delta,
          };
          info!("finalization round succeeded: {record}");
          self.events.push_back(FinalizationEvent::RecordReady(record));
          break;
        }
      }
    }
  }

  /// Signs an outbound WMVBA step, feeds it back so this node's own
  /// weight counts, and queues it for broadcast. `Seen` messages
  /// take the delay-buffer detour.
  fn dispatch(&mut self, body: WmvbaMessage, now: Instant) {
    let Some(sign) = self.identity.as_ref().map(|id| Arc::clone(&id.sign))
    else {
      return;
    };
    let Some(my_index) = self.my_index else {
      return;
    };
    let header = FinalizationMessageHeader {
      session: self.session,
      index: self.current_index,
      delta: self.current_delta,
      sender: my_index,
    };

    if let WmvbaMessage::Seen { phase, .. } = body {
      self.buffer.buffer_seen(
        (self.current_index, self.current_delta, phase),
        body,
        now,
      );
      return;
    }

    if let WmvbaMessage::DoneReporting { phase, .. } = body {
      // never let a buffered Seen arrive after our DoneReporting
      if let Some(seen) = self
        .buffer
        .flush(&(self.current_index, self.current_delta, phase))
      {
        let message = FinalizationMessage::sign(header, seen, &sign);
        self.record_pending(message.clone());
        self.events.push_back(FinalizationEvent::Broadcast(message));
      }
    }

    let message = FinalizationMessage::sign(header, body, &sign);
    if let Some(round) = self.round.as_mut() {
      round.receive(my_index, &message.body, &message.signature);
    }
    self.record_pending(message.clone());
    self.events.push_back(FinalizationEvent::Broadcast(message));
  }

  /// Releases delay-buffered `Seen` messages that are due; called
  /// from the replay timer.
  pub fn flush_buffered(&mut self, now: Instant) {
    let Some(sign) = self.identity.as_ref().map(|id| Arc::clone(&id.sign))
    else {
      return;
    };
    let Some(my_index) = self.my_index else {
      return;
    };
    for ((index, delta, _), body) in self.buffer.take_due(now) {
      let header = FinalizationMessageHeader {
        session: self.session,
        index,
        delta,
        sender: my_index,
      };
      let message = FinalizationMessage::sign(header, body, &sign);
      self.record_pending(message.clone());
      self.events.push_back(FinalizationEvent::Broadcast(message));
    }
  }

  fn record_pending(&mut self, message: FinalizationMessage) {
    self
      .pending_messages
      .entry(message.header.index)
      .or_default()
      .entry(message.header.delta)
      .or_default()
      .push(message);
  }

  /// Ingress dispatch for a WMVBA step message.
  pub fn receive_finalization_message(
    &mut self,
    message: FinalizationMessage,
    tree: &TreeState,
    now: Instant,
  ) -> UpdateResult {
    if message.header.session != self.session {
      return UpdateResult::IncorrectSession;
    }

    let index = message.header.index;
    if index < self.current_index {
      // stale, unless it still witnesses an unsettled record
      if let WmvbaMessage::Witness {
        value,
        signature: ref witness,
      } = message.body
      {
        if let Some(record) = self.queue.get(index) {
          if record.block == value {
            let verified = self
              .committee
              .party(message.header.sender)
              .map(|party| {
                let statement = super::messages::witness_message(
                  self.session,
                  index,
                  record.delay,
                  value,
                );
                witness.verify(&statement, &party.bls_key)
              })
              .unwrap_or(false);
            if verified {
              self.queue.add_witnesses(
                index,
                [(message.header.sender, witness.clone())],
              );
              return UpdateResult::Success;
            }
          }
        }
      }
      return UpdateResult::Stale;
    }

    if index > self.current_index + 1 {
      return UpdateResult::Invalid;
    }

    let Some(party) = self.committee.party(message.header.sender) else {
      return UpdateResult::Invalid;
    };
    if !message.verify(&party.signature_key) {
      debug!("dropping finalization message with a bad signature");
      return UpdateResult::Invalid;
    }

    let already_buffered = self
      .pending_messages
      .get(&index)
      .and_then(|by_delta| by_delta.get(&message.header.delta))
      .map(|messages| messages.contains(&message))
      .unwrap_or(false);
    if already_buffered {
      return UpdateResult::Duplicate;
    }

    self.record_pending(message.clone());

    if index == self.current_index + 1 {
      return UpdateResult::PendingFinalization;
    }

    // current index: feed the live round when the delta matches;
    // other deltas stay buffered for their round
    if message.header.delta == self.current_delta {
      if let Some(round) = self.round.as_mut() {
        round.receive(message.header.sender, &message.body, &message.signature);
      }
      self.pump(tree, now);
    }

    match referenced_block(&message.body) {
      Some(block) if tree.live_block(&block).is_none() => {
        UpdateResult::PendingBlock
      }
      _ => UpdateResult::Success,
    }
  }

  /// Queues a record until a later finalized block embeds it.
  pub fn queue_record(&mut self, record: FinalizationRecord) -> bool {
    self.queue.add_record(record)
  }

  /// Settles every queued record up to `index`; called when a
  /// finalized block's last-finalized pointer embeds that index.
  pub fn settle_records(&mut self, index: FinalizationIndex) {
    self.queue.advance_to(index);
  }

  /// A queued record that finalizes `block`, used when a pending
  /// block becomes alive.
  pub fn queued_record_for_block(
    &self,
    block: &BlockHash,
  ) -> Option<FinalizationRecord> {
    self.queue.record_for_block(block).cloned()
  }

  /// Verifies a record received from the network against the
  /// committee for its index.
  pub fn verify_record(&self, record: &FinalizationRecord) -> bool {
    record.verify(self.session, &self.committee)
  }

  /// Called by the driver after the tree applied `record`. Advances
  /// to the next index and starts its first round.
  pub fn notify_block_finalized(
    &mut self,
    record: &FinalizationRecord,
    tree: &TreeState,
    now: Instant,
  ) {
    self.pending_messages.remove(&self.current_index);
    self.buffer.drop_below_index(record.index + 1);
    self.failed_rounds.clear();
    self.current_index = record.index + 1;

    // the committee is fixed per session parameters, but derived
    // anew from the finalized state like every other round input
    self.committee = Arc::new(FinalizationCommittee::new(
      &self.genesis.finalization_parameters.committee,
    ));
    self.my_index = self
      .identity
      .as_ref()
      .and_then(|id| self.committee.party_by_key(&id.sign.public()))
      .map(|party| party.index);

    self.current_delta = next_delta(record);
    self.target_height = self.compute_target(tree);
    self.events
      .push_back(FinalizationEvent::BroadcastRecord(record.clone()));
    self.start_round(tree, now);
  }

  /// Called whenever a block becomes alive: it may justify new
  /// round inputs or allow nomination.
  pub fn notify_block_arrival(&mut self, tree: &TreeState, now: Instant) {
    let Some(round) = self.round.as_mut() else {
      return;
    };
    for ptr in tree.alive_at_height(self.target_height + self.current_delta) {
      if let Some(ancestor) = tree.ancestor_at_height(&ptr, self.target_height)
      {
        round.justify_input(ancestor.hash);
      }
    }
    self.try_nominate(tree);
    self.pump(tree, now);
  }

  /// Builds and queues this node's periodic catch-up broadcast.
  pub fn trigger_replay(&mut self, now: Instant) {
    self.flush_buffered(now);
    let Some(identity) = self.identity.as_ref() else {
      return;
    };
    let Some(my_index) = self.my_index else {
      return;
    };
    let summary = self.current_summary();
    let message = CatchUpMessage::sign(
      self.session,
      self.current_index,
      my_index,
      summary,
      &identity.sign,
    );
    self.replay_attempts += 1;
    self
      .events
      .push_back(FinalizationEvent::BroadcastCatchUp(message));
  }

  fn current_summary(&self) -> FinalizationSummary {
    let messages = self
      .pending_messages
      .get(&self.current_index)
      .map(|by_delta| by_delta.values().flatten().cloned().collect())
      .unwrap_or_default();
    FinalizationSummary {
      failed_rounds: self.failed_rounds.clone(),
      messages,
    }
  }

  /// Folds a peer's summary into our state.
  pub fn process_catch_up(
    &mut self,
    message: CatchUpMessage,
    tree: &TreeState,
    now: Instant,
  ) -> (UpdateResult, CatchUpResult) {
    let mut result = CatchUpResult::default();

    if message.session != self.session {
      return (UpdateResult::IncorrectSession, result);
    }
    let Some(party) = self.committee.party(message.sender) else {
      return (UpdateResult::Invalid, result);
    };
    if !message.verify(&party.signature_key) {
      return (UpdateResult::Invalid, result);
    }
    if !self.dedup.observe(&message.signature, now) {
      return (UpdateResult::Duplicate, result);
    }

    if message.index < self.current_index {
      result.sender_behind = true;
    }
    if message.index > self.current_index {
      // the sender has settled indices we have not seen records for
      result.block_catch_up_needed = true;
    }

    let mut learned_something = false;
    for replayed in message.summary.messages {
      match self.receive_finalization_message(replayed, tree, now) {
        UpdateResult::Success | UpdateResult::PendingFinalization => {
          learned_something = true;
        }
        UpdateResult::PendingBlock => {
          learned_something = true;
          result.block_catch_up_needed = true;
        }
        _ => {}
      }
    }

    // a peer replaying fewer failed rounds than we hold is behind
    // within the current index even if its index matches
    if message.index == self.current_index
      && message.summary.failed_rounds.len() < self.failed_rounds.len()
    {
      result.sender_behind = true;
    }

    let update = if result.sender_behind {
      UpdateResult::ContinueCatchUp
    } else if learned_something {
      UpdateResult::Success
    } else {
      UpdateResult::Duplicate
    };
    (update, result)
  }
}

/// Initial delta for the round after a settled record.
fn next_delta(previous: &FinalizationRecord) -> Delta {
  if previous.delay > 2 {
    (previous.delay / 2).max(1)
  } else {
    1
  }
}

/// The block hash a message justifies or witnesses, when it names
/// one.
fn referenced_block(body: &WmvbaMessage) -> Option<BlockHash> {
  match body {
    WmvbaMessage::Proposal(block)
    | WmvbaMessage::Vote(Some(block))
    | WmvbaMessage::Witness { value: block, .. } => Some(*block),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::next_delta;
  use crate::{
    crypto::{BlsSignature, HashValue},
    finalization::messages::{FinalizationProof, FinalizationRecord},
  };

  fn record_with_delay(delay: u64) -> FinalizationRecord {
    FinalizationRecord {
      index: 1,
      block: HashValue::digest(b"b"),
      proof: FinalizationProof {
        parties: vec![],
        signature: BlsSignature::identity(),
      },
      delay,
    }
  }

  #[test]
  fn next_delta_halves_large_delays() {
    assert_eq!(next_delta(&record_with_delay(1)), 1);
    assert_eq!(next_delta(&record_with_delay(2)), 1);
    assert_eq!(next_delta(&record_with_delay(3)), 1);
    assert_eq!(next_delta(&record_with_delay(4)), 2);
    assert_eq!(next_delta(&record_with_delay(16)), 8);
  }
}
