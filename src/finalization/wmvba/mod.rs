//! Weighted Multi-Valued Byzantine Agreement.
//!
//! One instance runs per finalization round `(index, delta)`. The
//! round freezes a candidate block, runs binary agreement on
//! whether a freeze value exists, and finishes by aggregating BLS
//! witness signatures over the agreed block. The instance is a
//! pure state machine: inputs arrive through [`Wmvba::receive`] and
//! [`Wmvba::justify_input`], outputs drain through [`Wmvba::poll`].
//! The caller signs and broadcasts `Send` outputs and must feed its
//! own signed messages back in, so this node's weight counts like
//! everyone else's.

mod abba;
mod css;
mod freeze;

use {
  crate::{
    crypto::{
      aggregate,
      BlockHash,
      BlsSecretKey,
      BlsSignature,
      Signature,
      VrfKeypair,
    },
    finalization::{
      committee::{FinalizationCommittee, PartyIndex},
      messages::{
        witness_message,
        Delta,
        FinalizationIndex,
        Phase,
        SessionId,
        WmvbaMessage,
      },
    },
  },
  abba::Abba,
  freeze::Freeze,
  std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Arc,
  },
  tracing::{debug, warn},
};

/// Keys a committee member contributes to a round. Passive
/// observers run the same machine without keys and never send.
#[derive(Clone)]
pub struct WmvbaKeys {
  pub index: PartyIndex,
  pub vrf: Arc<VrfKeypair>,
  pub bls: Arc<BlsSecretKey>,
}

#[derive(Debug)]
pub enum WmvbaOutput {
  Send(WmvbaMessage),
  Complete(Option<WmvbaResult>),
}

/// A successful round: the agreed block and the aggregate witness
/// proof.
#[derive(Debug, Clone)]
pub struct WmvbaResult {
  pub value: BlockHash,
  pub parties: Vec<PartyIndex>,
  pub signature: BlsSignature,
}

pub struct Wmvba {
  session: SessionId,
  index: FinalizationIndex,
  delta: Delta,
  committee: Arc<FinalizationCommittee>,
  keys: Option<WmvbaKeys>,

  /// Candidate blocks the tree state has justified for this round.
  justified: HashSet<BlockHash>,
  input: Option<BlockHash>,

  /// Parties caught sending conflicting messages; their weight no
  /// longer counts toward any justification, but their signatures
  /// stay usable as witnesses.
  equivocators: HashSet<PartyIndex>,

  freeze: Freeze,
  abba: Abba,

  witnesses: HashMap<BlockHash, BTreeMap<PartyIndex, BlsSignature>>,
  my_witness_sent: bool,

  outputs: VecDeque<WmvbaOutput>,
  complete: bool,
}

impl Wmvba {
  pub fn new(
    session: SessionId,
    index: FinalizationIndex,
    delta: Delta,
    committee: Arc<FinalizationCommittee>,
    keys: Option<WmvbaKeys>,
  ) -> Self {
    Self {
      session,
      index,
      delta,
      committee,
      keys,
      justified: HashSet::new(),
      input: None,
      equivocators: HashSet::new(),
      freeze: Freeze::default(),
      abba: Abba::default(),
      witnesses: HashMap::new(),
      my_witness_sent: false,
      outputs: VecDeque::new(),
      complete: false,
    }
  }

  pub fn delta(&self) -> Delta {
    self.delta
  }

  pub fn is_complete(&self) -> bool {
    self.complete
  }

  /// Drains the next output event.
  pub fn poll(&mut self) -> Option<WmvbaOutput> {
    self.outputs.pop_front()
  }

  /// Marks a block as an acceptable round value. Called by the
  /// driver for every eligible block, including ones that arrive
  /// after the round started.
  pub fn justify_input(&mut self, block: BlockHash) {
    if self.justified.insert(block) {
      self.step();
    }
  }

  /// Sets this node's candidate and enters the round actively.
  pub fn nominate(&mut self, block: BlockHash) {
    self.justified.insert(block);
    if self.input.is_none() {
      self.input = Some(block);
      self.step();
    }
  }

  /// The evidence kept when the round fails: every signature on
  /// `WeAreDone(false)`.
  pub fn failed_round_evidence(&self) -> Vec<(PartyIndex, Signature)> {
    self
      .abba
      .done_false_signatures
      .iter()
      .map(|(party, signature)| (*party, *signature))
      .collect()
  }

  /// Witness signatures collected for a block, whether or not the
  /// round finished; these strengthen queued finalization records.
  pub fn witnesses_for(
    &self,
    value: &BlockHash,
  ) -> Vec<(PartyIndex, BlsSignature)> {
    self
      .witnesses
      .get(value)
      .map(|map| map.iter().map(|(p, s)| (*p, s.clone())).collect())
      .unwrap_or_default()
  }

  /// Feeds one verified message from `party` into the round. The
  /// caller has already checked committee membership and the
  /// ed25519 envelope signature; VRF tickets and BLS witness
  /// signatures are checked here.
  pub fn receive(
    &mut self,
    party: PartyIndex,
    body: &WmvbaMessage,
    signature: &Signature,
  ) {
    match body {
      WmvbaMessage::Proposal(block) => {
        if !self.freeze.add_proposal(party, *block) {
          self.flag_equivocator(party, "proposal");
        }
      }
      WmvbaMessage::Vote(vote) => {
        if !self.freeze.add_vote(party, *vote) {
          self.flag_equivocator(party, "vote");
        }
      }
      WmvbaMessage::Justified {
        phase,
        choice,
        ticket,
      } => {
        let Some(member) = self.committee.party(party) else {
          return;
        };
        let message = self.ticket_message(*phase);
        if !member.election_key.verify(&message, ticket) {
          debug!("dropping justified message with a bad ticket");
          return;
        }
        let fresh = !self.abba.phase_mut(*phase).css.has_input(party);
        if !self.abba.add_justified(*phase, party, *choice, ticket.clone()) {
          self.flag_equivocator(party, "justified choice");
        } else if fresh && self.keys.is_some() {
          // echo the observation; the orchestrator may delay this
          self.outputs.push_back(WmvbaOutput::Send(WmvbaMessage::Seen {
            phase: *phase,
            party,
            choice: *choice,
          }));
        }
      }
      WmvbaMessage::Seen {
        phase,
        party: subject,
        choice,
      } => {
        if !self.abba.phase_mut(*phase).css.add_seen(party, *subject, *choice)
        {
          self.flag_equivocator(party, "seen report");
        }
      }
      WmvbaMessage::DoneReporting { phase, seen } => {
        if !self.abba.phase_mut(*phase).css.add_done(party, seen.clone()) {
          self.flag_equivocator(party, "done reporting");
        }
      }
      WmvbaMessage::WeAreDone(choice) => {
        if !self.abba.add_we_are_done(party, *choice, signature) {
          self.flag_equivocator(party, "termination vote");
        }
      }
      WmvbaMessage::Witness {
        value,
        signature: witness,
      } => {
        let Some(member) = self.committee.party(party) else {
          return;
        };
        let message =
          witness_message(self.session, self.index, self.delta, *value);
        if !witness.verify(&message, &member.bls_key) {
          debug!("dropping witness with a bad BLS signature");
          return;
        }
        self
          .witnesses
          .entry(*value)
          .or_default()
          .entry(party)
          .or_insert_with(|| witness.clone());
      }
    }
    self.step();
  }

  fn flag_equivocator(&mut self, party: PartyIndex, kind: &str) {
    if self.equivocators.insert(party) {
      warn!("party {party} equivocated on a {kind}; ignoring its weight");
    }
  }

  fn ticket_message(&self, phase: Phase) -> Vec<u8> {
    let mut message = Vec::with_capacity(64);
    message.extend_from_slice(b"skov-ba-ticket");
    message.extend_from_slice(&self.session);
    message.extend_from_slice(&self.index.to_be_bytes());
    message.extend_from_slice(&self.delta.to_be_bytes());
    message.extend_from_slice(&phase.to_be_bytes());
    message
  }

  fn send(&mut self, body: WmvbaMessage) {
    self.outputs.push_back(WmvbaOutput::Send(body));
  }

  /// Advances every stage as far as the current evidence allows.
  fn step(&mut self) {
    if self.complete {
      return;
    }
    self.step_freeze();
    self.step_abba();
    self.step_termination();
  }

  fn step_freeze(&mut self) {
    let quorum = self.committee.quorum_weight();
    let strong = self
      .committee
      .total_weight()
      .saturating_sub(2 * self.committee.corrupt_weight());

    if self.keys.is_some()
      && !self.freeze.my_proposal_sent
      && self.input.is_some()
    {
      self.freeze.my_proposal_sent = true;
      let input = self.input.expect("checked above");
      self.send(WmvbaMessage::Proposal(input));
    }

    if self.keys.is_some()
      && !self.freeze.my_vote_sent
      && self.freeze.proposal_weight(
        &self.committee,
        &self.equivocators,
        &self.justified,
      ) >= quorum
    {
      self.freeze.my_vote_sent = true;
      let vote = match self.freeze.leading_proposal(
        &self.committee,
        &self.equivocators,
        &self.justified,
      ) {
        Some((block, weight)) if weight >= strong => Some(block),
        _ => None,
      };
      self.send(WmvbaMessage::Vote(vote));
    }

    if self.freeze.decision.is_none()
      && self.freeze.vote_weight(&self.committee, &self.equivocators) >= quorum
    {
      let frozen = match self
        .freeze
        .leading_vote(&self.committee, &self.equivocators)
      {
        Some((Some(block), weight)) if weight >= strong => Some(block),
        _ => None,
      };
      debug!("freeze stage settled on {frozen:?}");
      self.freeze.decision = Some(frozen);
      self.abba.started = true;
      self.abba.current_choice = frozen.is_some();
    }
  }

  fn step_abba(&mut self) {
    if !self.abba.started {
      return;
    }
    let quorum = self.committee.quorum_weight();

    loop {
      let phase = self.abba.current_phase;
      let choice = self.abba.current_choice;

      if let Some(keys) = self.keys.clone() {
        if !self.abba.phase_mut(phase).my_justified_sent {
          self.abba.phase_mut(phase).my_justified_sent = true;
          let ticket = keys.vrf.prove(&self.ticket_message(phase));
          self.send(WmvbaMessage::Justified {
            phase,
            choice,
            ticket,
          });
        }

        let input_weight = self
          .abba
          .phase_mut(phase)
          .css
          .input_weight(&self.committee, &self.equivocators);
        if !self.abba.phase_mut(phase).css.my_done_sent
          && input_weight >= quorum
        {
          self.abba.phase_mut(phase).css.my_done_sent = true;
          let seen = self.abba.phase_mut(phase).css.my_view();
          self.send(WmvbaMessage::DoneReporting { phase, seen });
        }
      }

      if self.abba.phase_mut(phase).acted {
        return;
      }
      let committee = Arc::clone(&self.committee);
      let core = match self
        .abba
        .phase_mut(phase)
        .css
        .try_core(&committee, &self.equivocators)
      {
        Some(core) => core.clone(),
        None => return,
      };
      self.abba.phase_mut(phase).acted = true;

      let mut sides: HashSet<bool> = HashSet::new();
      for (party, choice) in &core {
        if !self.equivocators.contains(party) {
          sides.insert(*choice);
        }
      }
      if sides.is_empty() {
        return;
      }

      if sides.len() == 1 {
        let decided = sides.into_iter().next().expect("one side");
        self.abba.current_choice = decided;
        if self.keys.is_some() && !self.abba.my_done_sent {
          self.abba.my_done_sent = true;
          self.send(WmvbaMessage::WeAreDone(decided));
        }
        return;
      }

      // mixed core: the ticket coin picks the next phase's choice
      self.abba.current_choice =
        self.abba.coin(phase, &core, &self.equivocators);
      self.abba.current_phase = phase + 1;
    }
  }

  fn step_termination(&mut self) {
    if self.abba.completed.is_none() {
      let quorum = self.committee.quorum_weight();
      for side in [true, false] {
        if self.abba.done_weight_for(
          side,
          &self.committee,
          &self.equivocators,
        ) >= quorum
        {
          self.abba.completed = Some(side);
          break;
        }
      }
    }

    match self.abba.completed {
      None => {}
      Some(false) => {
        self.complete = true;
        self.outputs.push_back(WmvbaOutput::Complete(None));
      }
      Some(true) => {
        if let (Some(keys), Some(Some(value))) =
          (self.keys.clone(), self.freeze.decision)
        {
          if !self.my_witness_sent {
            self.my_witness_sent = true;
            let message =
              witness_message(self.session, self.index, self.delta, value);
            self.send(WmvbaMessage::Witness {
              value,
              signature: keys.bls.sign(&message),
            });
          }
        }

        // any block with witnesses above the corruption bound is
        // provably final
        let winner = self.witnesses.iter().find_map(|(value, map)| {
          let parties: Vec<PartyIndex> = map.keys().copied().collect();
          (self.committee.weight_of(parties.iter())
            > self.committee.corrupt_weight())
          .then_some(*value)
        });
        if let Some(value) = winner {
          let map = &self.witnesses[&value];
          let parties: Vec<PartyIndex> = map.keys().copied().collect();
          let signature = aggregate(map.values())
            .expect("a non-empty witness set aggregates");
          self.complete = true;
          self.outputs.push_back(WmvbaOutput::Complete(Some(WmvbaResult {
            value,
            parties,
            signature,
          })));
        }
      }
    }
  }
}
