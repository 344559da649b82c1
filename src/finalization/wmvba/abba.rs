//! Phase bookkeeping for ABBA, the binary agreement inside WMVBA.
//!
//! Each phase runs one CSS round over the parties' current binary
//! choices, then settles the next choice either unanimously or via
//! the ticket coin. Termination is signalled with `WeAreDone`
//! messages; the false-side signatures double as the evidence a
//! failed round keeps for catch-up.

use {
  super::css::CssRound,
  crate::{
    crypto::{Signature, VrfProof},
    finalization::{
      committee::{FinalizationCommittee, PartyIndex},
      messages::Phase,
    },
  },
  std::collections::{BTreeMap, HashMap, HashSet},
};

#[derive(Default)]
pub(super) struct AbbaPhase {
  pub css: CssRound,

  /// Coin tickets carried by the `Justified` messages.
  pub tickets: HashMap<PartyIndex, VrfProof>,

  pub my_justified_sent: bool,

  /// Whether this phase's core has already driven a transition.
  pub acted: bool,
}

pub(super) struct Abba {
  pub current_phase: Phase,
  pub current_choice: bool,
  pub started: bool,

  phases: BTreeMap<Phase, AbbaPhase>,

  we_are_done: HashMap<PartyIndex, bool>,

  /// Signatures on `WeAreDone(false)`, kept as the failure
  /// certificate when the round loses.
  pub done_false_signatures: BTreeMap<PartyIndex, Signature>,

  pub my_done_sent: bool,

  /// Set once a quorum of `WeAreDone` lands on one side.
  pub completed: Option<bool>,
}

impl Default for Abba {
  fn default() -> Self {
    Self {
      current_phase: 0,
      current_choice: false,
      started: false,
      phases: BTreeMap::new(),
      we_are_done: HashMap::new(),
      done_false_signatures: BTreeMap::new(),
      my_done_sent: false,
      completed: None,
    }
  }
}

impl Abba {
  pub fn phase_mut(&mut self, phase: Phase) -> &mut AbbaPhase {
    self.phases.entry(phase).or_default()
  }

  /// Records a justified choice with its ticket; returns false on
  /// equivocation.
  pub fn add_justified(
    &mut self,
    phase: Phase,
    party: PartyIndex,
    choice: bool,
    ticket: VrfProof,
  ) -> bool {
    let state = self.phase_mut(phase);
    if !state.css.add_input(party, choice) {
      return false;
    }
    state.tickets.entry(party).or_insert(ticket);
    true
  }

  /// Records a termination vote; returns false on equivocation.
  pub fn add_we_are_done(
    &mut self,
    party: PartyIndex,
    choice: bool,
    signature: &Signature,
  ) -> bool {
    match self.we_are_done.get(&party) {
      Some(existing) if *existing != choice => false,
      _ => {
        self.we_are_done.insert(party, choice);
        if !choice {
          self.done_false_signatures.entry(party).or_insert(*signature);
        }
        true
      }
    }
  }

  pub fn done_weight_for(
    &self,
    choice: bool,
    committee: &FinalizationCommittee,
    equivocators: &HashSet<PartyIndex>,
  ) -> u64 {
    let parties: Vec<PartyIndex> = self
      .we_are_done
      .iter()
      .filter(|(party, c)| !equivocators.contains(party) && **c == choice)
      .map(|(party, _)| *party)
      .collect();
    committee.weight_of(parties.iter())
  }

  /// The coin for a mixed core: the choice of the core party
  /// holding the lowest ticket. Falls back to the phase parity if
  /// no core party's ticket was observed.
  pub fn coin(
    &self,
    phase: Phase,
    core: &BTreeMap<PartyIndex, bool>,
    equivocators: &HashSet<PartyIndex>,
  ) -> bool {
    let Some(state) = self.phases.get(&phase) else {
      return phase % 2 == 0;
    };
    let winner = core
      .keys()
      .filter(|party| !equivocators.contains(party))
      .filter_map(|party| {
        state
          .tickets
          .get(party)
          .map(|ticket| (ticket.output_hash(), *party))
      })
      .min();
    match winner {
      Some((_, party)) => core[&party],
      None => phase % 2 == 0,
    }
  }
}

#[cfg(test)]
mod tests {
  use {
    super::Abba,
    crate::crypto::{Signature, VrfKeypair},
    std::collections::HashSet,
  };

  fn signature() -> Signature {
    Signature::from_bytes(&[0u8; 64]).unwrap()
  }

  #[test]
  fn we_are_done_equivocation_is_rejected() {
    let mut abba = Abba::default();
    assert!(abba.add_we_are_done(0, true, &signature()));
    assert!(abba.add_we_are_done(0, true, &signature()));
    assert!(!abba.add_we_are_done(0, false, &signature()));
  }

  #[test]
  fn false_votes_keep_their_signatures() {
    let mut abba = Abba::default();
    abba.add_we_are_done(0, false, &signature());
    abba.add_we_are_done(1, true, &signature());
    assert_eq!(abba.done_false_signatures.len(), 1);
    assert!(abba.done_false_signatures.contains_key(&0));
  }

  #[test]
  fn coin_follows_the_lowest_ticket() {
    let mut abba = Abba::default();
    let vrf_a = VrfKeypair::from_seed(&[1u8; 32]);
    let vrf_b = VrfKeypair::from_seed(&[2u8; 32]);

    let ticket_a = vrf_a.prove(b"ticket-0");
    let ticket_b = vrf_b.prove(b"ticket-0");
    abba.add_justified(0, 0, true, ticket_a.clone());
    abba.add_justified(0, 1, false, ticket_b.clone());

    let mut core = std::collections::BTreeMap::new();
    core.insert(0, true);
    core.insert(1, false);

    // party 0 chose true, so the coin is true exactly when its
    // ticket is the lower one
    let expected = ticket_a.output_hash() < ticket_b.output_hash();
    assert_eq!(abba.coin(0, &core, &HashSet::new()), expected);
  }
}
