//! Core-Set Selection: the gather stage of each ABBA phase.
//!
//! Parties echo the justified choices they observe as `Seen`
//! messages and, once a quorum's worth of inputs is in, freeze
//! their view with a `DoneReporting`. The core set is the union of
//! enough reported views; it is guaranteed to overlap between any
//! two honest parties.

use {
  crate::finalization::committee::{FinalizationCommittee, PartyIndex},
  std::collections::{BTreeMap, HashMap, HashSet},
};

#[derive(Default)]
pub(super) struct CssRound {
  /// Justified choices this node observed directly.
  inputs: HashMap<PartyIndex, bool>,

  /// What each reporter claims to have seen.
  seen: HashMap<PartyIndex, BTreeMap<PartyIndex, bool>>,

  /// Reporters that froze their view, with the view they froze.
  done: HashMap<PartyIndex, Vec<(PartyIndex, bool)>>,

  pub my_done_sent: bool,

  core: Option<BTreeMap<PartyIndex, bool>>,
}

impl CssRound {
  /// Records a party's justified choice; returns false on
  /// equivocation.
  pub fn add_input(&mut self, party: PartyIndex, choice: bool) -> bool {
    match self.inputs.get(&party) {
      Some(existing) => *existing == choice,
      None => {
        self.inputs.insert(party, choice);
        true
      }
    }
  }

  pub fn has_input(&self, party: PartyIndex) -> bool {
    self.inputs.contains_key(&party)
  }

  /// Records a `Seen` report; returns false when the reporter
  /// contradicts an earlier report about the same party.
  pub fn add_seen(
    &mut self,
    reporter: PartyIndex,
    party: PartyIndex,
    choice: bool,
  ) -> bool {
    let view = self.seen.entry(reporter).or_default();
    match view.get(&party) {
      Some(existing) => *existing == choice,
      None => {
        view.insert(party, choice);
        true
      }
    }
  }

  /// Records a frozen view; returns false on a second, different
  /// report from the same party.
  pub fn add_done(
    &mut self,
    reporter: PartyIndex,
    view: Vec<(PartyIndex, bool)>,
  ) -> bool {
    match self.done.get(&reporter) {
      Some(existing) => *existing == view,
      None => {
        self.done.insert(reporter, view);
        true
      }
    }
  }

  /// This node's own frozen view, as sent in its `DoneReporting`.
  pub fn my_view(&self) -> Vec<(PartyIndex, bool)> {
    let ordered: BTreeMap<PartyIndex, bool> =
      self.inputs.iter().map(|(p, c)| (*p, *c)).collect();
    ordered.into_iter().collect()
  }

  pub fn input_weight(
    &self,
    committee: &FinalizationCommittee,
    equivocators: &HashSet<PartyIndex>,
  ) -> u64 {
    let parties: Vec<PartyIndex> = self
      .inputs
      .keys()
      .filter(|party| !equivocators.contains(party))
      .copied()
      .collect();
    committee.weight_of(parties.iter())
  }

  pub fn done_weight(
    &self,
    committee: &FinalizationCommittee,
    equivocators: &HashSet<PartyIndex>,
  ) -> u64 {
    let parties: Vec<PartyIndex> = self
      .done
      .keys()
      .filter(|party| !equivocators.contains(party))
      .copied()
      .collect();
    committee.weight_of(parties.iter())
  }

  /// Computes the core once a quorum of frozen views is in. The
  /// core is cached; it never shrinks afterwards.
  pub fn try_core(
    &mut self,
    committee: &FinalizationCommittee,
    equivocators: &HashSet<PartyIndex>,
  ) -> Option<&BTreeMap<PartyIndex, bool>> {
    if self.core.is_none()
      && self.done_weight(committee, equivocators) >= committee.quorum_weight()
    {
      let mut core: BTreeMap<PartyIndex, bool> =
        self.inputs.iter().map(|(p, c)| (*p, *c)).collect();
      for (reporter, view) in &self.done {
        if equivocators.contains(reporter) {
          continue;
        }
        for (party, choice) in view {
          core.entry(*party).or_insert(*choice);
        }
      }
      self.core = Some(core);
    }
    self.core.as_ref()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::CssRound,
    crate::{
      crypto::{BlsSecretKey, Keypair, VrfKeypair},
      finalization::committee::FinalizationCommittee,
      params::VoterInfo,
    },
    std::collections::HashSet,
  };

  fn committee() -> FinalizationCommittee {
    let voters: Vec<VoterInfo> = (0u8..4)
      .map(|i| {
        let keypair: Keypair = [i + 1; 32].as_slice().try_into().unwrap();
        VoterInfo {
          signature_key: keypair.public(),
          election_key: VrfKeypair::from_seed(&[i + 1; 32]).public(),
          bls_key: BlsSecretKey::from_seed(&[i + 1; 32]).public(),
          power: 1,
        }
      })
      .collect();
    FinalizationCommittee::new(&voters)
  }

  #[test]
  fn core_forms_at_done_quorum() {
    let committee = committee();
    let equivocators = HashSet::new();
    let mut css = CssRound::default();

    css.add_input(0, true);
    css.add_input(1, true);
    assert!(css.try_core(&committee, &equivocators).is_none());

    css.add_done(0, vec![(0, true), (1, true)]);
    css.add_done(1, vec![(0, true), (1, true), (2, false)]);
    assert!(css.try_core(&committee, &equivocators).is_none());

    css.add_done(2, vec![(2, false)]);
    let core = css.try_core(&committee, &equivocators).unwrap();
    assert_eq!(core.len(), 3);
    assert_eq!(core.get(&2), Some(&false));
  }

  #[test]
  fn conflicting_reports_are_flagged() {
    let mut css = CssRound::default();
    assert!(css.add_seen(0, 1, true));
    assert!(!css.add_seen(0, 1, false));
    assert!(css.add_done(0, vec![(1, true)]));
    assert!(!css.add_done(0, vec![(1, false)]));
  }
}
