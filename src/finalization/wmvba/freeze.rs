//! Freeze: the first stage of a WMVBA round.
//!
//! Every party proposes its justified candidate block and then
//! votes once enough proposals are in. The stage either freezes a
//! unique value (enough weight voted for one block) or lands on
//! bottom, which tells ABBA that no single value could be agreed
//! this round.

use {
  crate::{
    crypto::BlockHash,
    finalization::committee::{FinalizationCommittee, PartyIndex},
  },
  std::collections::{HashMap, HashSet},
};

#[derive(Default)]
pub(super) struct Freeze {
  /// First proposal seen per party; a second, different one marks
  /// the party as equivocating.
  proposals: HashMap<PartyIndex, BlockHash>,

  votes: HashMap<PartyIndex, Option<BlockHash>>,

  pub my_proposal_sent: bool,
  pub my_vote_sent: bool,

  /// `Some(Some(v))` once frozen on v, `Some(None)` once frozen on
  /// bottom.
  pub decision: Option<Option<BlockHash>>,
}

impl Freeze {
  /// Records a proposal; returns false on equivocation.
  pub fn add_proposal(&mut self, party: PartyIndex, block: BlockHash) -> bool {
    match self.proposals.get(&party) {
      Some(existing) => *existing == block,
      None => {
        self.proposals.insert(party, block);
        true
      }
    }
  }

  /// Records a vote; returns false on equivocation.
  pub fn add_vote(
    &mut self,
    party: PartyIndex,
    vote: Option<BlockHash>,
  ) -> bool {
    match self.votes.get(&party) {
      Some(existing) => *existing == vote,
      None => {
        self.votes.insert(party, vote);
        true
      }
    }
  }

  /// Total weight of justified, non-equivocating proposers.
  pub fn proposal_weight(
    &self,
    committee: &FinalizationCommittee,
    equivocators: &HashSet<PartyIndex>,
    justified: &HashSet<BlockHash>,
  ) -> u64 {
    let parties: Vec<PartyIndex> = self
      .proposals
      .iter()
      .filter(|(party, block)| {
        !equivocators.contains(party) && justified.contains(*block)
      })
      .map(|(party, _)| *party)
      .collect();
    committee.weight_of(parties.iter())
  }

  /// The justified value with the most proposal weight; ties break
  /// toward the lowest hash so all honest parties pick the same
  /// one.
  pub fn leading_proposal(
    &self,
    committee: &FinalizationCommittee,
    equivocators: &HashSet<PartyIndex>,
    justified: &HashSet<BlockHash>,
  ) -> Option<(BlockHash, u64)> {
    let mut weights: HashMap<BlockHash, u64> = HashMap::new();
    for (party, block) in &self.proposals {
      if equivocators.contains(party) || !justified.contains(block) {
        continue;
      }
      let weight = committee.party(*party).map(|p| p.weight).unwrap_or(0);
      *weights.entry(*block).or_default() += weight;
    }
    weights
      .into_iter()
      .max_by(|(ha, wa), (hb, wb)| wa.cmp(wb).then(hb.cmp(ha)))
  }

  pub fn vote_weight(
    &self,
    committee: &FinalizationCommittee,
    equivocators: &HashSet<PartyIndex>,
  ) -> u64 {
    let parties: Vec<PartyIndex> = self
      .votes
      .keys()
      .filter(|party| !equivocators.contains(party))
      .copied()
      .collect();
    committee.weight_of(parties.iter())
  }

  /// The vote value with the most weight behind it. Ties prefer a
  /// block over bottom, then the lowest hash, so the outcome does
  /// not depend on map iteration order.
  pub fn leading_vote(
    &self,
    committee: &FinalizationCommittee,
    equivocators: &HashSet<PartyIndex>,
  ) -> Option<(Option<BlockHash>, u64)> {
    let mut weights: HashMap<Option<BlockHash>, u64> = HashMap::new();
    for (party, vote) in &self.votes {
      if equivocators.contains(party) {
        continue;
      }
      let weight = committee.party(*party).map(|p| p.weight).unwrap_or(0);
      *weights.entry(*vote).or_default() += weight;
    }
    weights.into_iter().max_by(|(va, wa), (vb, wb)| {
      wa.cmp(wb)
        .then_with(|| match (va, vb) {
          (Some(ha), Some(hb)) => hb.cmp(ha),
          (Some(_), None) => std::cmp::Ordering::Greater,
          (None, Some(_)) => std::cmp::Ordering::Less,
          (None, None) => std::cmp::Ordering::Equal,
        })
    })
  }
}

#[cfg(test)]
mod tests {
  use {
    super::Freeze,
    crate::{
      crypto::{BlsSecretKey, HashValue, Keypair, VrfKeypair},
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
  fn equivocating_proposal_is_detected() {
    let mut freeze = Freeze::default();
    assert!(freeze.add_proposal(0, HashValue::digest(b"a")));
    assert!(freeze.add_proposal(0, HashValue::digest(b"a")));
    assert!(!freeze.add_proposal(0, HashValue::digest(b"b")));
  }

  #[test]
  fn weights_ignore_equivocators_and_unjustified_values() {
    let committee = committee();
    let block = HashValue::digest(b"a");
    let other = HashValue::digest(b"b");

    let mut justified = HashSet::new();
    justified.insert(block);

    let mut equivocators = HashSet::new();
    let mut freeze = Freeze::default();
    freeze.add_proposal(0, block);
    freeze.add_proposal(1, block);
    freeze.add_proposal(2, other); // not justified
    freeze.add_proposal(3, block);
    equivocators.insert(3);

    assert_eq!(
      freeze.proposal_weight(&committee, &equivocators, &justified),
      2
    );
    let (leader, weight) = freeze
      .leading_proposal(&committee, &equivocators, &justified)
      .unwrap();
    assert_eq!(leader, block);
    assert_eq!(weight, 2);
  }

  #[test]
  fn vote_tally() {
    let committee = committee();
    let block = HashValue::digest(b"a");
    let equivocators = HashSet::new();

    let mut freeze = Freeze::default();
    freeze.add_vote(0, Some(block));
    freeze.add_vote(1, Some(block));
    freeze.add_vote(2, None);

    assert_eq!(freeze.vote_weight(&committee, &equivocators), 3);
    assert_eq!(
      freeze.leading_vote(&committee, &equivocators).unwrap(),
      (Some(block), 2)
    );
  }
}
