use crate::{
  crypto::{BlsPublicKey, Pubkey, VrfPublicKey},
  params::VoterInfo,
};

/// Position of a party within the committee's ordered vector; this
/// is what travels on the wire instead of full keys.
pub type PartyIndex = u32;

#[derive(Debug, Clone)]
pub struct Party {
  pub index: PartyIndex,
  pub signature_key: Pubkey,
  pub election_key: VrfPublicKey,
  pub bls_key: BlsPublicKey,
  pub weight: u64,
}

/// The fixed, ordered set of parties authorized to vote for one
/// finalization index.
///
/// All quorum arithmetic is weighted: progress requires
/// `total - corrupt` weight of agreeing messages, and a proof is
/// only acceptable above `corrupt` weight, where
/// `corrupt = (total - 1) / 3`.
#[derive(Debug, Clone)]
pub struct FinalizationCommittee {
  parties: Vec<Party>,
  total_weight: u64,
  corrupt_weight: u64,
}

impl FinalizationCommittee {
  pub fn new(voters: &[VoterInfo]) -> Self {
    let parties: Vec<Party> = voters
      .iter()
      .enumerate()
      .map(|(index, voter)| Party {
        index: index as PartyIndex,
        signature_key: voter.signature_key,
        election_key: voter.election_key,
        bls_key: voter.bls_key,
        weight: voter.power,
      })
      .collect();
    let total_weight = parties.iter().map(|p| p.weight).sum::<u64>();
    Self {
      parties,
      total_weight,
      corrupt_weight: total_weight.saturating_sub(1) / 3,
    }
  }

  pub fn party(&self, index: PartyIndex) -> Option<&Party> {
    self.parties.get(index as usize)
  }

  pub fn party_by_key(&self, key: &Pubkey) -> Option<&Party> {
    self.parties.iter().find(|p| p.signature_key == *key)
  }

  pub fn parties(&self) -> &[Party] {
    &self.parties
  }

  pub fn len(&self) -> usize {
    self.parties.len()
  }

  pub fn is_empty(&self) -> bool {
    self.parties.is_empty()
  }

  pub fn total_weight(&self) -> u64 {
    self.total_weight
  }

  pub fn corrupt_weight(&self) -> u64 {
    self.corrupt_weight
  }

  /// Weight needed for protocol progress: everything the corrupt
  /// parties cannot withhold.
  pub fn quorum_weight(&self) -> u64 {
    self.total_weight - self.corrupt_weight
  }

  pub fn weight_of<'a>(
    &self,
    indices: impl IntoIterator<Item = &'a PartyIndex>,
  ) -> u64 {
    indices
      .into_iter()
      .filter_map(|index| self.party(*index))
      .map(|party| party.weight)
      .sum()
  }

  /// BLS keys of the listed parties, or None when any index is
  /// outside the committee.
  pub fn bls_keys_of(
    &self,
    indices: &[PartyIndex],
  ) -> Option<Vec<BlsPublicKey>> {
    indices
      .iter()
      .map(|index| self.party(*index).map(|p| p.bls_key))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::FinalizationCommittee,
    crate::{
      crypto::{BlsSecretKey, Keypair, VrfKeypair},
      params::VoterInfo,
    },
  };

  fn committee(weights: &[u64]) -> FinalizationCommittee {
    let voters: Vec<VoterInfo> = weights
      .iter()
      .enumerate()
      .map(|(i, power)| {
        let keypair: Keypair =
          [i as u8 + 1; 32].as_slice().try_into().unwrap();
        VoterInfo {
          signature_key: keypair.public(),
          election_key: VrfKeypair::from_seed(&[i as u8 + 1; 32]).public(),
          bls_key: BlsSecretKey::from_seed(&[i as u8 + 1; 32]).public(),
          power: *power,
        }
      })
      .collect();
    FinalizationCommittee::new(&voters)
  }

  #[test]
  fn corrupt_weight_is_a_third_rounded_down() {
    let c = committee(&[1, 1, 1, 1]);
    assert_eq!(c.total_weight(), 4);
    assert_eq!(c.corrupt_weight(), 1);
    assert_eq!(c.quorum_weight(), 3);

    let c = committee(&[10, 10, 10]);
    assert_eq!(c.corrupt_weight(), 9);
  }

  #[test]
  fn weight_lookup_ignores_unknown_parties() {
    let c = committee(&[2, 3, 5]);
    assert_eq!(c.weight_of([0, 2, 9].iter()), 7);
    assert!(c.bls_keys_of(&[0, 9]).is_none());
    assert_eq!(c.bls_keys_of(&[0, 1, 2]).unwrap().len(), 3);
  }
}
