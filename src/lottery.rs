//! The per-slot leader lottery.
//!
//! A baker wins a slot when the VRF output over the leadership
//! nonce and slot number, mapped into [0, 1), falls below the
//! election probability for its share of the lottery stake. The
//! same VRF key also produces the block nonce, which feeds the
//! chain's future leadership entropy.

use crate::{
  crypto::{HashValue, VrfKeypair, VrfProof, VrfPublicKey},
  params::Slot,
};

fn leadership_message(nonce: &HashValue, slot: Slot) -> Vec<u8> {
  let mut message = Vec::with_capacity(42);
  message.extend_from_slice(b"LE");
  message.extend_from_slice(nonce);
  message.extend_from_slice(&slot.to_be_bytes());
  message
}

fn block_nonce_message(nonce: &HashValue, slot: Slot) -> Vec<u8> {
  let mut message = Vec::with_capacity(45);
  message.extend_from_slice(b"NONCE");
  message.extend_from_slice(nonce);
  message.extend_from_slice(&slot.to_be_bytes());
  message
}

/// Probability that a baker holding `lottery_power` of the stake
/// wins a slot: `1 - (1 - difficulty)^power`.
pub fn election_probability(difficulty: f64, lottery_power: f64) -> f64 {
  1.0 - (1.0 - difficulty).powf(lottery_power)
}

pub fn prove_leadership(
  key: &VrfKeypair,
  nonce: &HashValue,
  slot: Slot,
) -> VrfProof {
  key.prove(&leadership_message(nonce, slot))
}

pub fn verify_leadership(
  key: &VrfPublicKey,
  nonce: &HashValue,
  slot: Slot,
  proof: &VrfProof,
) -> bool {
  key.verify(&leadership_message(nonce, slot), proof)
}

/// Whether a (valid) leadership proof clears the lottery threshold.
pub fn proof_wins(proof: &VrfProof, difficulty: f64, lottery_power: f64) -> bool {
  proof.to_double() < election_probability(difficulty, lottery_power)
}

pub fn prove_block_nonce(
  key: &VrfKeypair,
  nonce: &HashValue,
  slot: Slot,
) -> VrfProof {
  key.prove(&block_nonce_message(nonce, slot))
}

pub fn verify_block_nonce(
  key: &VrfPublicKey,
  nonce: &HashValue,
  slot: Slot,
  proof: &VrfProof,
) -> bool {
  key.verify(&block_nonce_message(nonce, slot), proof)
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::crypto::{HashValue, VrfKeypair},
  };

  #[test]
  fn probability_shape() {
    assert_eq!(election_probability(0.5, 1.0), 0.5);
    assert!(election_probability(0.5, 0.25) < 0.5);
    assert!(election_probability(0.5, 0.25) > 0.0);
  }

  #[test]
  fn leadership_proofs_are_slot_bound() {
    let key = VrfKeypair::from_seed(&[7u8; 32]);
    let nonce = HashValue::digest(b"leadership");
    let proof = prove_leadership(&key, &nonce, 5);

    assert!(verify_leadership(&key.public(), &nonce, 5, &proof));
    assert!(!verify_leadership(&key.public(), &nonce, 6, &proof));
    assert!(!verify_leadership(
      &key.public(),
      &HashValue::digest(b"other"),
      5,
      &proof
    ));
  }

  #[test]
  fn full_power_with_certain_difficulty_always_wins() {
    let key = VrfKeypair::from_seed(&[8u8; 32]);
    let nonce = HashValue::digest(b"nonce");
    for slot in 1..16u64 {
      let proof = prove_leadership(&key, &nonce, slot);
      assert!(proof_wins(&proof, 1.0, 1.0));
    }
  }

  #[test]
  fn leadership_and_block_nonce_domains_differ() {
    let key = VrfKeypair::from_seed(&[9u8; 32]);
    let nonce = HashValue::digest(b"nonce");
    let leadership = prove_leadership(&key, &nonce, 3);
    assert!(!verify_block_nonce(&key.public(), &nonce, 3, &leadership));
  }
}
