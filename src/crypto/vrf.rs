use {
  super::hash::HashValue,
  schnorrkel::{
    signing_context,
    vrf::{VRFPreOut, VRFProof},
    ExpansionMode,
    MiniSecretKey,
    PublicKey,
  },
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  std::fmt::{Debug, Display},
  thiserror::Error,
};

/// Wire length of a VRF proof: 32-byte pre-output point followed
/// by the 64-byte proof scalars.
pub const VRF_PROOF_LENGTH: usize = 96;

pub const VRF_PUBKEY_LENGTH: usize = 32;

/// All VRF transcripts in this chain are domain-separated with
/// this context so proofs cannot be replayed from other protocols.
const VRF_CONTEXT: &[u8] = b"skov-vrf";

#[derive(Debug, Error)]
pub enum VrfError {
  #[error("malformed VRF proof bytes")]
  MalformedProof,

  #[error("malformed VRF public key bytes")]
  MalformedKey,
}

/// A VRF keypair held by a baker.
///
/// Bakers use it twice per slot: once for the leader-election
/// proof and once for the block nonce that seeds future leadership
/// entropy.
pub struct VrfKeypair(schnorrkel::Keypair);

impl VrfKeypair {
  pub fn from_seed(seed: &[u8; 32]) -> Self {
    let secret = MiniSecretKey::from_bytes(seed)
      .expect("a 32-byte seed is always a valid mini secret key");
    Self(secret.expand_to_keypair(ExpansionMode::Ed25519))
  }

  pub fn public(&self) -> VrfPublicKey {
    VrfPublicKey(self.0.public)
  }

  pub fn prove(&self, message: &[u8]) -> VrfProof {
    let transcript = signing_context(VRF_CONTEXT).bytes(message);
    let (inout, proof, _) = self.0.vrf_sign(transcript);
    VrfProof {
      preout: inout.to_preout(),
      proof,
    }
  }
}

impl Clone for VrfKeypair {
  fn clone(&self) -> Self {
    Self(
      schnorrkel::Keypair::from_bytes(&self.0.to_bytes())
        .expect("serialized keypair bytes are valid"),
    )
  }
}

impl Debug for VrfKeypair {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("VrfKeypair").field(&self.public()).finish()
  }
}

#[derive(Clone, Copy)]
pub struct VrfPublicKey(PublicKey);

impl VrfPublicKey {
  pub fn verify(&self, message: &[u8], proof: &VrfProof) -> bool {
    let transcript = signing_context(VRF_CONTEXT).bytes(message);
    self
      .0
      .vrf_verify(transcript, &proof.preout, &proof.proof)
      .is_ok()
  }

  pub fn to_bytes(&self) -> [u8; VRF_PUBKEY_LENGTH] {
    self.0.to_bytes()
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self, VrfError> {
    PublicKey::from_bytes(bytes)
      .map(Self)
      .map_err(|_| VrfError::MalformedKey)
  }
}

impl PartialEq for VrfPublicKey {
  fn eq(&self, other: &Self) -> bool {
    self.to_bytes() == other.to_bytes()
  }
}

impl Eq for VrfPublicKey {}

impl Display for VrfPublicKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(self.to_bytes()).into_string())
  }
}

impl Debug for VrfPublicKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "VrfPublicKey({})",
      bs58::encode(self.to_bytes()).into_string()
    )
  }
}

impl Serialize for VrfPublicKey {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(&bs58::encode(self.to_bytes()).into_string())
  }
}

impl<'de> Deserialize<'de> for VrfPublicKey {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let s = String::deserialize(deserializer)?;
    let mut bytes = [0u8; VRF_PUBKEY_LENGTH];
    bs58::decode(&s)
      .into(&mut bytes)
      .map_err(|e| de::Error::custom(format!("{e:?}")))?;
    Self::from_bytes(&bytes).map_err(|e| de::Error::custom(format!("{e:?}")))
  }
}

/// A VRF proof over some message, carrying the pre-output point
/// the proof commits to.
#[derive(Clone)]
pub struct VrfProof {
  preout: VRFPreOut,
  proof: VRFProof,
}

impl VrfProof {
  pub fn to_bytes(&self) -> [u8; VRF_PROOF_LENGTH] {
    let mut bytes = [0u8; VRF_PROOF_LENGTH];
    bytes[..32].copy_from_slice(&self.preout.to_bytes());
    bytes[32..].copy_from_slice(&self.proof.to_bytes());
    bytes
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self, VrfError> {
    if bytes.len() != VRF_PROOF_LENGTH {
      return Err(VrfError::MalformedProof);
    }
    let preout =
      VRFPreOut::from_bytes(&bytes[..32]).map_err(|_| VrfError::MalformedProof)?;
    let proof =
      VRFProof::from_bytes(&bytes[32..]).map_err(|_| VrfError::MalformedProof)?;
    Ok(Self { preout, proof })
  }

  /// Hash of the VRF pre-output, used wherever the proof acts as a
  /// source of entropy (leadership nonces, coin tickets).
  pub fn output_hash(&self) -> HashValue {
    HashValue::digest(&self.preout.to_bytes())
  }

  /// Maps the proof output uniformly into [0, 1).
  ///
  /// The leader lottery wins when this value falls under the
  /// election-probability threshold for the baker's lottery power.
  pub fn to_double(&self) -> f64 {
    let digest = self.output_hash();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(word) as f64 / (u64::MAX as f64 + 1.0)
  }
}

impl PartialEq for VrfProof {
  fn eq(&self, other: &Self) -> bool {
    self.to_bytes() == other.to_bytes()
  }
}

impl Eq for VrfProof {}

impl Debug for VrfProof {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "VrfProof({})",
      bs58::encode(self.preout.to_bytes()).into_string()
    )
  }
}

#[cfg(test)]
mod tests {
  use super::{VrfKeypair, VrfProof};

  #[test]
  fn prove_verify_roundtrip() {
    let keypair = VrfKeypair::from_seed(&[3u8; 32]);
    let proof = keypair.prove(b"LE:slot 7");
    assert!(keypair.public().verify(b"LE:slot 7", &proof));
    assert!(!keypair.public().verify(b"LE:slot 8", &proof));

    let other = VrfKeypair::from_seed(&[4u8; 32]);
    assert!(!other.public().verify(b"LE:slot 7", &proof));
  }

  #[test]
  fn proof_bytes_roundtrip() {
    let keypair = VrfKeypair::from_seed(&[5u8; 32]);
    let proof = keypair.prove(b"nonce");
    let restored = VrfProof::from_bytes(&proof.to_bytes()).unwrap();
    assert_eq!(restored, proof);
    assert!(keypair.public().verify(b"nonce", &restored));
  }

  #[test]
  fn to_double_is_in_unit_interval() {
    let keypair = VrfKeypair::from_seed(&[6u8; 32]);
    for slot in 0u64..32 {
      let proof = keypair.prove(&slot.to_be_bytes());
      let x = proof.to_double();
      assert!((0.0..1.0).contains(&x));
    }
  }
}
