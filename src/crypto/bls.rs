use {
  blst::min_sig::{AggregateSignature, PublicKey, SecretKey, Signature},
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  std::fmt::{Debug, Display},
  thiserror::Error,
};

/// The `min_sig` parameterization keeps signatures at 48 bytes,
/// which is what finalization records embed; public keys are the
/// larger 96-byte G2 points and only live in committee state.
pub const BLS_SIGNATURE_LENGTH: usize = 48;

pub const BLS_PUBKEY_LENGTH: usize = 96;

const DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";

#[derive(Debug, Error)]
pub enum BlsError {
  #[error("malformed BLS signature bytes")]
  MalformedSignature,

  #[error("malformed BLS public key bytes")]
  MalformedKey,

  #[error("cannot aggregate an empty signature set")]
  EmptyAggregation,
}

/// Secret aggregation key of a finalization-committee member.
pub struct BlsSecretKey(SecretKey);

impl BlsSecretKey {
  pub fn from_seed(seed: &[u8; 32]) -> Self {
    Self(
      SecretKey::key_gen(seed, &[])
        .expect("a 32-byte seed satisfies the keygen entropy bound"),
    )
  }

  pub fn public(&self) -> BlsPublicKey {
    BlsPublicKey(self.0.sk_to_pk())
  }

  pub fn sign(&self, message: &[u8]) -> BlsSignature {
    BlsSignature(self.0.sign(message, DST, &[]))
  }
}

impl Debug for BlsSecretKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("BlsSecretKey").field(&self.public()).finish()
  }
}

#[derive(Clone, Copy)]
pub struct BlsPublicKey(PublicKey);

impl BlsPublicKey {
  pub fn to_bytes(&self) -> [u8; BLS_PUBKEY_LENGTH] {
    self.0.to_bytes()
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
    PublicKey::from_bytes(bytes)
      .map(Self)
      .map_err(|_| BlsError::MalformedKey)
  }
}

impl PartialEq for BlsPublicKey {
  fn eq(&self, other: &Self) -> bool {
    self.to_bytes() == other.to_bytes()
  }
}

impl Eq for BlsPublicKey {}

impl Display for BlsPublicKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(self.to_bytes()).into_string())
  }
}

impl Debug for BlsPublicKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "BlsPublicKey({})",
      bs58::encode(self.to_bytes()).into_string()
    )
  }
}

impl Serialize for BlsPublicKey {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(&bs58::encode(self.to_bytes()).into_string())
  }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let s = String::deserialize(deserializer)?;
    let mut bytes = [0u8; BLS_PUBKEY_LENGTH];
    bs58::decode(&s)
      .into(&mut bytes)
      .map_err(|e| de::Error::custom(format!("{e:?}")))?;
    Self::from_bytes(&bytes).map_err(|e| de::Error::custom(format!("{e:?}")))
  }
}

/// A single or aggregated BLS signature.
#[derive(Clone)]
pub struct BlsSignature(Signature);

impl BlsSignature {
  /// The identity element, used as the vacuous proof on the genesis
  /// finalization record. It never verifies against any key set.
  pub fn identity() -> Self {
    let mut bytes = [0u8; BLS_SIGNATURE_LENGTH];
    bytes[0] = 0xc0;
    Self(
      Signature::from_bytes(&bytes)
        .expect("the compressed identity point is a valid encoding"),
    )
  }

  pub fn to_bytes(&self) -> [u8; BLS_SIGNATURE_LENGTH] {
    self.0.to_bytes()
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
    Signature::from_bytes(bytes)
      .map(Self)
      .map_err(|_| BlsError::MalformedSignature)
  }

  pub fn verify(&self, message: &[u8], key: &BlsPublicKey) -> bool {
    self.0.verify(true, message, DST, &[], &key.0, true)
      == blst::BLST_ERROR::BLST_SUCCESS
  }

  /// Verifies an aggregate of signatures by the given keys over one
  /// common message. This is the shape every finalization proof has:
  /// all included parties sign the same witness statement.
  pub fn verify_aggregate(&self, message: &[u8], keys: &[BlsPublicKey]) -> bool {
    let keys: Vec<&PublicKey> = keys.iter().map(|k| &k.0).collect();
    if keys.is_empty() {
      return false;
    }
    self.0.fast_aggregate_verify(true, message, DST, &keys)
      == blst::BLST_ERROR::BLST_SUCCESS
  }
}

impl PartialEq for BlsSignature {
  fn eq(&self, other: &Self) -> bool {
    self.to_bytes() == other.to_bytes()
  }
}

impl Eq for BlsSignature {}

impl Debug for BlsSignature {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "BlsSignature({})",
      bs58::encode(self.to_bytes()).into_string()
    )
  }
}

/// Aggregates signatures over a common message into one signature.
pub fn aggregate<'a>(
  signatures: impl IntoIterator<Item = &'a BlsSignature>,
) -> Result<BlsSignature, BlsError> {
  let signatures: Vec<&Signature> =
    signatures.into_iter().map(|s| &s.0).collect();
  if signatures.is_empty() {
    return Err(BlsError::EmptyAggregation);
  }
  AggregateSignature::aggregate(&signatures, true)
    .map(|agg| BlsSignature(agg.to_signature()))
    .map_err(|_| BlsError::MalformedSignature)
}

#[cfg(test)]
mod tests {
  use super::{aggregate, BlsSecretKey, BlsSignature};

  #[test]
  fn single_sign_verify() {
    let key = BlsSecretKey::from_seed(&[1u8; 32]);
    let signature = key.sign(b"witness");
    assert!(signature.verify(b"witness", &key.public()));
    assert!(!signature.verify(b"forged", &key.public()));
  }

  #[test]
  fn aggregate_verifies_against_all_keys() {
    let keys: Vec<_> =
      (0u8..4).map(|i| BlsSecretKey::from_seed(&[i + 1; 32])).collect();
    let signatures: Vec<_> = keys.iter().map(|k| k.sign(b"decide")).collect();
    let agg = aggregate(signatures.iter()).unwrap();

    let pubkeys: Vec<_> = keys.iter().map(|k| k.public()).collect();
    assert!(agg.verify_aggregate(b"decide", &pubkeys));

    // dropping one signer invalidates the proof
    assert!(!agg.verify_aggregate(b"decide", &pubkeys[..3]));
  }

  #[test]
  fn signature_bytes_roundtrip() {
    let key = BlsSecretKey::from_seed(&[2u8; 32]);
    let signature = key.sign(b"roundtrip");
    let restored = BlsSignature::from_bytes(&signature.to_bytes()).unwrap();
    assert_eq!(restored, signature);
    assert!(restored.verify(b"roundtrip", &key.public()));
  }
}
