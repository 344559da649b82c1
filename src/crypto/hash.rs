use {
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  sha2::{Digest, Sha256},
  std::{
    fmt::{Debug, Display, Formatter},
    ops::Deref,
    str::FromStr,
  },
};

pub const HASH_LENGTH: usize = 32;

/// A 32-byte SHA-256 digest.
///
/// This is the identity of every object in the system: blocks,
/// transactions and finalization sessions are all referred to by
/// the hash of their canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HashValue([u8; HASH_LENGTH]);

/// Hash of a block's canonical encoding up to its signature.
pub type BlockHash = HashValue;

/// Hash of a transaction's canonical encoding up to its signature.
pub type TransactionHash = HashValue;

impl HashValue {
  pub fn digest(bytes: &[u8]) -> Self {
    let mut sha256 = Sha256::new();
    sha256.update(bytes);
    Self(sha256.finalize().into())
  }

  pub fn to_bytes(self) -> [u8; HASH_LENGTH] {
    self.0
  }
}

/// Incrementally hashes a byte stream without buffering it whole.
///
/// Used when the hashed prefix of an encoding is also the message
/// being signed, so both are produced in one pass.
#[derive(Default)]
pub struct IncrementalHasher(Sha256);

impl IncrementalHasher {
  pub fn update(&mut self, bytes: &[u8]) {
    self.0.update(bytes);
  }

  pub fn finalize(self) -> HashValue {
    HashValue(self.0.finalize().into())
  }
}

impl Deref for HashValue {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl From<[u8; HASH_LENGTH]> for HashValue {
  fn from(bytes: [u8; HASH_LENGTH]) -> Self {
    Self(bytes)
  }
}

impl Display for HashValue {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(self.0).into_string())
  }
}

impl Debug for HashValue {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "HashValue({})", bs58::encode(self.0).into_string())
  }
}

impl FromStr for HashValue {
  type Err = bs58::decode::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut bytes = [0u8; HASH_LENGTH];
    bs58::decode(s).into(&mut bytes)?;
    Ok(Self(bytes))
  }
}

impl Serialize for HashValue {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(&bs58::encode(self.0).into_string())
  }
}

impl<'de> Deserialize<'de> for HashValue {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(|e| de::Error::custom(format!("{e:?}")))
  }
}

#[cfg(test)]
mod tests {
  use super::HashValue;

  #[test]
  fn digest_is_stable() {
    let a = HashValue::digest(b"genesis");
    let b = HashValue::digest(b"genesis");
    let c = HashValue::digest(b"not genesis");
    assert_eq!(a, b);
    assert_ne!(a, c);
  }

  #[test]
  fn b58_roundtrip() {
    let h = HashValue::digest(b"roundtrip");
    let s = h.to_string();
    assert_eq!(s.parse::<HashValue>().unwrap(), h);
  }

  #[test]
  fn ordering_is_bytewise() {
    let lo = HashValue::from([0u8; 32]);
    let hi = HashValue::from([0xffu8; 32]);
    assert!(lo < hi);
  }
}
