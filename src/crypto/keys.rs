use {
  ed25519_dalek::{PublicKey, SecretKey, Signer, Verifier},
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  std::{
    fmt::{Debug, Display},
    ops::Deref,
    str::FromStr,
  },
  thiserror::Error,
};

pub use ed25519_dalek::{Signature, SIGNATURE_LENGTH};

pub const PUBKEY_LENGTH: usize = 32;

/// Public identity of a baker or finalization-committee member.
///
/// Block and finalization-message signatures are verified against
/// this key. The base58 form is used everywhere a key is displayed
/// or configured.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey([u8; PUBKEY_LENGTH]);

impl Pubkey {
  pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
    match PublicKey::from_bytes(&self.0) {
      Ok(key) => key.verify(message, signature).is_ok(),
      Err(_) => false,
    }
  }

  pub fn to_bytes(self) -> [u8; PUBKEY_LENGTH] {
    self.0
  }
}

impl Deref for Pubkey {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl From<[u8; PUBKEY_LENGTH]> for Pubkey {
  fn from(bytes: [u8; PUBKEY_LENGTH]) -> Self {
    Self(bytes)
  }
}

impl From<PublicKey> for Pubkey {
  fn from(p: PublicKey) -> Self {
    Self(*p.as_bytes())
  }
}

impl Display for Pubkey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(self.0).into_string())
  }
}

impl Debug for Pubkey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Pubkey({})", bs58::encode(self.0).into_string())
  }
}

impl FromStr for Pubkey {
  type Err = bs58::decode::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut bytes = [0u8; PUBKEY_LENGTH];
    bs58::decode(s).into(&mut bytes)?;
    Ok(Self(bytes))
  }
}

impl Serialize for Pubkey {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(&bs58::encode(self.0).into_string())
  }
}

impl<'de> Deserialize<'de> for Pubkey {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(|e| de::Error::custom(format!("{e:?}")))
  }
}

#[derive(Debug, Error)]
pub enum KeypairError {
  #[error("failed parsing base58 string: {0:?}")]
  Base58ParseError(bs58::decode::Error),

  #[error("{0}")]
  Ed25519Error(#[from] ed25519_dalek::ed25519::Error),
}

/// An ed25519 signing keypair.
pub struct Keypair(ed25519_dalek::Keypair);

impl Keypair {
  pub fn public(&self) -> Pubkey {
    self.0.public.into()
  }

  pub fn sign(&self, message: &[u8]) -> Signature {
    self.0.sign(message)
  }
}

impl Clone for Keypair {
  fn clone(&self) -> Self {
    Self(ed25519_dalek::Keypair::from_bytes(&self.0.to_bytes()).unwrap())
  }
}

impl Debug for Keypair {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Keypair").field(&self.0.public).finish()
  }
}

impl Display for Keypair {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "Keypair({})",
      bs58::encode(self.0.public.as_bytes()).into_string()
    )
  }
}

impl TryFrom<&[u8]> for Keypair {
  type Error = KeypairError;

  fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
    let secret = SecretKey::from_bytes(value)?;
    let public: PublicKey = (&secret).into();
    Ok(Self(ed25519_dalek::Keypair { secret, public }))
  }
}

impl FromStr for Keypair {
  type Err = KeypairError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    let mut secret = [0u8; 32];
    bs58::decode(value)
      .into(&mut secret)
      .map_err(KeypairError::Base58ParseError)?;
    let secret = SecretKey::from_bytes(&secret)?;
    let public = (&secret).into();
    Ok(Keypair(ed25519_dalek::Keypair { secret, public }))
  }
}

#[cfg(test)]
mod tests {
  use super::Keypair;

  #[test]
  fn sign_verify_roundtrip() {
    let keypair: Keypair = [7u8; 32].as_slice().try_into().unwrap();
    let signature = keypair.sign(b"baked block body");
    assert!(keypair.public().verify(b"baked block body", &signature));
    assert!(!keypair.public().verify(b"another body", &signature));
  }

  #[test]
  fn pubkey_b58_roundtrip() {
    let keypair: Keypair = [9u8; 32].as_slice().try_into().unwrap();
    let b58 = keypair.public().to_string();
    assert_eq!(b58.parse::<super::Pubkey>().unwrap(), keypair.public());
  }
}
