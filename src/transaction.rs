use {
  crate::{
    crypto::{HashValue, Keypair, Pubkey, Signature, TransactionHash},
    serial::{
      read_u32,
      read_u64,
      write_u32,
      write_u64,
      WireDeserialize,
      WireError,
      WireSerialize,
      MAX_LIST_LENGTH,
    },
  },
  std::{
    fmt::{Debug, Display},
    io::{Read, Write},
  },
};

pub type Nonce = u64;

/// A signed transfer of execution payload from one sender account.
///
/// The consensus layer treats the payload as opaque; it only cares
/// about the sender, the per-sender nonce ordering, and the energy
/// the transaction may consume when scheduled.
#[derive(Clone, PartialEq, Eq)]
pub struct Transaction {
  pub sender: Pubkey,
  pub nonce: Nonce,

  /// Upper bound on the execution cost; blocks are filled against
  /// the sum of these.
  pub energy: u64,

  pub payload: Vec<u8>,

  /// Signature by the sender over all preceding fields.
  pub signature: Signature,
}

impl Transaction {
  pub fn new(
    keypair: &Keypair,
    nonce: Nonce,
    energy: u64,
    payload: Vec<u8>,
  ) -> Self {
    let mut unsigned = Self {
      sender: keypair.public(),
      nonce,
      energy,
      payload,
      signature: Signature::from_bytes(&[0u8; 64])
        .expect("the zero signature is structurally valid"),
    };
    unsigned.signature = keypair.sign(&unsigned.body_bytes());
    unsigned
  }

  fn serial_body<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    self.sender.serial(target)?;
    write_u64(target, self.nonce)?;
    write_u64(target, self.energy)?;
    write_u32(target, self.payload.len() as u32)?;
    target.write_all(&self.payload)
  }

  fn body_bytes(&self) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(self.payload.len() + 52);
    self
      .serial_body(&mut bytes)
      .expect("writing to a vec cannot fail");
    bytes
  }

  /// Identity of the transaction: the digest of everything the
  /// sender signed.
  pub fn hash(&self) -> TransactionHash {
    HashValue::digest(&self.body_bytes())
  }

  pub fn verify_signature(&self) -> bool {
    self.sender.verify(&self.body_bytes(), &self.signature)
  }

  /// Serialized length in bytes, as counted against the block-size
  /// cap.
  pub fn size(&self) -> u64 {
    self.to_bytes().len() as u64
  }
}

impl WireSerialize for Transaction {
  fn serial<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    self.serial_body(target)?;
    self.signature.serial(target)
  }
}

impl WireDeserialize for Transaction {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    let sender = Pubkey::deserial(source)?;
    let nonce = read_u64(source)?;
    let energy = read_u64(source)?;
    let len = read_u32(source)? as u64;
    if len > MAX_LIST_LENGTH {
      return Err(WireError::OversizedList(len));
    }
    let mut payload = vec![0u8; len as usize];
    source.read_exact(&mut payload)?;
    let signature = Signature::deserial(source)?;
    Ok(Self {
      sender,
      nonce,
      energy,
      payload,
      signature,
    })
  }
}

impl Display for Transaction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "tx {} nonce {}", self.hash(), self.nonce)
  }
}

impl Debug for Transaction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Transaction")
      .field("hash", &self.hash())
      .field("sender", &self.sender)
      .field("nonce", &self.nonce)
      .field("energy", &self.energy)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::Transaction,
    crate::{
      crypto::Keypair,
      serial::{WireDeserialize, WireSerialize},
    },
  };

  fn keypair() -> Keypair {
    [11u8; 32].as_slice().try_into().unwrap()
  }

  #[test]
  fn wire_roundtrip_is_identity() {
    let tx = Transaction::new(&keypair(), 3, 500, b"payload".to_vec());
    let bytes = tx.to_bytes();
    let restored = Transaction::from_bytes(&bytes).unwrap();
    assert_eq!(restored, tx);
    assert_eq!(restored.to_bytes(), bytes);
    assert_eq!(restored.hash(), tx.hash());
  }

  #[test]
  fn signature_covers_the_body() {
    let mut tx = Transaction::new(&keypair(), 3, 500, b"payload".to_vec());
    assert!(tx.verify_signature());

    tx.nonce = 4;
    assert!(!tx.verify_signature());
  }

  #[test]
  fn hash_ignores_signature_bytes() {
    let a = Transaction::new(&keypair(), 1, 10, b"same".to_vec());
    let mut b = a.clone();
    b.signature = keypair().sign(b"unrelated");
    assert_eq!(a.hash(), b.hash());
  }
}
