use {
  crate::{
    crypto::{BlockHash, HashValue, Keypair, Pubkey, Signature, VrfProof},
    params::{BakerId, BirkParameters, BlockHeight, GenesisData, Slot},
    scheduler::StateHandle,
    serial::{
      read_list,
      read_u64,
      write_list,
      write_u64,
      WireDeserialize,
      WireError,
      WireSerialize,
    },
    transaction::Transaction,
  },
  chrono::{DateTime, Utc},
  std::{
    cmp::Ordering,
    fmt::{Debug, Display},
    io::{Read, Write},
    sync::Arc,
  },
};

/// A block as it travels on the wire.
///
/// Slot 0 is the genesis block and carries the chain parameters;
/// every other slot carries a baker-produced block. The block's
/// identity is the SHA-256 digest of its canonical encoding up to
/// (but not including) the baker signature, which is also exactly
/// the byte string the signature covers.
#[derive(Clone, PartialEq)]
pub struct Block {
  pub slot: Slot,
  pub data: BlockData,
}

#[derive(Clone, PartialEq)]
pub enum BlockData {
  Genesis(GenesisData),
  Baked(BakedBlock),
}

#[derive(Clone, PartialEq, Eq)]
pub struct BakedBlock {
  pub parent: BlockHash,
  pub baker: BakerId,

  /// Proof that the baker won the slot lottery.
  pub election_proof: VrfProof,

  /// Entropy contribution folded into future leadership nonces.
  pub block_nonce: VrfProof,

  pub last_finalized: BlockHash,
  pub transactions: Vec<Transaction>,
  pub signature: Signature,
}

impl Block {
  pub fn genesis(data: GenesisData) -> Self {
    Self {
      slot: 0,
      data: BlockData::Genesis(data),
    }
  }

  #[allow(clippy::too_many_arguments)]
  pub fn bake(
    keypair: &Keypair,
    slot: Slot,
    parent: BlockHash,
    baker: BakerId,
    election_proof: VrfProof,
    block_nonce: VrfProof,
    last_finalized: BlockHash,
    transactions: Vec<Transaction>,
  ) -> Self {
    let mut block = Self {
      slot,
      data: BlockData::Baked(BakedBlock {
        parent,
        baker,
        election_proof,
        block_nonce,
        last_finalized,
        transactions,
        signature: Signature::from_bytes(&[0u8; 64])
          .expect("the zero signature is structurally valid"),
      }),
    };
    let signature = keypair.sign(&block.signable_bytes());
    if let BlockData::Baked(ref mut baked) = block.data {
      baked.signature = signature;
    }
    block
  }

  fn serial_signable<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    write_u64(target, self.slot)?;
    match &self.data {
      BlockData::Genesis(data) => data.serial(target),
      BlockData::Baked(baked) => {
        baked.parent.serial(target)?;
        write_u64(target, baked.baker)?;
        baked.election_proof.serial(target)?;
        baked.block_nonce.serial(target)?;
        baked.last_finalized.serial(target)?;
        write_list(target, &baked.transactions)
      }
    }
  }

  pub fn signable_bytes(&self) -> Vec<u8> {
    let mut bytes = Vec::new();
    self
      .serial_signable(&mut bytes)
      .expect("writing to a vec cannot fail");
    bytes
  }

  pub fn hash(&self) -> BlockHash {
    HashValue::digest(&self.signable_bytes())
  }

  pub fn verify_signature(&self, key: &Pubkey) -> bool {
    match &self.data {
      // genesis is unsigned; its authority is out-of-band
      BlockData::Genesis(_) => true,
      BlockData::Baked(baked) => {
        key.verify(&self.signable_bytes(), &baked.signature)
      }
    }
  }

  pub fn is_genesis(&self) -> bool {
    matches!(self.data, BlockData::Genesis(_))
  }

  pub fn baked(&self) -> Option<&BakedBlock> {
    match &self.data {
      BlockData::Genesis(_) => None,
      BlockData::Baked(baked) => Some(baked),
    }
  }

  pub fn transactions(&self) -> &[Transaction] {
    match &self.data {
      BlockData::Genesis(_) => &[],
      BlockData::Baked(baked) => &baked.transactions,
    }
  }
}

impl WireSerialize for Block {
  fn serial<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    eprintln!("MARK BLK-1 before serial_signable");
    self.serial_signable(target)?;
    eprintln!("MARK BLK-2 after serial_signable");
    if let BlockData::Baked(baked) = &self.data {
      eprintln!("MARK BLK-3 before signature.serial");
      baked.signature.serial(target)?;
      eprintln!("MARK BLK-4 after signature.serial");
    }
    Ok(())
  }
}

impl WireDeserialize for Block {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    let slot = read_u64(source)?;
    if slot == 0 {
      let data = GenesisData::deserial(source)?;
      return Ok(Self {
        slot,
        data: BlockData::Genesis(data),
      });
    }
    let parent = BlockHash::deserial(source)?;
    let baker = read_u64(source)?;
    let election_proof = VrfProof::deserial(source)?;
    let block_nonce = VrfProof::deserial(source)?;
    let last_finalized = BlockHash::deserial(source)?;
    let transactions = read_list(source)?;
    let signature = Signature::deserial(source)?;
    Ok(Self {
      slot,
      data: BlockData::Baked(BakedBlock {
        parent,
        baker,
        election_proof,
        block_nonce,
        last_finalized,
        transactions,
        signature,
      }),
    })
  }
}

impl Display for Block {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.data {
      BlockData::Genesis(_) => write!(f, "genesis {}", self.hash()),
      BlockData::Baked(baked) => {
        write!(f, "block {} by baker {}", self.hash(), baked.baker)
      }
    }
  }
}

impl Debug for Block {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{self}")
  }
}

/// A deserialized, signature-unverified block waiting in the block
/// table, either because its parent has not arrived yet or because
/// it is queued for validation.
#[derive(Clone)]
pub struct PendingBlock {
  pub hash: BlockHash,
  pub block: Arc<Block>,
  pub received: DateTime<Utc>,
}

impl PendingBlock {
  /// Genesis never goes through the pending path.
  pub fn new(block: Block, received: DateTime<Utc>) -> Option<Self> {
    eprintln!("MARK PB-1 enter new");
    if block.is_genesis() {
      return None;
    }
    eprintln!("MARK PB-2 before hash()");
    let hash = block.hash();
    eprintln!("MARK PB-3 after hash()");
    Some(Self {
      hash,
      block: Arc::new(block),
      received,
    })
  }

  pub fn slot(&self) -> Slot {
    self.block.slot
  }

  pub fn parent(&self) -> BlockHash {
    self
      .block
      .baked()
      .expect("pending blocks are never genesis")
      .parent
  }
}

impl PartialEq for PendingBlock {
  fn eq(&self, other: &Self) -> bool {
    self.hash == other.hash
  }
}

impl Eq for PendingBlock {}

impl std::hash::Hash for PendingBlock {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.hash.hash(state)
  }
}

impl Debug for PendingBlock {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "pending {} at slot {}", self.hash, self.slot())
  }
}

/// An alive-or-finalized block enriched with its chain position and
/// post-execution state.
///
/// Block pointers are owned exclusively by the tree state; every
/// other component refers to blocks by hash. The genesis pointer's
/// parent and last-finalized fields reference itself.
pub struct BlockPtr {
  pub hash: BlockHash,
  pub block: Arc<Block>,
  pub parent: BlockHash,
  pub last_finalized: BlockHash,
  pub height: BlockHeight,

  /// Election parameters in force for children of this block.
  pub birk: Arc<BirkParameters>,

  pub state: StateHandle,
  pub receive_time: DateTime<Utc>,
  pub arrive_time: DateTime<Utc>,

  pub transaction_count: u64,
  pub transaction_energy: u64,
  pub transaction_size: u64,
}

impl BlockPtr {
  pub fn genesis(data: &GenesisData, state: StateHandle) -> Self {
    let block = Block::genesis(data.clone());
    let hash = block.hash();
    let genesis_time = data.genesis_time();
    Self {
      hash,
      block: Arc::new(block),
      parent: hash,
      last_finalized: hash,
      height: 0,
      birk: Arc::new(data.birk_parameters.clone()),
      state,
      receive_time: genesis_time,
      arrive_time: genesis_time,
      transaction_count: 0,
      transaction_energy: 0,
      transaction_size: 0,
    }
  }

  pub fn for_baked(
    pending: &PendingBlock,
    parent: &BlockPtr,
    birk: Arc<BirkParameters>,
    state: StateHandle,
    arrive_time: DateTime<Utc>,
  ) -> Self {
    let baked = pending
      .block
      .baked()
      .expect("pending blocks are never genesis");
    let transactions = &baked.transactions;
    Self {
      hash: pending.hash,
      block: Arc::clone(&pending.block),
      parent: baked.parent,
      last_finalized: baked.last_finalized,
      height: parent.height + 1,
      birk,
      state,
      receive_time: pending.received,
      arrive_time,
      transaction_count: transactions.len() as u64,
      transaction_energy: transactions.iter().map(|tx| tx.energy).sum(),
      transaction_size: transactions.iter().map(|tx| tx.size()).sum(),
    }
  }

  pub fn slot(&self) -> Slot {
    self.block.slot
  }
}

impl PartialEq for BlockPtr {
  fn eq(&self, other: &Self) -> bool {
    self.hash == other.hash
  }
}

impl Eq for BlockPtr {}

impl PartialOrd for BlockPtr {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for BlockPtr {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .height
      .cmp(&other.height)
      .then_with(|| self.hash.cmp(&other.hash))
  }
}

impl Display for BlockPtr {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} at height {}", self.hash, self.height)
  }
}

impl Debug for BlockPtr {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{self}")
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{Block, PendingBlock},
    crate::{
      crypto::{HashValue, Keypair, VrfKeypair},
      params::{
        BakerInfo,
        BirkParameters,
        FinalizationParameters,
        GenesisData,
      },
      serial::{WireDeserialize, WireSerialize},
      transaction::Transaction,
    },
    chrono::Utc,
  };

  fn keypair() -> Keypair {
    [21u8; 32].as_slice().try_into().unwrap()
  }

  fn genesis_data() -> GenesisData {
    let election_key = VrfKeypair::from_seed(&[1u8; 32]).public();
    GenesisData {
      timestamp: 1_600_000_000_000,
      slot_duration_millis: 1000,
      epoch_length: 100,
      birk_parameters: BirkParameters::genesis(
        0.5,
        HashValue::digest(b"lead"),
        vec![BakerInfo {
          id: 0,
          signature_key: keypair().public(),
          election_key,
          stake: 100,
        }],
      ),
      finalization_parameters: FinalizationParameters {
        committee: vec![],
        minimum_skip: 1,
      },
      max_block_size: 1 << 20,
      max_block_energy: 1 << 20,
    }
  }

  fn baked_block(slot: u64, parent: crate::crypto::BlockHash) -> Block {
    let vrf = VrfKeypair::from_seed(&[2u8; 32]);
    Block::bake(
      &keypair(),
      slot,
      parent,
      0,
      vrf.prove(b"election"),
      vrf.prove(b"nonce"),
      parent,
      vec![Transaction::new(&keypair(), 0, 10, b"t".to_vec())],
    )
  }

  #[test]
  fn baked_block_roundtrip_is_identity() {
    let genesis = Block::genesis(genesis_data());
    let block = baked_block(1, genesis.hash());

    let bytes = block.to_bytes();
    let restored = Block::from_bytes(&bytes).unwrap();
    assert_eq!(restored, block);
    assert_eq!(restored.to_bytes(), bytes);
    assert_eq!(restored.hash(), block.hash());
  }

  #[test]
  fn genesis_roundtrip_is_identity() {
    let genesis = Block::genesis(genesis_data());
    let restored = Block::from_bytes(&genesis.to_bytes()).unwrap();
    assert_eq!(restored.hash(), genesis.hash());
    assert!(restored.is_genesis());
  }

  #[test]
  fn signature_is_checked_against_the_body() {
    let genesis = Block::genesis(genesis_data());
    let mut block = baked_block(1, genesis.hash());
    assert!(block.verify_signature(&keypair().public()));

    if let super::BlockData::Baked(ref mut baked) = block.data {
      baked.baker = 9;
    }
    assert!(!block.verify_signature(&keypair().public()));
  }

  #[test]
  fn hash_excludes_the_signature() {
    let genesis = Block::genesis(genesis_data());
    let mut block = baked_block(1, genesis.hash());
    let original = block.hash();

    if let super::BlockData::Baked(ref mut baked) = block.data {
      baked.signature = keypair().sign(b"unrelated");
    }
    assert_eq!(block.hash(), original);
  }

  #[test]
  fn genesis_never_becomes_pending() {
    let genesis = Block::genesis(genesis_data());
    assert!(PendingBlock::new(genesis, Utc::now()).is_none());
  }
}
