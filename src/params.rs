//! Chain parameters fixed at genesis plus the queue of pending
//! protocol updates.
//!
//! The genesis payload travels on the wire inside the genesis block
//! and is also what operators author as a JSON document, so every
//! struct here carries both the bit-exact codec and serde derives.

use {
  crate::{
    crypto::{BlsPublicKey, HashValue, Pubkey, VrfPublicKey},
    serial::{
      read_fixed,
      read_list,
      read_u64,
      write_list,
      write_u64,
      WireDeserialize,
      WireError,
      WireSerialize,
      MAX_LIST_LENGTH,
    },
  },
  chrono::{DateTime, TimeZone, Utc},
  serde::{Deserialize, Serialize},
  std::{
    io::{Read, Write},
    time::Duration,
  },
};

pub type Slot = u64;
pub type Epoch = u64;
pub type BlockHeight = u64;
pub type BakerId = u64;

/// Milliseconds since the unix epoch.
pub type Timestamp = u64;

pub fn timestamp_of(time: DateTime<Utc>) -> Timestamp {
  time.timestamp_millis().max(0) as Timestamp
}

/// A staked party entitled to propose blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BakerInfo {
  pub id: BakerId,

  /// Key the baker signs produced blocks with.
  pub signature_key: Pubkey,

  /// Key the baker's leadership and block-nonce proofs verify
  /// against.
  pub election_key: VrfPublicKey,

  pub stake: u64,
}

impl WireSerialize for BakerInfo {
  fn serial<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    write_u64(target, self.id)?;
    self.signature_key.serial(target)?;
    target.write_all(&self.election_key.to_bytes())?;
    write_u64(target, self.stake)
  }
}

impl WireDeserialize for BakerInfo {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    let id = read_u64(source)?;
    let signature_key = Pubkey::deserial(source)?;
    let election_key = VrfPublicKey::from_bytes(&read_fixed::<32, _>(source)?)
      .map_err(|_| WireError::Malformed("baker election key"))?;
    let stake = read_u64(source)?;
    Ok(Self {
      id,
      signature_key,
      election_key,
      stake,
    })
  }
}

/// The leader-election parameters a block is baked against.
///
/// Lottery eligibility for a slot is judged against the bakers as
/// they stood two epochs before the slot's epoch. The three fields
/// are that sliding window: `lottery_bakers` is the snapshot the
/// current epoch draws from, and on every epoch boundary the window
/// shifts by one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BirkParameters {
  pub election_difficulty: f64,

  /// Entropy all leadership VRFs for the epoch are bound to.
  pub leadership_nonce: HashValue,

  pub lottery_bakers: Vec<BakerInfo>,
  pub prev_epoch_bakers: Vec<BakerInfo>,
  pub current_bakers: Vec<BakerInfo>,
}

impl BirkParameters {
  /// Genesis starts with all three snapshots equal.
  pub fn genesis(
    election_difficulty: f64,
    leadership_nonce: HashValue,
    bakers: Vec<BakerInfo>,
  ) -> Self {
    Self {
      election_difficulty,
      leadership_nonce,
      lottery_bakers: bakers.clone(),
      prev_epoch_bakers: bakers.clone(),
      current_bakers: bakers,
    }
  }

  pub fn lottery_baker(&self, id: BakerId) -> Option<&BakerInfo> {
    self.lottery_bakers.iter().find(|b| b.id == id)
  }

  pub fn total_lottery_stake(&self) -> u64 {
    self.lottery_bakers.iter().map(|b| b.stake).sum()
  }

  /// The baker's share of the lottery stake, used as the exponent
  /// in the election-probability formula.
  pub fn lottery_power(&self, id: BakerId) -> Option<f64> {
    let baker = self.lottery_baker(id)?;
    let total = self.total_lottery_stake();
    if total == 0 {
      return None;
    }
    Some(baker.stake as f64 / total as f64)
  }

  /// Shifts the two-epoch snapshot window at an epoch boundary.
  pub fn rotate_epoch(&self) -> Self {
    Self {
      election_difficulty: self.election_difficulty,
      leadership_nonce: self.leadership_nonce,
      lottery_bakers: self.prev_epoch_bakers.clone(),
      prev_epoch_bakers: self.current_bakers.clone(),
      current_bakers: self.current_bakers.clone(),
    }
  }
}

impl WireSerialize for BirkParameters {
  fn serial<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    write_u64(target, self.election_difficulty.to_bits())?;
    self.leadership_nonce.serial(target)?;
    write_list(target, &self.lottery_bakers)?;
    write_list(target, &self.prev_epoch_bakers)?;
    write_list(target, &self.current_bakers)
  }
}

impl WireDeserialize for BirkParameters {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    let election_difficulty = f64::from_bits(read_u64(source)?);
    if !(0.0..1.0).contains(&election_difficulty) {
      return Err(WireError::Malformed("election difficulty"));
    }
    Ok(Self {
      election_difficulty,
      leadership_nonce: HashValue::deserial(source)?,
      lottery_bakers: read_list(source)?,
      prev_epoch_bakers: read_list(source)?,
      current_bakers: read_list(source)?,
    })
  }
}

/// A member of the finalization committee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoterInfo {
  pub signature_key: Pubkey,
  pub election_key: VrfPublicKey,
  pub bls_key: BlsPublicKey,

  /// Stake-derived integer weight used for every quorum and
  /// corruption threshold.
  pub power: u64,
}

impl WireSerialize for VoterInfo {
  fn serial<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    self.signature_key.serial(target)?;
    target.write_all(&self.election_key.to_bytes())?;
    target.write_all(&self.bls_key.to_bytes())?;
    write_u64(target, self.power)
  }
}

impl WireDeserialize for VoterInfo {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    let signature_key = Pubkey::deserial(source)?;
    let election_key = VrfPublicKey::from_bytes(&read_fixed::<32, _>(source)?)
      .map_err(|_| WireError::Malformed("voter election key"))?;
    let bls_key = BlsPublicKey::from_bytes(&read_fixed::<96, _>(source)?)
      .map_err(|_| WireError::Malformed("voter BLS key"))?;
    let power = read_u64(source)?;
    Ok(Self {
      signature_key,
      election_key,
      bls_key,
      power,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizationParameters {
  pub committee: Vec<VoterInfo>,

  /// Lower bound on how many block heights each finalization skips
  /// past the previous one.
  pub minimum_skip: BlockHeight,
}

impl WireSerialize for FinalizationParameters {
  fn serial<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    write_list(target, &self.committee)?;
    write_u64(target, self.minimum_skip)
  }
}

impl WireDeserialize for FinalizationParameters {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    Ok(Self {
      committee: read_list(source)?,
      minimum_skip: read_u64(source)?,
    })
  }
}

/// Payload of the genesis block: everything a node needs to verify
/// and produce blocks for the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisData {
  /// When slot 0 begins.
  pub timestamp: Timestamp,

  pub slot_duration_millis: u64,

  /// Number of slots per epoch; lottery bakers are snapshotted per
  /// epoch.
  pub epoch_length: u64,

  pub birk_parameters: BirkParameters,

  pub finalization_parameters: FinalizationParameters,

  /// Caps applied when filling a block with transactions.
  pub max_block_size: u64,
  pub max_block_energy: u64,
}

impl GenesisData {
  pub fn genesis_time(&self) -> DateTime<Utc> {
    Utc
      .timestamp_millis_opt(self.timestamp as i64)
      .single()
      .expect("genesis timestamp is in range")
  }

  pub fn slot_duration(&self) -> Duration {
    Duration::from_millis(self.slot_duration_millis)
  }

  /// The slot whose window contains `now`; slot 0 before genesis.
  pub fn slot_at(&self, now: DateTime<Utc>) -> Slot {
    let elapsed = timestamp_of(now).saturating_sub(self.timestamp);
    elapsed / self.slot_duration_millis.max(1)
  }

  /// When `slot` begins. The slot number comes straight off the
  /// wire, so the arithmetic saturates: a slot too distant to
  /// represent maps to the far future and can never look already
  /// due.
  pub fn slot_start(&self, slot: Slot) -> DateTime<Utc> {
    slot
      .checked_mul(self.slot_duration_millis)
      .and_then(|offset| self.timestamp.checked_add(offset))
      .and_then(|millis| i64::try_from(millis).ok())
      .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
      .unwrap_or(DateTime::<Utc>::MAX_UTC)
  }

  pub fn epoch_of_slot(&self, slot: Slot) -> Epoch {
    slot / self.epoch_length.max(1)
  }
}

impl WireSerialize for GenesisData {
  fn serial<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    write_u64(target, self.timestamp)?;
    write_u64(target, self.slot_duration_millis)?;
    write_u64(target, self.epoch_length)?;
    self.birk_parameters.serial(target)?;
    self.finalization_parameters.serial(target)?;
    write_u64(target, self.max_block_size)?;
    write_u64(target, self.max_block_energy)
  }
}

impl WireDeserialize for GenesisData {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    Ok(Self {
      timestamp: read_u64(source)?,
      slot_duration_millis: read_u64(source)?,
      epoch_length: read_u64(source)?,
      birk_parameters: BirkParameters::deserial(source)?,
      finalization_parameters: FinalizationParameters::deserial(source)?,
      max_block_size: read_u64(source)?,
      max_block_energy: read_u64(source)?,
    })
  }
}

/// A chain-parameter update scheduled to take effect at a fixed
/// time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolUpdate {
  pub effective_time: Timestamp,
  pub payload: Vec<u8>,
}

impl WireSerialize for ProtocolUpdate {
  fn serial<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    write_u64(target, self.effective_time)?;
    write_u64(target, self.payload.len() as u64)?;
    target.write_all(&self.payload)
  }
}

impl WireDeserialize for ProtocolUpdate {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    let effective_time = read_u64(source)?;
    let len = read_u64(source)?;
    if len > MAX_LIST_LENGTH {
      return Err(WireError::OversizedList(len));
    }
    let mut payload = vec![0u8; len as usize];
    source.read_exact(&mut payload)?;
    Ok(Self {
      effective_time,
      payload,
    })
  }
}

/// Queue of not-yet-effective protocol updates.
///
/// The first update whose effective time elapses wins and is never
/// overridden; any other update that has also elapsed at that point
/// is dropped. Updates still in the future stay queued.
#[derive(Debug, Default, Clone)]
pub struct UpdateQueue {
  pending: Vec<ProtocolUpdate>,
  effective: Option<ProtocolUpdate>,
}

impl UpdateQueue {
  pub fn add(&mut self, update: ProtocolUpdate) {
    let at = self
      .pending
      .partition_point(|u| u.effective_time <= update.effective_time);
    self.pending.insert(at, update);
  }

  /// Promotes the earliest elapsed update, if any.
  pub fn tick(&mut self, now: Timestamp) -> Option<&ProtocolUpdate> {
    if self.effective.is_none() {
      let elapsed = self
        .pending
        .iter()
        .position(|u| u.effective_time <= now);
      if let Some(first) = elapsed {
        let winner = self.pending.remove(first);
        self.pending.retain(|u| u.effective_time > now);
        self.effective = Some(winner);
      }
    }
    self.effective.as_ref()
  }

  pub fn effective(&self) -> Option<&ProtocolUpdate> {
    self.effective.as_ref()
  }

  pub fn pending(&self) -> &[ProtocolUpdate] {
    &self.pending
  }
}

/// Node-local tuning knobs; these never affect consensus validity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeParameters {
  /// Blocks whose slot begins further than this past the local
  /// clock are rejected outright rather than stored.
  #[serde(with = "humantime_serde")]
  pub early_block_threshold: Duration,

  /// How long an uncommitted transaction survives in the table,
  /// measured in slots.
  pub transaction_keep_alive_slots: u64,

  /// Insertions between purge sweeps; amortizes the purge cost.
  pub transaction_purge_gate: u64,

  #[serde(with = "humantime_serde")]
  pub transaction_purging_delay: Duration,

  /// Base delay before replaying finalization state to peers.
  #[serde(with = "humantime_serde")]
  pub finalization_replay_base_delay: Duration,

  /// Additional replay delay per committee member per attempt.
  #[serde(with = "humantime_serde")]
  pub finalization_replay_party_delay: Duration,

  /// How long received catch-up signatures are remembered for
  /// de-duplication.
  #[serde(with = "humantime_serde")]
  pub catch_up_retention: Duration,

  /// Depth of the bounded inbound-message channel.
  pub ingress_queue_depth: usize,
}

impl Default for RuntimeParameters {
  fn default() -> Self {
    Self {
      early_block_threshold: Duration::from_secs(30),
      transaction_keep_alive_slots: 600,
      transaction_purge_gate: 1000,
      transaction_purging_delay: Duration::from_secs(300),
      finalization_replay_base_delay: Duration::from_millis(300),
      finalization_replay_party_delay: Duration::from_millis(50),
      catch_up_retention: Duration::from_secs(60),
      ingress_queue_depth: 4096,
    }
  }
}
