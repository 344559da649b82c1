//! Wire types of the finalization protocol: WMVBA step messages,
//! settled finalization records, and catch-up summaries.

use {
  super::committee::{FinalizationCommittee, PartyIndex},
  crate::{
    crypto::{BlockHash, BlsSignature, Keypair, Pubkey, Signature, VrfProof},
    params::BlockHeight,
    serial::{
      read_bool,
      read_u32,
      read_u64,
      read_u8,
      write_bool,
      write_u32,
      write_u64,
      write_u8,
      WireDeserialize,
      WireError,
      WireSerialize,
      MAX_LIST_LENGTH,
    },
  },
  std::{
    collections::BTreeSet,
    fmt::Display,
    io::{Read, Write},
  },
};

/// Monotone counter of finalized blocks after genesis.
pub type FinalizationIndex = u64;

/// Block-height distance from a finalization target; doubles on
/// every failed round.
pub type Delta = u64;

/// A finalization session is identified by its genesis block.
pub type SessionId = BlockHash;

/// ABBA phase counter.
pub type Phase = u32;

/// The statement finalization witnesses sign: binding the session,
/// round and the agreed block into one message keeps witness
/// signatures from one round meaningless in any other.
pub fn witness_message(
  session: SessionId,
  index: FinalizationIndex,
  delta: Delta,
  block: BlockHash,
) -> Vec<u8> {
  let mut message = Vec::with_capacity(87);
  message.extend_from_slice(b"skov-witness");
  message.extend_from_slice(&session);
  message.extend_from_slice(&index.to_be_bytes());
  message.extend_from_slice(&delta.to_be_bytes());
  message.extend_from_slice(&block);
  message
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizationProof {
  /// Committee indices of the included witnesses, ascending.
  pub parties: Vec<PartyIndex>,
  pub signature: BlsSignature,
}

/// The irrevocability certificate for one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizationRecord {
  pub index: FinalizationIndex,
  pub block: BlockHash,
  pub proof: FinalizationProof,

  /// The delta of the round that succeeded.
  pub delay: BlockHeight,
}

impl FinalizationRecord {
  /// The genesis block is finalized by fiat; its record carries a
  /// vacuous proof.
  pub fn genesis(genesis_hash: BlockHash) -> Self {
    Self {
      index: 0,
      block: genesis_hash,
      proof: FinalizationProof {
        parties: vec![],
        signature: BlsSignature::identity(),
      },
      delay: 0,
    }
  }

  /// Checks the aggregate signature against the committee and the
  /// corruption bound. The genesis record never passes; it is
  /// trusted by construction, not by proof.
  pub fn verify(
    &self,
    session: SessionId,
    committee: &FinalizationCommittee,
  ) -> bool {
    let distinct: BTreeSet<PartyIndex> =
      self.proof.parties.iter().copied().collect();
    if distinct.len() != self.proof.parties.len() {
      return false;
    }
    if committee.weight_of(self.proof.parties.iter())
      <= committee.corrupt_weight()
    {
      return false;
    }
    let Some(keys) = committee.bls_keys_of(&self.proof.parties) else {
      return false;
    };
    let message = witness_message(session, self.index, self.delay, self.block);
    self.proof.signature.verify_aggregate(&message, &keys)
  }
}

impl WireSerialize for FinalizationRecord {
  fn serial<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    write_u64(target, self.index)?;
    self.block.serial(target)?;
    write_u32(target, self.proof.parties.len() as u32)?;
    for party in &self.proof.parties {
      write_u32(target, *party)?;
    }
    self.proof.signature.serial(target)?;
    write_u64(target, self.delay)
  }
}

impl WireDeserialize for FinalizationRecord {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    let index = read_u64(source)?;
    let block = BlockHash::deserial(source)?;
    let count = read_u32(source)? as u64;
    if count > MAX_LIST_LENGTH {
      return Err(WireError::OversizedList(count));
    }
    let mut parties = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
      parties.push(read_u32(source)?);
    }
    let signature = BlsSignature::deserial(source)?;
    let delay = read_u64(source)?;
    Ok(Self {
      index,
      block,
      proof: FinalizationProof { parties, signature },
      delay,
    })
  }
}

impl Display for FinalizationRecord {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "record {} finalizing {} at delay {}",
      self.index, self.block, self.delay
    )
  }
}

/// One step of the WMVBA agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WmvbaMessage {
  /// Freeze: propose a candidate block.
  Proposal(BlockHash),

  /// Freeze: vote for a proposed block, or for bottom when the
  /// proposals conflict.
  Vote(Option<BlockHash>),

  /// ABBA: a justified choice for a phase, with the sender's coin
  /// ticket.
  Justified {
    phase: Phase,
    choice: bool,
    ticket: VrfProof,
  },

  /// CSS: reports one party's justified choice as seen.
  Seen {
    phase: Phase,
    party: PartyIndex,
    choice: bool,
  },

  /// CSS: the sender has seen a quorum and reports everything it
  /// saw.
  DoneReporting {
    phase: Phase,
    seen: Vec<(PartyIndex, bool)>,
  },

  /// ABBA has decided on the sender's side.
  WeAreDone(bool),

  /// BLS witness signature over the agreed block.
  Witness {
    value: BlockHash,
    signature: BlsSignature,
  },
}

impl WmvbaMessage {
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Proposal(_) => "proposal",
      Self::Vote(_) => "vote",
      Self::Justified { .. } => "justified",
      Self::Seen { .. } => "seen",
      Self::DoneReporting { .. } => "done-reporting",
      Self::WeAreDone(_) => "we-are-done",
      Self::Witness { .. } => "witness",
    }
  }
}

impl WireSerialize for WmvbaMessage {
  fn serial<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    match self {
      Self::Proposal(block) => {
        write_u8(target, 0)?;
        block.serial(target)
      }
      Self::Vote(None) => {
        write_u8(target, 1)?;
        write_bool(target, false)
      }
      Self::Vote(Some(block)) => {
        write_u8(target, 1)?;
        write_bool(target, true)?;
        block.serial(target)
      }
      Self::Justified {
        phase,
        choice,
        ticket,
      } => {
        write_u8(target, 2)?;
        write_u32(target, *phase)?;
        write_bool(target, *choice)?;
        ticket.serial(target)
      }
      Self::Seen {
        phase,
        party,
        choice,
      } => {
        write_u8(target, 3)?;
        write_u32(target, *phase)?;
        write_u32(target, *party)?;
        write_bool(target, *choice)
      }
      Self::DoneReporting { phase, seen } => {
        write_u8(target, 4)?;
        write_u32(target, *phase)?;
        write_u32(target, seen.len() as u32)?;
        for (party, choice) in seen {
          write_u32(target, *party)?;
          write_bool(target, *choice)?;
        }
        Ok(())
      }
      Self::WeAreDone(choice) => {
        write_u8(target, 5)?;
        write_bool(target, *choice)
      }
      Self::Witness { value, signature } => {
        write_u8(target, 6)?;
        value.serial(target)?;
        signature.serial(target)
      }
    }
  }
}

impl WireDeserialize for WmvbaMessage {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    match read_u8(source)? {
      0 => Ok(Self::Proposal(BlockHash::deserial(source)?)),
      1 => {
        if read_bool(source)? {
          Ok(Self::Vote(Some(BlockHash::deserial(source)?)))
        } else {
          Ok(Self::Vote(None))
        }
      }
      2 => Ok(Self::Justified {
        phase: read_u32(source)?,
        choice: read_bool(source)?,
        ticket: VrfProof::deserial(source)?,
      }),
      3 => Ok(Self::Seen {
        phase: read_u32(source)?,
        party: read_u32(source)?,
        choice: read_bool(source)?,
      }),
      4 => {
        let phase = read_u32(source)?;
        let count = read_u32(source)? as u64;
        if count > MAX_LIST_LENGTH {
          return Err(WireError::OversizedList(count));
        }
        let mut seen = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
          let party = read_u32(source)?;
          let choice = read_bool(source)?;
          seen.push((party, choice));
        }
        Ok(Self::DoneReporting { phase, seen })
      }
      5 => Ok(Self::WeAreDone(read_bool(source)?)),
      6 => Ok(Self::Witness {
        value: BlockHash::deserial(source)?,
        signature: BlsSignature::deserial(source)?,
      }),
      _ => Err(WireError::Malformed("WMVBA message tag")),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FinalizationMessageHeader {
  pub session: SessionId,
  pub index: FinalizationIndex,
  pub delta: Delta,
  pub sender: PartyIndex,
}

impl WireSerialize for FinalizationMessageHeader {
  fn serial<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    self.session.serial(target)?;
    write_u64(target, self.index)?;
    write_u64(target, self.delta)?;
    write_u32(target, self.sender)
  }
}

impl WireDeserialize for FinalizationMessageHeader {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    Ok(Self {
      session: SessionId::deserial(source)?,
      index: read_u64(source)?,
      delta: read_u64(source)?,
      sender: read_u32(source)?,
    })
  }
}

/// A signed WMVBA step from one committee member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizationMessage {
  pub header: FinalizationMessageHeader,
  pub body: WmvbaMessage,
  pub signature: Signature,
}

impl FinalizationMessage {
  pub fn sign(
    header: FinalizationMessageHeader,
    body: WmvbaMessage,
    keypair: &Keypair,
  ) -> Self {
    let mut message = Self {
      header,
      body,
      signature: Signature::from_bytes(&[0u8; 64])
        .expect("the zero signature is structurally valid"),
    };
    message.signature = keypair.sign(&message.signable_bytes());
    message
  }

  fn signable_bytes(&self) -> Vec<u8> {
    let mut bytes = Vec::new();
    self
      .header
      .serial(&mut bytes)
      .and_then(|_| self.body.serial(&mut bytes))
      .expect("writing to a vec cannot fail");
    bytes
  }

  pub fn verify(&self, key: &Pubkey) -> bool {
    key.verify(&self.signable_bytes(), &self.signature)
  }
}

impl WireSerialize for FinalizationMessage {
  fn serial<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    self.header.serial(target)?;
    self.body.serial(target)?;
    self.signature.serial(target)
  }
}

impl WireDeserialize for FinalizationMessage {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    Ok(Self {
      header: FinalizationMessageHeader::deserial(source)?,
      body: WmvbaMessage::deserial(source)?,
      signature: Signature::deserial(source)?,
    })
  }
}

impl Display for FinalizationMessage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "{} from party {} for round ({}, {})",
      self.body.kind(),
      self.header.sender,
      self.header.index,
      self.header.delta
    )
  }
}

/// Everything a stuck peer needs to catch up with one round: the
/// evidence for each failed delta plus a replay of the current
/// round's messages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FinalizationSummary {
  /// Newest failed round first; each entry maps parties to their
  /// signatures on `WeAreDone(false)`.
  pub failed_rounds: Vec<Vec<(PartyIndex, Signature)>>,

  pub messages: Vec<FinalizationMessage>,
}

impl WireSerialize for FinalizationSummary {
  fn serial<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    write_u32(target, self.failed_rounds.len() as u32)?;
    for round in &self.failed_rounds {
      write_u32(target, round.len() as u32)?;
      for (party, signature) in round {
        write_u32(target, *party)?;
        signature.serial(target)?;
      }
    }
    write_u32(target, self.messages.len() as u32)?;
    for message in &self.messages {
      message.serial(target)?;
    }
    Ok(())
  }
}

impl WireDeserialize for FinalizationSummary {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    let round_count = read_u32(source)? as u64;
    if round_count > MAX_LIST_LENGTH {
      return Err(WireError::OversizedList(round_count));
    }
    let mut failed_rounds = Vec::with_capacity(round_count.min(64) as usize);
    for _ in 0..round_count {
      let sig_count = read_u32(source)? as u64;
      if sig_count > MAX_LIST_LENGTH {
        return Err(WireError::OversizedList(sig_count));
      }
      let mut round = Vec::with_capacity(sig_count.min(1024) as usize);
      for _ in 0..sig_count {
        let party = read_u32(source)?;
        let signature = Signature::deserial(source)?;
        round.push((party, signature));
      }
      failed_rounds.push(round);
    }
    let message_count = read_u32(source)? as u64;
    if message_count > MAX_LIST_LENGTH {
      return Err(WireError::OversizedList(message_count));
    }
    let mut messages = Vec::with_capacity(message_count.min(1024) as usize);
    for _ in 0..message_count {
      messages.push(FinalizationMessage::deserial(source)?);
    }
    Ok(Self {
      failed_rounds,
      messages,
    })
  }
}

/// Periodic replay of a node's finalization view, signed by the
/// sending committee member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpMessage {
  pub session: SessionId,
  pub index: FinalizationIndex,
  pub sender: PartyIndex,
  pub summary: FinalizationSummary,
  pub signature: Signature,
}

impl CatchUpMessage {
  pub fn sign(
    session: SessionId,
    index: FinalizationIndex,
    sender: PartyIndex,
    summary: FinalizationSummary,
    keypair: &Keypair,
  ) -> Self {
    let mut message = Self {
      session,
      index,
      sender,
      summary,
      signature: Signature::from_bytes(&[0u8; 64])
        .expect("the zero signature is structurally valid"),
    };
    message.signature = keypair.sign(&message.signable_bytes());
    message
  }

  fn signable_bytes(&self) -> Vec<u8> {
    let mut bytes = Vec::new();
    self.session.serial(&mut bytes).expect("vec write");
    bytes.extend_from_slice(&self.index.to_be_bytes());
    bytes.extend_from_slice(&self.sender.to_be_bytes());
    self.summary.serial(&mut bytes).expect("vec write");
    bytes
  }

  pub fn verify(&self, key: &Pubkey) -> bool {
    key.verify(&self.signable_bytes(), &self.signature)
  }
}

impl WireSerialize for CatchUpMessage {
  fn serial<W: Write>(&self, target: &mut W) -> std::io::Result<()> {
    self.session.serial(target)?;
    write_u64(target, self.index)?;
    write_u32(target, self.sender)?;
    self.summary.serial(target)?;
    self.signature.serial(target)
  }
}

impl WireDeserialize for CatchUpMessage {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    Ok(Self {
      session: SessionId::deserial(source)?,
      index: read_u64(source)?,
      sender: read_u32(source)?,
      summary: FinalizationSummary::deserial(source)?,
      signature: Signature::deserial(source)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::crypto::{BlsSecretKey, HashValue, Keypair, VrfKeypair},
  };

  fn keypair() -> Keypair {
    [31u8; 32].as_slice().try_into().unwrap()
  }

  fn header() -> FinalizationMessageHeader {
    FinalizationMessageHeader {
      session: HashValue::digest(b"session"),
      index: 4,
      delta: 2,
      sender: 1,
    }
  }

  #[test]
  fn record_roundtrip_is_identity() {
    let record = FinalizationRecord {
      index: 3,
      block: HashValue::digest(b"block"),
      proof: FinalizationProof {
        parties: vec![0, 2, 3],
        signature: BlsSecretKey::from_seed(&[1u8; 32]).sign(b"w"),
      },
      delay: 2,
    };
    let bytes = record.to_bytes();
    let restored = FinalizationRecord::from_bytes(&bytes).unwrap();
    assert_eq!(restored, record);
    assert_eq!(restored.to_bytes(), bytes);
  }

  #[test]
  fn every_message_kind_roundtrips() {
    let vrf = VrfKeypair::from_seed(&[2u8; 32]);
    let bodies = vec![
      WmvbaMessage::Proposal(HashValue::digest(b"b")),
      WmvbaMessage::Vote(None),
      WmvbaMessage::Vote(Some(HashValue::digest(b"b"))),
      WmvbaMessage::Justified {
        phase: 3,
        choice: true,
        ticket: vrf.prove(b"ticket"),
      },
      WmvbaMessage::Seen {
        phase: 3,
        party: 2,
        choice: false,
      },
      WmvbaMessage::DoneReporting {
        phase: 3,
        seen: vec![(0, true), (2, false)],
      },
      WmvbaMessage::WeAreDone(false),
      WmvbaMessage::Witness {
        value: HashValue::digest(b"b"),
        signature: BlsSecretKey::from_seed(&[3u8; 32]).sign(b"w"),
      },
    ];
    for body in bodies {
      let message = FinalizationMessage::sign(header(), body, &keypair());
      let restored =
        FinalizationMessage::from_bytes(&message.to_bytes()).unwrap();
      assert_eq!(restored, message);
      assert!(restored.verify(&keypair().public()));
    }
  }

  #[test]
  fn tampered_message_fails_verification() {
    let message = FinalizationMessage::sign(
      header(),
      WmvbaMessage::WeAreDone(true),
      &keypair(),
    );
    let mut tampered = message.clone();
    tampered.header.index += 1;
    assert!(!tampered.verify(&keypair().public()));
  }

  #[test]
  fn catch_up_roundtrip_and_signature() {
    let summary = FinalizationSummary {
      failed_rounds: vec![vec![(
        0,
        keypair().sign(b"we-are-done-false"),
      )]],
      messages: vec![FinalizationMessage::sign(
        header(),
        WmvbaMessage::Vote(None),
        &keypair(),
      )],
    };
    let message = CatchUpMessage::sign(
      HashValue::digest(b"session"),
      4,
      1,
      summary,
      &keypair(),
    );
    let restored = CatchUpMessage::from_bytes(&message.to_bytes()).unwrap();
    assert_eq!(restored, message);
    assert!(restored.verify(&keypair().public()));
  }
}
