//! A Byzantine-fault-tolerant block tree and finalization engine.
//!
//! Bakers extend an append-only tree of slot-stamped blocks; a
//! weighted Byzantine agreement among a finalization committee
//! periodically picks one block and makes it irrevocable, pruning
//! every competing branch. This crate is the consensus core only:
//! transport, block-state execution and storage of chain data are
//! seams ([`runner::OutboundSink`], [`scheduler::Scheduler`],
//! [`blobstore::BlobStore`]) that the embedding node provides.

mod baker;
mod blobstore;
mod block;
mod crypto;
mod finalization;
mod import;
mod lottery;
mod params;
mod runner;
mod scheduler;
mod serial;
mod skov;
mod transaction;
mod tree;
mod txtable;

#[cfg(test)]
mod test;

pub use {
  baker::{try_bake, BakeOutcome, BakerIdentity},
  blobstore::{BlobStore, BlobStoreError, BufferedRef, NULL_OFFSET},
  block::{BakedBlock, Block, BlockData, BlockPtr, PendingBlock},
  crypto::{
    aggregate,
    BlockHash,
    BlsPublicKey,
    BlsSecretKey,
    BlsSignature,
    HashValue,
    Keypair,
    Pubkey,
    Signature,
    TransactionHash,
    VrfKeypair,
    VrfProof,
    VrfPublicKey,
  },
  finalization::{
    CatchUpMessage,
    CatchUpResult,
    Delta,
    FinalizationCommittee,
    FinalizationIndex,
    FinalizationMessage,
    FinalizationRecord,
    FinalizationState,
    FinalizationSummary,
    FinalizerIdentity,
    PartyIndex,
    SessionId,
    WmvbaMessage,
  },
  import::{import_block_file, import_blocks, ImportError},
  lottery::election_probability,
  params::{
    BakerId,
    BakerInfo,
    BirkParameters,
    BlockHeight,
    Epoch,
    FinalizationParameters,
    GenesisData,
    ProtocolUpdate,
    RuntimeParameters,
    Slot,
    Timestamp,
    UpdateQueue,
    VoterInfo,
  },
  runner::{
    InboundMessage,
    OutboundSink,
    Runner,
    TimerHandle,
    TimerService,
  },
  scheduler::{
    ChainMetadata,
    CountingScheduler,
    ExecutionOutcome,
    Scheduler,
    StateHandle,
  },
  serial::{WireDeserialize, WireError, WireSerialize},
  skov::{SkovEvent, SkovState, Tick, UpdateResult},
  transaction::{Nonce, Transaction},
  tree::{BlockStatus, TreeState},
  txtable::{TransactionStatus, TransactionTable},
};
