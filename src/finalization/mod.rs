//! The finalization subsystem: committee bookkeeping, WMVBA
//! agreement rounds, the unsettled-record queue, and the catch-up
//! protocol that keeps lagging or stuck nodes in sync.

mod buffer;
mod catchup;
mod committee;
mod messages;
mod queue;
mod state;
mod wmvba;

pub use {
  catchup::CatchUpResult,
  committee::{FinalizationCommittee, Party, PartyIndex},
  messages::{
    witness_message,
    CatchUpMessage,
    Delta,
    FinalizationIndex,
    FinalizationMessage,
    FinalizationMessageHeader,
    FinalizationProof,
    FinalizationRecord,
    FinalizationSummary,
    Phase,
    SessionId,
    WmvbaMessage,
  },
  queue::{FinalizationQueue, OutputWitnesses},
  state::{FinalizationEvent, FinalizationState, FinalizerIdentity},
  wmvba::{Wmvba, WmvbaKeys, WmvbaOutput, WmvbaResult},
};
