//! Opaque facades over the cryptographic primitives the consensus
//! relies on: ed25519 block/message signatures, schnorrkel VRF
//! proofs for the slot lottery, BLS aggregate signatures for
//! finalization proofs, and SHA-256 identities.

mod bls;
mod hash;
mod keys;
mod vrf;

pub use {
  bls::{
    aggregate,
    BlsError,
    BlsPublicKey,
    BlsSecretKey,
    BlsSignature,
    BLS_PUBKEY_LENGTH,
    BLS_SIGNATURE_LENGTH,
  },
  hash::{
    BlockHash,
    HashValue,
    IncrementalHasher,
    TransactionHash,
    HASH_LENGTH,
  },
  keys::{
    Keypair,
    KeypairError,
    Pubkey,
    Signature,
    PUBKEY_LENGTH,
    SIGNATURE_LENGTH,
  },
  vrf::{
    VrfError,
    VrfKeypair,
    VrfProof,
    VrfPublicKey,
    VRF_PROOF_LENGTH,
    VRF_PUBKEY_LENGTH,
  },
};
