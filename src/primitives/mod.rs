mod account;
mod hex;
mod id;
mod keys;
mod merkle;
mod time;
pub mod wire;

pub use {
  account::{AccountName, InvalidAccountName},
  hex::ToHexString,
  id::{BlockId, Digest, TransactionId},
  keys::{
    aggregate_signatures,
    aggregate_verify,
    aggregate_verify_multi,
    BlsKeypair,
    BlsPublicKey,
    BlsSignature,
    Keypair,
    Pubkey,
  },
  merkle::{canonical_merkle, MountainRange},
  time::{BlockTimestamp, TimePointSec},
  wire::{WireDecode, WireEncode, WireError},
};
