//! The block controller and everything it arbitrates: block and
//! transaction formats, the fork database, protocol features,
//! pending block stages, finality votes and the controller itself.

pub mod billing;
pub mod block;
pub mod block_state;
pub mod controller;
mod error;
pub mod features;
pub mod finality;
pub mod fork_database;
pub mod pending;
pub mod pipeline;
pub mod signals;
pub mod transaction;
pub mod unapplied;

pub use {
  controller::{
    Config,
    Controller,
    DrainOutcome,
    Genesis,
    ReadMode,
    Signals,
  },
  error::ChainError,
  pending::BlockMode,
};
