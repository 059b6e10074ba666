//! The deterministic failure taxonomy.
//!
//! Every error the controller can surface is one of these kinds, and
//! each kind has a fixed propagation policy: subjective failures only
//! influence local scheduling, objective ones are committed to the
//! block as failed receipts, and consensus violations reject the
//! block together with all of its descendants.

use {
  crate::{
    primitives::{BlockId, TransactionId, WireError},
    state::{DbError, ResourceError},
  },
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum ChainError {
  #[error("transaction {0} expired")]
  ExpiredTx(TransactionId),

  #[error("transaction {0} is a duplicate")]
  TxDuplicate(TransactionId),

  #[error("transaction cpu budget of {budget_us}us exceeded (objective: {objective})")]
  TxCpuUsageExceeded { budget_us: u64, objective: bool },

  #[error("transaction net usage of {used} exceeds {limit}")]
  TxNetUsageExceeded { used: u64, limit: u64 },

  #[error("block deadline reached while applying transaction")]
  DeadlineExceeded,

  #[error("block cpu budget exhausted")]
  BlockCpuExhausted,

  #[error("block net budget exhausted")]
  BlockNetExhausted,

  #[error("transaction failed authorization checks: {0}")]
  Authorization(String),

  #[error("account {0} exceeded its failure limit for this window")]
  AccountFailureLimit(crate::primitives::AccountName),

  #[error("configured terminate-at-block {0} reached")]
  TerminateAtBlock(u32),

  #[error("reference block {0} is not part of this branch")]
  InvalidRefBlock(u16),

  #[error("block {0} does not link to any known block")]
  UnlinkableBlock(BlockId),

  #[error("block {0} already known")]
  DuplicateBlock(BlockId),

  #[error("protocol feature violation in block: {0}")]
  ProtocolFeatureBadBlock(String),

  #[error("invalid quorum certificate: {0}")]
  InvalidQc(String),

  #[error("invalid qc claim: {0}")]
  InvalidQcClaim(String),

  #[error("{0} merkle root does not match computed value")]
  InvalidMerkleRoot(&'static str),

  #[error("block signature does not match the scheduled producer")]
  InvalidBlockSignature,

  #[error("unexpected producer or timestamp in header: {0}")]
  InvalidHeader(String),

  #[error("fork database corruption: {0}")]
  ForkDatabase(String),

  #[error("database guard: {0}")]
  DatabaseGuard(DbError),

  #[error("database: {0}")]
  Database(DbError),

  #[error("resource limit: {0}")]
  Resource(#[from] ResourceError),

  #[error("wire format: {0}")]
  Wire(#[from] WireError),

  #[error("block log: {0}")]
  BlockLog(String),

  #[error("snapshot: {0}")]
  Snapshot(String),

  #[error("finalizer safety file: {0}")]
  SafetyFile(String),

  #[error("contract execution failed: {0}")]
  Execution(String),

  #[error("a pending block already exists")]
  AlreadyPending,

  #[error("operation requires a pending block in the {0} stage")]
  WrongBlockStage(&'static str),
}

impl ChainError {
  /// Whether a block carrying the failure must be rejected from the
  /// fork database (together with every descendant).
  pub fn rejects_block(&self) -> bool {
    matches!(
      self,
      ChainError::ProtocolFeatureBadBlock(_)
        | ChainError::InvalidQc(_)
        | ChainError::InvalidQcClaim(_)
        | ChainError::InvalidMerkleRoot(_)
        | ChainError::InvalidBlockSignature
        | ChainError::InvalidHeader(_)
    )
  }

  /// Subjective failures are node-local: they never produce a receipt
  /// and never reject a block, they only influence scheduling.
  pub fn is_subjective(&self) -> bool {
    matches!(
      self,
      ChainError::TxCpuUsageExceeded { objective: false, .. }
        | ChainError::DeadlineExceeded
        | ChainError::BlockCpuExhausted
        | ChainError::BlockNetExhausted
        | ChainError::AccountFailureLimit(_)
    )
  }

  /// Fatal errors request a node shutdown instead of being handled.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      ChainError::ForkDatabase(_) | ChainError::DatabaseGuard(_)
    )
  }
}

impl From<DbError> for ChainError {
  fn from(err: DbError) -> Self {
    match err {
      DbError::Guard(_) => ChainError::DatabaseGuard(err),
      other => ChainError::Database(other),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classification() {
    assert!(ChainError::InvalidMerkleRoot("transaction").rejects_block());
    assert!(!ChainError::BlockCpuExhausted.rejects_block());
    assert!(
      ChainError::TxCpuUsageExceeded { budget_us: 1, objective: false }
        .is_subjective()
    );
    assert!(
      !ChainError::TxCpuUsageExceeded { budget_us: 1, objective: true }
        .is_subjective()
    );
    assert!(ChainError::from(DbError::Guard(10)).is_fatal());
    assert!(!ChainError::from(DbError::NoActiveSession).is_fatal());
  }
}
