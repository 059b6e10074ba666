//! Local finalizers: vote signing and the durable safety record.

use {
  super::{
    core::QcClaim,
    qc::{strong_vote_digest, weak_vote_digest},
  },
  crate::{
    chain::ChainError,
    primitives::{
      wire::{WireDecode, WireEncode, WireError},
      BlockId,
      BlockTimestamp,
      BlsKeypair,
      BlsPublicKey,
      BlsSignature,
    },
  },
  serde::{Deserialize, Serialize},
  std::path::PathBuf,
  tracing::{info, warn},
};

/// A finalizer's signed vote on one block, broadcast to the network
/// and aggregated by everyone into that block's pending certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteMessage {
  pub block_id: BlockId,
  pub strong: bool,
  pub finalizer_key: BlsPublicKey,
  pub signature: BlsSignature,
}

impl VoteMessage {
  pub fn verify(&self) -> bool {
    let digest = if self.strong {
      strong_vote_digest(&self.block_id)
    } else {
      weak_vote_digest(&self.block_id)
    };
    self.signature.verify(&self.finalizer_key, digest.as_ref())
  }
}

impl WireEncode for VoteMessage {
  fn encode(&self, out: &mut Vec<u8>) {
    self.block_id.encode(out);
    self.strong.encode(out);
    self.finalizer_key.0.encode(out);
    self.signature.0.encode(out);
  }
}

impl WireDecode for VoteMessage {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      block_id: BlockId::decode(input)?,
      strong: bool::decode(input)?,
      finalizer_key: BlsPublicKey(<[u8; 48]>::decode(input)?),
      signature: BlsSignature(<[u8; 96]>::decode(input)?),
    })
  }
}

/// What a finalizer must remember across restarts to never equivocate:
/// the last slot it voted in and the claim height it is locked on.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct SafetyRecord {
  pub last_vote_block_num: u32,
  pub last_vote_timestamp: BlockTimestamp,
  pub lock_block_num: u32,
}

/// A finalizer configured on this node.
///
/// The safety record is persisted before a vote leaves the node, so a
/// crash between signing and broadcasting can only lose a vote, never
/// double-cast one.
pub struct LocalFinalizer {
  keypair: BlsKeypair,
  safety: SafetyRecord,
  safety_file: Option<PathBuf>,
}

impl LocalFinalizer {
  pub fn new(keypair: BlsKeypair) -> Self {
    Self { keypair, safety: SafetyRecord::default(), safety_file: None }
  }

  /// Attaches a safety file, loading any record already in it. A
  /// record written under a different key is kept: discarding it on
  /// key rotation could permit an equivocation for the old key's
  /// outstanding votes.
  pub fn with_safety_file(mut self, path: PathBuf) -> Self {
    match std::fs::read(&path) {
      Ok(bytes) => match serde_json::from_slice(&bytes) {
        Ok(record) => self.safety = record,
        Err(e) => warn!("ignoring malformed finalizer safety file: {e}"),
      },
      Err(_) => info!("starting with a fresh finalizer safety record"),
    }
    self.safety_file = Some(path);
    self
  }

  pub fn public(&self) -> BlsPublicKey {
    self.keypair.public()
  }

  pub fn safety(&self) -> &SafetyRecord {
    &self.safety
  }

  fn persist(&self) -> Result<(), ChainError> {
    if let Some(path) = &self.safety_file {
      let bytes = serde_json::to_vec_pretty(&self.safety)
        .map_err(|e| ChainError::SafetyFile(e.to_string()))?;
      std::fs::write(path, bytes)
        .map_err(|e| ChainError::SafetyFile(e.to_string()))?;
    }
    Ok(())
  }

  /// Applies the safety rules to a proposal and, if they pass, signs
  /// a vote and durably updates the record first.
  ///
  /// Rules: (1) at most one vote per slot, and never for a slot
  /// earlier than the last voted one; (2) never vote for a block
  /// whose latest claim is older than the locked block.
  pub fn maybe_vote(
    &mut self,
    block_id: &BlockId,
    timestamp: BlockTimestamp,
    latest_qc_claim: QcClaim,
  ) -> Result<Option<VoteMessage>, ChainError> {
    if timestamp <= self.safety.last_vote_timestamp
      && self.safety.last_vote_block_num != 0
    {
      return Ok(None);
    }
    if latest_qc_claim.block_num < self.safety.lock_block_num {
      return Ok(None);
    }

    let block_num = block_id.num();
    let strong = block_num > self.safety.last_vote_block_num;

    self.safety.last_vote_block_num = block_num;
    self.safety.last_vote_timestamp = timestamp;
    if strong {
      self.safety.lock_block_num =
        self.safety.lock_block_num.max(latest_qc_claim.block_num);
    }
    self.persist()?;

    let digest = if strong {
      strong_vote_digest(block_id)
    } else {
      weak_vote_digest(block_id)
    };
    Ok(Some(VoteMessage {
      block_id: *block_id,
      strong,
      finalizer_key: self.keypair.public(),
      signature: self.keypair.sign(digest.as_ref()),
    }))
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::primitives::Digest,
  };

  fn claim(block_num: u32) -> QcClaim {
    QcClaim { block_num, is_strong: true }
  }

  fn block(num: u32) -> BlockId {
    BlockId::new(num, Digest::of(num.to_le_bytes()))
  }

  #[test]
  fn votes_are_verifiable() {
    let mut finalizer = LocalFinalizer::new(BlsKeypair::from_seed([1u8; 32]));
    let vote = finalizer
      .maybe_vote(&block(5), BlockTimestamp(10), claim(4))
      .unwrap()
      .unwrap();
    assert!(vote.strong);
    assert!(vote.verify());

    let mut tampered = vote.clone();
    tampered.strong = false;
    assert!(!tampered.verify());
  }

  #[test]
  fn one_vote_per_slot() {
    let mut finalizer = LocalFinalizer::new(BlsKeypair::from_seed([1u8; 32]));
    assert!(finalizer
      .maybe_vote(&block(5), BlockTimestamp(10), claim(4))
      .unwrap()
      .is_some());
    // same slot, competing block: refused
    assert!(finalizer
      .maybe_vote(&block(5), BlockTimestamp(10), claim(4))
      .unwrap()
      .is_none());
    // earlier slot: refused
    assert!(finalizer
      .maybe_vote(&block(6), BlockTimestamp(9), claim(5))
      .unwrap()
      .is_none());
  }

  #[test]
  fn locked_claim_refuses_older_branches() {
    let mut finalizer = LocalFinalizer::new(BlsKeypair::from_seed([1u8; 32]));
    finalizer
      .maybe_vote(&block(8), BlockTimestamp(20), claim(7))
      .unwrap()
      .unwrap();
    assert_eq!(finalizer.safety().lock_block_num, 7);

    // a branch whose claim is behind the lock is refused
    assert!(finalizer
      .maybe_vote(&block(9), BlockTimestamp(21), claim(6))
      .unwrap()
      .is_none());
  }

  #[test]
  fn fork_to_lower_number_votes_weak() {
    let mut finalizer = LocalFinalizer::new(BlsKeypair::from_seed([1u8; 32]));
    finalizer
      .maybe_vote(&block(8), BlockTimestamp(20), claim(7))
      .unwrap()
      .unwrap();

    // later slot but lower block number: a competing fork, weak vote
    let vote = finalizer
      .maybe_vote(&block(7), BlockTimestamp(21), claim(7))
      .unwrap()
      .unwrap();
    assert!(!vote.strong);
    assert!(vote.verify());
  }

  #[test]
  fn safety_record_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("safety.json");

    let mut finalizer = LocalFinalizer::new(BlsKeypair::from_seed([1u8; 32]))
      .with_safety_file(path.clone());
    finalizer
      .maybe_vote(&block(8), BlockTimestamp(20), claim(7))
      .unwrap()
      .unwrap();

    // a fresh instance (even with another key) loads the record and
    // refuses to re-vote in the covered slot
    let mut reloaded = LocalFinalizer::new(BlsKeypair::from_seed([2u8; 32]))
      .with_safety_file(path);
    assert_eq!(reloaded.safety().last_vote_block_num, 8);
    assert!(reloaded
      .maybe_vote(&block(8), BlockTimestamp(20), claim(7))
      .unwrap()
      .is_none());
  }
}
