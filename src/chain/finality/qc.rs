//! Finalizer policies, vote aggregation and quorum certificates.

use {
  super::core::QcClaim,
  crate::{
    chain::{
      block::{Extension, QC_EXTENSION_ID},
      ChainError,
    },
    primitives::{
      aggregate_signatures,
      aggregate_verify_multi,
      wire::{self, WireDecode, WireEncode, WireError},
      BlockId,
      BlsPublicKey,
      BlsSignature,
      Digest,
    },
  },
  serde::{Deserialize, Serialize},
};

/// Message a finalizer signs to cast a strong vote on a block.
pub fn strong_vote_digest(block_id: &BlockId) -> Digest {
  let mut bytes = vec![1u8];
  bytes.extend_from_slice(block_id.as_ref());
  Digest::of(bytes)
}

/// Message for a weak vote: same block, distinct domain byte so the
/// two vote strengths can never be confused in an aggregate.
pub fn weak_vote_digest(block_id: &BlockId) -> Digest {
  let mut bytes = vec![0u8];
  bytes.extend_from_slice(block_id.as_ref());
  Digest::of(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerAuthority {
  pub description: String,
  pub weight: u64,
  pub public_key: BlsPublicKey,
}

impl WireEncode for FinalizerAuthority {
  fn encode(&self, out: &mut Vec<u8>) {
    self.description.encode(out);
    self.weight.encode(out);
    self.public_key.0.encode(out);
  }
}

impl WireDecode for FinalizerAuthority {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      description: String::decode(input)?,
      weight: u64::decode(input)?,
      public_key: BlsPublicKey(<[u8; 48]>::decode(input)?),
    })
  }
}

/// The weighted finalizer set of one policy generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerPolicy {
  pub generation: u32,
  pub finalizers: Vec<FinalizerAuthority>,
}

impl FinalizerPolicy {
  pub fn total_weight(&self) -> u64 {
    self.finalizers.iter().map(|f| f.weight).sum()
  }

  /// Strong quorum: strictly more than two thirds of total weight.
  pub fn strong_threshold(&self) -> u64 {
    self.total_weight() * 2 / 3 + 1
  }

  /// Weak quorum: strictly more than half of total weight.
  pub fn weak_threshold(&self) -> u64 {
    self.total_weight() / 2 + 1
  }

  pub fn index_of(&self, key: &BlsPublicKey) -> Option<usize> {
    self.finalizers.iter().position(|f| f.public_key == *key)
  }
}

impl WireEncode for FinalizerPolicy {
  fn encode(&self, out: &mut Vec<u8>) {
    self.generation.encode(out);
    wire::encode_list(out, &self.finalizers);
  }
}

impl WireDecode for FinalizerPolicy {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      generation: u32::decode(input)?,
      finalizers: wire::decode_list(input)?,
    })
  }
}

/// Header-extension payload of the finality protocol: the block's qc
/// claim and, when the system contract changed the finalizer set, a
/// freshly proposed policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityExtension {
  pub qc_claim: QcClaim,
  pub new_finalizer_policy: Option<FinalizerPolicy>,
}

impl FinalityExtension {
  pub fn parse(extension: &Extension) -> Result<Self, ChainError> {
    FinalityExtension::from_wire_bytes(&extension.data)
      .map_err(|e| ChainError::InvalidQcClaim(e.to_string()))
  }
}

impl WireEncode for FinalityExtension {
  fn encode(&self, out: &mut Vec<u8>) {
    self.qc_claim.encode(out);
    self.new_finalizer_policy.encode(out);
  }
}

impl WireDecode for FinalityExtension {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      qc_claim: QcClaim::decode(input)?,
      new_finalizer_policy: Option::<FinalizerPolicy>::decode(input)?,
    })
  }
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
  let mut bytes = vec![0u8; (bits.len() + 7) / 8];
  for (i, set) in bits.iter().enumerate() {
    if *set {
      bytes[i / 8] |= 1 << (i % 8);
    }
  }
  bytes
}

fn unpack_bits(bytes: &[u8], len: usize) -> Vec<bool> {
  (0..len).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect()
}

/// An aggregated certificate: who voted (strong and weak bitsets over
/// the policy's finalizer order) and the aggregate of all their vote
/// signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
  pub block_num: u32,
  pub strong_votes: Vec<u8>,
  pub weak_votes: Vec<u8>,
  pub signature: BlsSignature,
}

impl QuorumCertificate {
  pub fn to_extension(&self) -> Extension {
    Extension { id: QC_EXTENSION_ID, data: self.to_wire_bytes() }
  }

  pub fn parse(extension: &Extension) -> Result<Self, ChainError> {
    QuorumCertificate::from_wire_bytes(&extension.data)
      .map_err(|e| ChainError::InvalidQc(e.to_string()))
  }

  fn voted_weights(&self, policy: &FinalizerPolicy) -> (u64, u64) {
    let n = policy.finalizers.len();
    let strong = unpack_bits(&self.strong_votes, n);
    let weak = unpack_bits(&self.weak_votes, n);
    let mut weights = (0u64, 0u64);
    for (i, authority) in policy.finalizers.iter().enumerate() {
      if strong[i] {
        weights.0 += authority.weight;
      }
      if weak[i] {
        weights.1 += authority.weight;
      }
    }
    weights
  }

  /// Whether the certificate carries a strong quorum (as opposed to
  /// merely a weak one).
  pub fn is_strong(&self, policy: &FinalizerPolicy) -> bool {
    self.voted_weights(policy).0 >= policy.strong_threshold()
  }

  /// Full validation against the policy and the block it certifies:
  /// bitset sanity, quorum weight, and the aggregate signature over
  /// the per-signer vote digests.
  pub fn verify(
    &self,
    policy: &FinalizerPolicy,
    block_id: &BlockId,
  ) -> Result<(), ChainError> {
    let n = policy.finalizers.len();
    if self.strong_votes.len() != (n + 7) / 8
      || self.weak_votes.len() != (n + 7) / 8
    {
      return Err(ChainError::InvalidQc("malformed vote bitsets".into()));
    }
    let strong = unpack_bits(&self.strong_votes, n);
    let weak = unpack_bits(&self.weak_votes, n);
    if strong.iter().zip(&weak).any(|(s, w)| *s && *w) {
      return Err(ChainError::InvalidQc(
        "finalizer voted both strong and weak".into(),
      ));
    }

    let (strong_weight, weak_weight) = self.voted_weights(policy);
    if strong_weight < policy.strong_threshold()
      && strong_weight + weak_weight < policy.weak_threshold()
    {
      return Err(ChainError::InvalidQc(format!(
        "insufficient quorum: strong {strong_weight}, weak {weak_weight}"
      )));
    }

    let strong_digest = strong_vote_digest(block_id);
    let weak_digest = weak_vote_digest(block_id);
    let mut pairs = Vec::new();
    for (i, authority) in policy.finalizers.iter().enumerate() {
      if strong[i] {
        pairs.push((authority.public_key, strong_digest.0.to_vec()));
      } else if weak[i] {
        pairs.push((authority.public_key, weak_digest.0.to_vec()));
      }
    }
    if !aggregate_verify_multi(&pairs, &self.signature) {
      return Err(ChainError::InvalidQc("aggregate signature invalid".into()));
    }
    Ok(())
  }
}

impl WireEncode for QuorumCertificate {
  fn encode(&self, out: &mut Vec<u8>) {
    self.block_num.encode(out);
    self.strong_votes.encode(out);
    self.weak_votes.encode(out);
    self.signature.0.encode(out);
  }
}

impl WireDecode for QuorumCertificate {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      block_num: u32::decode(input)?,
      strong_votes: Vec::<u8>::decode(input)?,
      weak_votes: Vec::<u8>::decode(input)?,
      signature: BlsSignature(<[u8; 96]>::decode(input)?),
    })
  }
}

/// Aggregation progress of votes on one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QcState {
  /// Not enough weight for any quorum yet.
  Aggregating,
  /// Weak quorum reached (strong + weak weight over one half).
  WeakAchieved,
  /// Strong quorum reached (strong weight over two thirds).
  StrongAchieved,
}

/// Mutable vote accumulator attached to each fork-database block
/// while the network converges on it.
#[derive(Debug, Default)]
pub struct PendingQc {
  weights: Vec<u64>,
  strong_threshold: u64,
  weak_threshold: u64,
  strong_votes: Vec<bool>,
  weak_votes: Vec<bool>,
  signatures: Vec<Option<BlsSignature>>,
  strong_weight: u64,
  weak_weight: u64,
}

impl PendingQc {
  pub fn new(policy: &FinalizerPolicy) -> Self {
    let n = policy.finalizers.len();
    Self {
      weights: policy.finalizers.iter().map(|f| f.weight).collect(),
      strong_threshold: policy.strong_threshold(),
      weak_threshold: policy.weak_threshold(),
      strong_votes: vec![false; n],
      weak_votes: vec![false; n],
      signatures: vec![None; n],
      strong_weight: 0,
      weak_weight: 0,
    }
  }

  pub fn state(&self) -> QcState {
    if self.strong_weight >= self.strong_threshold {
      QcState::StrongAchieved
    } else if self.strong_weight + self.weak_weight >= self.weak_threshold {
      QcState::WeakAchieved
    } else {
      QcState::Aggregating
    }
  }

  /// Records a (pre-verified) vote from finalizer `index`. Duplicate
  /// votes are rejected so one finalizer cannot inflate the weight.
  pub fn add_vote(
    &mut self,
    index: usize,
    strong: bool,
    signature: BlsSignature,
  ) -> Result<QcState, ChainError> {
    if index >= self.weights.len() {
      return Err(ChainError::InvalidQc(format!(
        "finalizer index {index} out of range"
      )));
    }
    if self.strong_votes[index] || self.weak_votes[index] {
      return Err(ChainError::InvalidQc(format!(
        "duplicate vote from finalizer {index}"
      )));
    }
    if strong {
      self.strong_votes[index] = true;
      self.strong_weight += self.weights[index];
    } else {
      self.weak_votes[index] = true;
      self.weak_weight += self.weights[index];
    }
    self.signatures[index] = Some(signature);
    Ok(self.state())
  }

  /// Freezes the accumulated votes into a certificate.
  pub fn to_qc(&self, block_num: u32) -> Result<QuorumCertificate, ChainError> {
    let sigs: Vec<BlsSignature> =
      self.signatures.iter().flatten().copied().collect();
    let signature = aggregate_signatures(&sigs)
      .map_err(|e| ChainError::InvalidQc(e.to_string()))?;
    Ok(QuorumCertificate {
      block_num,
      strong_votes: pack_bits(&self.strong_votes),
      weak_votes: pack_bits(&self.weak_votes),
      signature,
    })
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::primitives::BlsKeypair,
  };

  pub(crate) fn test_policy(n: u8) -> (FinalizerPolicy, Vec<BlsKeypair>) {
    let keys: Vec<_> = (0..n).map(|i| BlsKeypair::from_seed([i + 1; 32])).collect();
    let policy = FinalizerPolicy {
      generation: 1,
      finalizers: keys
        .iter()
        .enumerate()
        .map(|(i, key)| FinalizerAuthority {
          description: format!("finalizer-{i}"),
          weight: 1,
          public_key: key.public(),
        })
        .collect(),
    };
    (policy, keys)
  }

  #[test]
  fn thresholds() {
    let (policy, _) = test_policy(4);
    assert_eq!(policy.total_weight(), 4);
    assert_eq!(policy.strong_threshold(), 3);
    assert_eq!(policy.weak_threshold(), 3);

    let (policy, _) = test_policy(7);
    assert_eq!(policy.strong_threshold(), 5);
    assert_eq!(policy.weak_threshold(), 4);
  }

  #[test]
  fn pending_qc_reaches_strong_quorum() {
    let (policy, keys) = test_policy(4);
    let block_id = BlockId::new(9, Digest::of(b"block"));
    let mut pending = PendingQc::new(&policy);

    let digest = strong_vote_digest(&block_id);
    assert_eq!(
      pending.add_vote(0, true, keys[0].sign(digest.as_ref())).unwrap(),
      QcState::Aggregating
    );
    assert_eq!(
      pending.add_vote(1, true, keys[1].sign(digest.as_ref())).unwrap(),
      QcState::Aggregating
    );
    assert_eq!(
      pending.add_vote(2, true, keys[2].sign(digest.as_ref())).unwrap(),
      QcState::StrongAchieved
    );

    // duplicate vote refused
    assert!(pending
      .add_vote(2, true, keys[2].sign(digest.as_ref()))
      .is_err());

    let qc = pending.to_qc(9).unwrap();
    assert!(qc.is_strong(&policy));
    qc.verify(&policy, &block_id).unwrap();
  }

  #[test]
  fn mixed_strong_weak_votes_form_weak_quorum() {
    let (policy, keys) = test_policy(4);
    let block_id = BlockId::new(3, Digest::of(b"block"));
    let mut pending = PendingQc::new(&policy);

    let strong = strong_vote_digest(&block_id);
    let weak = weak_vote_digest(&block_id);
    pending.add_vote(0, true, keys[0].sign(strong.as_ref())).unwrap();
    pending.add_vote(1, false, keys[1].sign(weak.as_ref())).unwrap();
    assert_eq!(
      pending.add_vote(2, false, keys[2].sign(weak.as_ref())).unwrap(),
      QcState::WeakAchieved
    );

    let qc = pending.to_qc(3).unwrap();
    assert!(!qc.is_strong(&policy));
    qc.verify(&policy, &block_id).unwrap();
  }

  #[test]
  fn qc_verification_rejects_wrong_block() {
    let (policy, keys) = test_policy(4);
    let block_id = BlockId::new(3, Digest::of(b"block"));
    let mut pending = PendingQc::new(&policy);
    let digest = strong_vote_digest(&block_id);
    for (i, key) in keys.iter().enumerate().take(3) {
      pending.add_vote(i, true, key.sign(digest.as_ref())).unwrap();
    }
    let qc = pending.to_qc(3).unwrap();

    let other = BlockId::new(4, Digest::of(b"other"));
    assert!(qc.verify(&policy, &other).is_err());
  }

  #[test]
  fn qc_verification_rejects_insufficient_weight() {
    let (policy, keys) = test_policy(4);
    let block_id = BlockId::new(3, Digest::of(b"block"));
    let mut pending = PendingQc::new(&policy);
    let digest = strong_vote_digest(&block_id);
    pending.add_vote(0, true, keys[0].sign(digest.as_ref())).unwrap();
    let qc = pending.to_qc(3).unwrap();
    assert!(matches!(
      qc.verify(&policy, &block_id),
      Err(ChainError::InvalidQc(_))
    ));
  }

  #[test]
  fn extension_roundtrip() {
    let (policy, _) = test_policy(3);
    let ext = FinalityExtension {
      qc_claim: QcClaim { block_num: 11, is_strong: true },
      new_finalizer_policy: Some(policy),
    };
    let decoded =
      FinalityExtension::from_wire_bytes(&ext.to_wire_bytes()).unwrap();
    assert_eq!(decoded, ext);
  }
}
