//! Transactions and their node-local metadata.

use {
  crate::primitives::{
    wire::{self, WireDecode, WireEncode, WireError},
    AccountName,
    Digest,
    Pubkey,
    TimePointSec,
    TransactionId,
  },
  ed25519_dalek::Signature,
  once_cell::sync::OnceCell,
  rayon::prelude::*,
  serde::{Deserialize, Serialize},
  std::{
    collections::HashSet,
    fmt::{Debug, Formatter},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
  },
};

#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PermissionLevel {
  pub actor: AccountName,
  pub permission: String,
}

impl PermissionLevel {
  pub fn active(actor: AccountName) -> Self {
    Self { actor, permission: "active".to_string() }
  }
}

impl WireEncode for PermissionLevel {
  fn encode(&self, out: &mut Vec<u8>) {
    self.actor.encode(out);
    self.permission.encode(out);
  }
}

impl WireDecode for PermissionLevel {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      actor: AccountName::decode(input)?,
      permission: String::decode(input)?,
    })
  }
}

/// A single contract invocation: which contract, which action, on
/// whose authority, with what argument bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
  pub account: AccountName,
  pub name: String,
  pub authorization: Vec<PermissionLevel>,
  pub data: Vec<u8>,
}

impl Action {
  pub fn digest(&self) -> Digest {
    Digest::of(self.to_wire_bytes())
  }
}

impl WireEncode for Action {
  fn encode(&self, out: &mut Vec<u8>) {
    self.account.encode(out);
    self.name.encode(out);
    wire::encode_list(out, &self.authorization);
    self.data.encode(out);
  }
}

impl WireDecode for Action {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      account: AccountName::decode(input)?,
      name: String::decode(input)?,
      authorization: wire::decode_list(input)?,
      data: Vec::<u8>::decode(input)?,
    })
  }
}

/// The consensus transaction body. The id is the digest of these
/// bytes; signatures are not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
  pub expiration: TimePointSec,
  pub ref_block_num: u16,
  pub ref_block_prefix: u32,
  pub max_net_usage_words: u32,
  pub max_cpu_usage_ms: u8,
  pub delay_sec: u32,
  pub actions: Vec<Action>,
}

impl Transaction {
  pub fn id(&self) -> TransactionId {
    Digest::of(self.to_wire_bytes())
  }

  /// Digest a signer commits to: the chain id bound together with
  /// the transaction body, so signatures cannot be replayed across
  /// chains.
  pub fn signing_digest(&self, chain_id: &Digest) -> Digest {
    let mut bytes = chain_id.0.to_vec();
    self.encode(&mut bytes);
    Digest::of(bytes)
  }

  pub fn first_authorizer(&self) -> Option<&AccountName> {
    self
      .actions
      .first()
      .and_then(|action| action.authorization.first())
      .map(|level| &level.actor)
  }
}

impl WireEncode for Transaction {
  fn encode(&self, out: &mut Vec<u8>) {
    self.expiration.encode(out);
    self.ref_block_num.encode(out);
    self.ref_block_prefix.encode(out);
    wire::put_varuint(out, self.max_net_usage_words as u64);
    self.max_cpu_usage_ms.encode(out);
    wire::put_varuint(out, self.delay_sec as u64);
    wire::encode_list(out, &self.actions);
  }
}

impl WireDecode for Transaction {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      expiration: TimePointSec::decode(input)?,
      ref_block_num: u16::decode(input)?,
      ref_block_prefix: u32::decode(input)?,
      max_net_usage_words: wire::get_varuint(input)? as u32,
      max_cpu_usage_ms: u8::decode(input)?,
      delay_sec: wire::get_varuint(input)? as u32,
      actions: wire::decode_list(input)?,
    })
  }
}

/// An ed25519 signature together with the key that produced it.
/// Carrying the key explicitly stands in for key recovery: the
/// "recovered" key set is the set of keys whose signatures verify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureWithKey {
  pub key: Pubkey,
  pub signature: Signature,
}

impl WireEncode for SignatureWithKey {
  fn encode(&self, out: &mut Vec<u8>) {
    self.key.0.encode(out);
    self.signature.to_bytes().encode(out);
  }
}

impl WireDecode for SignatureWithKey {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    let key = Pubkey(<[u8; 32]>::decode(input)?);
    let sig_bytes = <[u8; 64]>::decode(input)?;
    let signature = Signature::from_bytes(&sig_bytes)
      .map_err(|_| WireError::InvalidValue("ed25519 signature"))?;
    Ok(Self { key, signature })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
  pub trx: Transaction,
  pub signatures: Vec<SignatureWithKey>,
}

impl WireEncode for SignedTransaction {
  fn encode(&self, out: &mut Vec<u8>) {
    self.trx.encode(out);
    wire::encode_list(out, &self.signatures);
  }
}

impl WireDecode for SignedTransaction {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      trx: Transaction::decode(input)?,
      signatures: wire::decode_list(input)?,
    })
  }
}

/// A signed transaction frozen into its wire bytes, with the id
/// computed once. This is the form receipts embed and queues carry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedTransaction {
  bytes: Vec<u8>,
  signed: SignedTransaction,
  id: TransactionId,
}

impl PackedTransaction {
  pub fn from_signed(signed: SignedTransaction) -> Self {
    let bytes = signed.to_wire_bytes();
    let id = signed.trx.id();
    Self { bytes, signed, id }
  }

  pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, WireError> {
    let signed = SignedTransaction::from_wire_bytes(&bytes)?;
    let id = signed.trx.id();
    Ok(Self { bytes, signed, id })
  }

  pub fn id(&self) -> &TransactionId {
    &self.id
  }

  pub fn signed(&self) -> &SignedTransaction {
    &self.signed
  }

  pub fn trx(&self) -> &Transaction {
    &self.signed.trx
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn size(&self) -> usize {
    self.bytes.len()
  }
}

impl Debug for PackedTransaction {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PackedTransaction")
      .field("id", &self.id)
      .field("size", &self.bytes.len())
      .field("actions", &self.signed.trx.actions.len())
      .finish()
  }
}

impl WireEncode for PackedTransaction {
  fn encode(&self, out: &mut Vec<u8>) {
    self.bytes.encode(out);
  }
}

impl WireDecode for PackedTransaction {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    PackedTransaction::from_bytes(Vec::<u8>::decode(input)?)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxType {
  Input,
  Implicit,
  Scheduled,
  ReadOnly,
  DryRun,
}

/// Node-local envelope around a transaction while it flows through
/// queues and the pipeline. Shared behind `Arc`: created by the
/// receiver, consumed by the pipeline, cached into the block state
/// after apply so a fork switch need not re-verify signatures.
pub struct TransactionMetadata {
  pub packed: PackedTransaction,
  pub trx_type: TrxType,
  pub accepted: AtomicBool,
  billed_cpu_time_us: AtomicU64,
  recovered_keys: OnceCell<HashSet<Pubkey>>,
}

impl TransactionMetadata {
  pub fn new(packed: PackedTransaction, trx_type: TrxType) -> Self {
    Self {
      packed,
      trx_type,
      accepted: AtomicBool::new(false),
      billed_cpu_time_us: AtomicU64::new(0),
      recovered_keys: OnceCell::new(),
    }
  }

  pub fn id(&self) -> &TransactionId {
    self.packed.id()
  }

  /// Transient transactions never appear in receipts or signals.
  pub fn is_transient(&self) -> bool {
    matches!(self.trx_type, TrxType::ReadOnly | TrxType::DryRun)
  }

  pub fn is_read_only(&self) -> bool {
    matches!(self.trx_type, TrxType::ReadOnly)
  }

  pub fn billed_cpu_time_us(&self) -> u64 {
    self.billed_cpu_time_us.load(Ordering::Relaxed)
  }

  pub fn set_billed_cpu_time_us(&self, us: u64) {
    self.billed_cpu_time_us.store(us, Ordering::Relaxed);
  }

  /// The set of keys whose signatures verify against the signing
  /// digest. Verified once (in parallel) and cached for the lifetime
  /// of the metadata, so a fork switch reuses the result.
  pub fn recovered_keys(&self, chain_id: &Digest) -> &HashSet<Pubkey> {
    self.recovered_keys.get_or_init(|| {
      let digest = self.packed.trx().signing_digest(chain_id);
      self
        .packed
        .signed()
        .signatures
        .par_iter()
        .filter(|s| s.key.verify(digest.as_ref(), &s.signature))
        .map(|s| s.key)
        .collect()
    })
  }
}

impl Debug for TransactionMetadata {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TransactionMetadata")
      .field("id", self.id())
      .field("type", &self.trx_type)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::primitives::Keypair,
    std::time::Duration,
  };

  pub(crate) fn test_transaction(
    signer: &Keypair,
    actor: &str,
    data: &[u8],
  ) -> SignedTransaction {
    let trx = Transaction {
      expiration: TimePointSec(1000).plus(Duration::from_secs(30)),
      ref_block_num: 0,
      ref_block_prefix: 0,
      max_net_usage_words: 0,
      max_cpu_usage_ms: 0,
      delay_sec: 0,
      actions: vec![Action {
        account: "system".parse().unwrap(),
        name: "transfer".to_string(),
        authorization: vec![PermissionLevel::active(actor.parse().unwrap())],
        data: data.to_vec(),
      }],
    };
    let digest = trx.signing_digest(&Digest::default());
    let signature = signer.sign(digest.as_ref());
    SignedTransaction {
      trx,
      signatures: vec![SignatureWithKey { key: signer.public(), signature }],
    }
  }

  #[test]
  fn id_ignores_signatures() {
    let alice = Keypair::from_seed([1u8; 32]);
    let bob = Keypair::from_seed([2u8; 32]);
    let a = test_transaction(&alice, "alice", b"hello");
    let b = SignedTransaction {
      trx: a.trx.clone(),
      signatures: test_transaction(&bob, "alice", b"hello").signatures,
    };
    assert_eq!(a.trx.id(), b.trx.id());
  }

  #[test]
  fn packed_roundtrip() {
    let alice = Keypair::from_seed([1u8; 32]);
    let packed =
      PackedTransaction::from_signed(test_transaction(&alice, "alice", b"hi"));
    let decoded = PackedTransaction::from_bytes(packed.bytes().to_vec()).unwrap();
    assert_eq!(decoded, packed);
    assert_eq!(decoded.id(), packed.id());
  }

  #[test]
  fn recovered_keys_are_verified_signatures() {
    let alice = Keypair::from_seed([1u8; 32]);
    let signed = test_transaction(&alice, "alice", b"hello");
    let meta = TransactionMetadata::new(
      PackedTransaction::from_signed(signed),
      TrxType::Input,
    );

    let keys = meta.recovered_keys(&Digest::default());
    assert_eq!(keys.len(), 1);
    assert!(keys.contains(&alice.public()));

    // wrong chain id: the signature no longer verifies
    let meta2 = TransactionMetadata::new(meta.packed.clone(), TrxType::Input);
    assert!(meta2.recovered_keys(&Digest::of(b"other chain")).is_empty());
  }

  #[test]
  fn transient_classification() {
    let alice = Keypair::from_seed([1u8; 32]);
    let packed =
      PackedTransaction::from_signed(test_transaction(&alice, "alice", b""));
    assert!(
      TransactionMetadata::new(packed.clone(), TrxType::ReadOnly).is_transient()
    );
    assert!(
      !TransactionMetadata::new(packed, TrxType::Input).is_transient()
    );
  }
}
