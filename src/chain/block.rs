//! Block headers, receipts and the signed block wire format.

use {
  super::transaction::PackedTransaction,
  crate::primitives::{
    wire::{self, WireDecode, WireEncode, WireError},
    AccountName,
    BlockId,
    BlockTimestamp,
    Digest,
    Pubkey,
    TransactionId,
  },
  ed25519_dalek::Signature,
  serde::{Deserialize, Serialize},
};

/// Consecutive blocks a producer gets before the schedule rotates to
/// the next one.
pub const PRODUCER_REPETITIONS: u32 = 12;

/// Header-extension id listing the protocol features a block
/// activates, in activation order.
pub const FEATURE_ACTIVATION_EXTENSION_ID: u16 = 1;

/// Header-extension id carrying the finality activation payload
/// (qc claim and optionally a new finalizer policy).
pub const FINALITY_EXTENSION_ID: u16 = 2;

/// Block-extension id carrying an aggregated quorum certificate.
pub const QC_EXTENSION_ID: u16 = 3;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct KeyWeight {
  pub key: Pubkey,
  pub weight: u16,
}

impl WireEncode for KeyWeight {
  fn encode(&self, out: &mut Vec<u8>) {
    self.key.0.encode(out);
    self.weight.encode(out);
  }
}

impl WireDecode for KeyWeight {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      key: Pubkey(<[u8; 32]>::decode(input)?),
      weight: u16::decode(input)?,
    })
  }
}

/// The signing authority of one scheduled producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerAuthority {
  pub producer_name: AccountName,
  pub threshold: u32,
  pub keys: Vec<KeyWeight>,
}

impl ProducerAuthority {
  pub fn single(producer_name: AccountName, key: Pubkey) -> Self {
    Self {
      producer_name,
      threshold: 1,
      keys: vec![KeyWeight { key, weight: 1 }],
    }
  }

  /// Checks that a block signature over `digest` satisfies this
  /// authority: the signing key must be listed and its weight must
  /// meet the threshold on its own (blocks carry one signature).
  pub fn signature_satisfies(&self, digest: &Digest, sig: &Signature) -> bool {
    self
      .keys
      .iter()
      .any(|kw| {
        kw.weight as u32 >= self.threshold
          && kw.key.verify(digest.as_ref(), sig)
      })
  }
}

impl WireEncode for ProducerAuthority {
  fn encode(&self, out: &mut Vec<u8>) {
    self.producer_name.encode(out);
    self.threshold.encode(out);
    wire::encode_list(out, &self.keys);
  }
}

impl WireDecode for ProducerAuthority {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      producer_name: AccountName::decode(input)?,
      threshold: u32::decode(input)?,
      keys: wire::decode_list(input)?,
    })
  }
}

/// A versioned list of producers in rotation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerSchedule {
  pub version: u32,
  pub producers: Vec<ProducerAuthority>,
}

impl ProducerSchedule {
  /// The producer whose turn covers a given slot. Each producer
  /// holds the slot for [`PRODUCER_REPETITIONS`] consecutive blocks.
  pub fn producer_for(&self, slot: BlockTimestamp) -> &ProducerAuthority {
    let index = (slot.0 / PRODUCER_REPETITIONS) as usize % self.producers.len();
    &self.producers[index]
  }

  pub fn authority_of(&self, name: &AccountName) -> Option<&ProducerAuthority> {
    self.producers.iter().find(|p| p.producer_name == *name)
  }
}

impl WireEncode for ProducerSchedule {
  fn encode(&self, out: &mut Vec<u8>) {
    self.version.encode(out);
    wire::encode_list(out, &self.producers);
  }
}

impl WireDecode for ProducerSchedule {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      version: u32::decode(input)?,
      producers: wire::decode_list(input)?,
    })
  }
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum TransactionStatus {
  Executed,
  SoftFail,
  HardFail,
  Delayed,
  Expired,
}

impl WireEncode for TransactionStatus {
  fn encode(&self, out: &mut Vec<u8>) {
    let tag: u8 = match self {
      TransactionStatus::Executed => 0,
      TransactionStatus::SoftFail => 1,
      TransactionStatus::HardFail => 2,
      TransactionStatus::Delayed => 3,
      TransactionStatus::Expired => 4,
    };
    tag.encode(out);
  }
}

impl WireDecode for TransactionStatus {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(match u8::decode(input)? {
      0 => TransactionStatus::Executed,
      1 => TransactionStatus::SoftFail,
      2 => TransactionStatus::HardFail,
      3 => TransactionStatus::Delayed,
      4 => TransactionStatus::Expired,
      value => {
        return Err(WireError::InvalidDiscriminant {
          what: "transaction status",
          value,
        })
      }
    })
  }
}

/// What a receipt embeds: either the full packed transaction or an
/// id reference to a previously scheduled deferred transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptTrx {
  Id(TransactionId),
  Packed(PackedTransaction),
}

impl ReceiptTrx {
  pub fn id(&self) -> TransactionId {
    match self {
      ReceiptTrx::Id(id) => *id,
      ReceiptTrx::Packed(packed) => *packed.id(),
    }
  }

  fn digest(&self) -> Digest {
    match self {
      ReceiptTrx::Id(id) => *id,
      ReceiptTrx::Packed(packed) => Digest::of(packed.bytes()),
    }
  }
}

impl WireEncode for ReceiptTrx {
  fn encode(&self, out: &mut Vec<u8>) {
    match self {
      ReceiptTrx::Id(id) => {
        0u8.encode(out);
        id.encode(out);
      }
      ReceiptTrx::Packed(packed) => {
        1u8.encode(out);
        packed.encode(out);
      }
    }
  }
}

impl WireDecode for ReceiptTrx {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    match u8::decode(input)? {
      0 => Ok(ReceiptTrx::Id(TransactionId::decode(input)?)),
      1 => Ok(ReceiptTrx::Packed(PackedTransaction::decode(input)?)),
      value => Err(WireError::InvalidDiscriminant {
        what: "receipt transaction",
        value,
      }),
    }
  }
}

/// The authoritative record a block carries for each transaction it
/// processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
  pub status: TransactionStatus,
  pub cpu_usage_us: u32,
  pub net_usage_words: u32,
  pub trx: ReceiptTrx,
}

impl TransactionReceipt {
  /// Leaf digest for the transaction merkle root: the receipt header
  /// with the embedded transaction collapsed to its digest.
  pub fn digest(&self) -> Digest {
    let mut bytes = Vec::new();
    self.status.encode(&mut bytes);
    self.cpu_usage_us.encode(&mut bytes);
    wire::put_varuint(&mut bytes, self.net_usage_words as u64);
    self.trx.digest().encode(&mut bytes);
    Digest::of(bytes)
  }
}

impl WireEncode for TransactionReceipt {
  fn encode(&self, out: &mut Vec<u8>) {
    self.status.encode(out);
    self.cpu_usage_us.encode(out);
    wire::put_varuint(out, self.net_usage_words as u64);
    self.trx.encode(out);
  }
}

impl WireDecode for TransactionReceipt {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      status: TransactionStatus::decode(input)?,
      cpu_usage_us: u32::decode(input)?,
      net_usage_words: wire::get_varuint(input)? as u32,
      trx: ReceiptTrx::decode(input)?,
    })
  }
}

/// A tagged extension blob carried by headers and blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
  pub id: u16,
  pub data: Vec<u8>,
}

impl WireEncode for Extension {
  fn encode(&self, out: &mut Vec<u8>) {
    self.id.encode(out);
    self.data.encode(out);
  }
}

impl WireDecode for Extension {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self { id: u16::decode(input)?, data: Vec::<u8>::decode(input)? })
  }
}

pub fn find_extension(extensions: &[Extension], id: u16) -> Option<&Extension> {
  extensions.iter().find(|e| e.id == id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
  pub timestamp: BlockTimestamp,
  pub producer: AccountName,
  /// How many of its predecessors this producer confirms. Retained
  /// for the legacy wire layout; irreversibility is driven by the
  /// per-producer watermarks in the block state.
  pub confirmed: u16,
  pub previous: BlockId,
  pub transaction_mroot: Digest,
  pub action_mroot: Digest,
  pub schedule_version: u32,
  pub new_producers: Option<ProducerSchedule>,
  pub header_extensions: Vec<Extension>,
}

impl BlockHeader {
  pub fn block_num(&self) -> u32 {
    self.previous.num() + 1
  }

  pub fn digest(&self) -> Digest {
    Digest::of(self.to_wire_bytes())
  }

  pub fn id(&self) -> BlockId {
    BlockId::new(self.block_num(), self.digest())
  }

  pub fn finality_extension(&self) -> Option<&Extension> {
    find_extension(&self.header_extensions, FINALITY_EXTENSION_ID)
  }

  /// The protocol features this block activates, decoded from the
  /// feature-activation header extension.
  pub fn new_feature_activations(&self) -> Result<Vec<Digest>, WireError> {
    match find_extension(&self.header_extensions, FEATURE_ACTIVATION_EXTENSION_ID)
    {
      None => Ok(vec![]),
      Some(extension) => {
        let mut input = extension.data.as_slice();
        let features = wire::decode_list(&mut input)?;
        if !input.is_empty() {
          return Err(WireError::TrailingBytes(input.len()));
        }
        Ok(features)
      }
    }
  }
}

/// Builds the feature-activation header extension.
pub fn feature_activation_extension(features: &[Digest]) -> Extension {
  let mut data = Vec::new();
  wire::encode_list(&mut data, features);
  Extension { id: FEATURE_ACTIVATION_EXTENSION_ID, data }
}

impl WireEncode for BlockHeader {
  fn encode(&self, out: &mut Vec<u8>) {
    self.timestamp.encode(out);
    self.producer.encode(out);
    self.confirmed.encode(out);
    self.previous.encode(out);
    self.transaction_mroot.encode(out);
    self.action_mroot.encode(out);
    self.schedule_version.encode(out);
    self.new_producers.encode(out);
    wire::encode_list(out, &self.header_extensions);
  }
}

impl WireDecode for BlockHeader {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      timestamp: BlockTimestamp::decode(input)?,
      producer: AccountName::decode(input)?,
      confirmed: u16::decode(input)?,
      previous: BlockId::decode(input)?,
      transaction_mroot: Digest::decode(input)?,
      action_mroot: Digest::decode(input)?,
      schedule_version: u32::decode(input)?,
      new_producers: Option::<ProducerSchedule>::decode(input)?,
      header_extensions: wire::decode_list(input)?,
    })
  }
}

/// A complete block as it travels between nodes and into the block
/// log: header, producer signature, receipts, block extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlock {
  pub header: BlockHeader,
  pub producer_signature: Signature,
  pub transactions: Vec<TransactionReceipt>,
  pub block_extensions: Vec<Extension>,
}

impl SignedBlock {
  pub fn id(&self) -> BlockId {
    self.header.id()
  }

  pub fn block_num(&self) -> u32 {
    self.header.block_num()
  }

  pub fn qc_extension(&self) -> Option<&Extension> {
    find_extension(&self.block_extensions, QC_EXTENSION_ID)
  }
}

impl WireEncode for SignedBlock {
  fn encode(&self, out: &mut Vec<u8>) {
    self.header.encode(out);
    self.producer_signature.to_bytes().encode(out);
    wire::encode_list(out, &self.transactions);
    wire::encode_list(out, &self.block_extensions);
  }
}

impl WireDecode for SignedBlock {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    let header = BlockHeader::decode(input)?;
    let sig_bytes = <[u8; 64]>::decode(input)?;
    let producer_signature = Signature::from_bytes(&sig_bytes)
      .map_err(|_| WireError::InvalidValue("producer signature"))?;
    Ok(Self {
      header,
      producer_signature,
      transactions: wire::decode_list(input)?,
      block_extensions: wire::decode_list(input)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::primitives::Keypair,
  };

  fn test_header() -> BlockHeader {
    BlockHeader {
      timestamp: BlockTimestamp(100),
      producer: "prod.a".parse().unwrap(),
      confirmed: 0,
      previous: BlockId::new(7, Digest::of(b"prev")),
      transaction_mroot: Digest::default(),
      action_mroot: Digest::of(b"actions"),
      schedule_version: 1,
      new_producers: None,
      header_extensions: vec![],
    }
  }

  #[test]
  fn block_num_follows_previous() {
    let header = test_header();
    assert_eq!(header.block_num(), 8);
    assert_eq!(header.id().num(), 8);
  }

  #[test]
  fn header_roundtrip() {
    let mut header = test_header();
    header.header_extensions.push(Extension {
      id: FINALITY_EXTENSION_ID,
      data: vec![1, 2, 3],
    });
    let decoded =
      BlockHeader::from_wire_bytes(&header.to_wire_bytes()).unwrap();
    assert_eq!(decoded, header);
    assert_eq!(decoded.id(), header.id());
    assert!(decoded.finality_extension().is_some());
  }

  #[test]
  fn signed_block_roundtrip() {
    let producer = Keypair::from_seed([5u8; 32]);
    let header = test_header();
    let signature = producer.sign(header.digest().as_ref());
    let block = SignedBlock {
      header,
      producer_signature: signature,
      transactions: vec![TransactionReceipt {
        status: TransactionStatus::Executed,
        cpu_usage_us: 120,
        net_usage_words: 3,
        trx: ReceiptTrx::Id(Digest::of(b"trx")),
      }],
      block_extensions: vec![],
    };

    let decoded = SignedBlock::from_wire_bytes(&block.to_wire_bytes()).unwrap();
    assert_eq!(decoded, block);
  }

  #[test]
  fn receipt_digest_collapses_packed_trx() {
    let id = Digest::of(b"trx");
    let by_id = TransactionReceipt {
      status: TransactionStatus::Executed,
      cpu_usage_us: 1,
      net_usage_words: 1,
      trx: ReceiptTrx::Id(id),
    };
    // same header, different status must change the digest
    let hard_fail = TransactionReceipt {
      status: TransactionStatus::HardFail,
      ..by_id.clone()
    };
    assert_ne!(by_id.digest(), hard_fail.digest());
  }

  #[test]
  fn schedule_rotates_every_repetition_window() {
    let schedule = ProducerSchedule {
      version: 1,
      producers: vec![
        ProducerAuthority::single(
          "prod.a".parse().unwrap(),
          Keypair::from_seed([1u8; 32]).public(),
        ),
        ProducerAuthority::single(
          "prod.b".parse().unwrap(),
          Keypair::from_seed([2u8; 32]).public(),
        ),
      ],
    };

    let first = schedule.producer_for(BlockTimestamp(0));
    let same_window =
      schedule.producer_for(BlockTimestamp(PRODUCER_REPETITIONS - 1));
    let next_window = schedule.producer_for(BlockTimestamp(PRODUCER_REPETITIONS));

    assert_eq!(first.producer_name, same_window.producer_name);
    assert_ne!(first.producer_name, next_window.producer_name);
  }

  #[test]
  fn authority_checks_signature() {
    let producer = Keypair::from_seed([5u8; 32]);
    let other = Keypair::from_seed([6u8; 32]);
    let authority =
      ProducerAuthority::single("prod.a".parse().unwrap(), producer.public());

    let digest = Digest::of(b"header");
    assert!(authority
      .signature_satisfies(&digest, &producer.sign(digest.as_ref())));
    assert!(!authority
      .signature_satisfies(&digest, &other.sign(digest.as_ref())));
  }
}
