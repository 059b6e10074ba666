use {
  super::{
    hex::{from_hex, ToHexString},
    wire::{WireDecode, WireEncode, WireError},
  },
  multihash::{Sha2_256, StatefulHasher},
  serde::{Deserialize, Serialize},
  std::{
    fmt::{Debug, Display, Formatter},
    str::FromStr,
  },
};

/// A SHA-256 digest over some consensus object.
#[derive(
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Default,
  Serialize,
  Deserialize,
)]
pub struct Digest(pub [u8; 32]);

/// Transaction ids are plain digests of the unsigned transaction bytes.
pub type TransactionId = Digest;

impl Digest {
  /// Hashes an arbitrary byte string.
  pub fn of(bytes: impl AsRef<[u8]>) -> Self {
    let mut hasher = Sha2_256::default();
    hasher.update(bytes.as_ref());
    let mut out = [0u8; 32];
    out.copy_from_slice(hasher.finalize().as_ref());
    Digest(out)
  }

  /// Hashes the concatenation of two digests. This is the node
  /// function of every merkle structure in the chain.
  pub fn combine(left: &Digest, right: &Digest) -> Self {
    let mut hasher = Sha2_256::default();
    hasher.update(&left.0);
    hasher.update(&right.0);
    let mut out = [0u8; 32];
    out.copy_from_slice(hasher.finalize().as_ref());
    Digest(out)
  }

  pub fn is_zero(&self) -> bool {
    self.0 == [0u8; 32]
  }
}

impl AsRef<[u8]> for Digest {
  fn as_ref(&self) -> &[u8] {
    &self.0
  }
}

impl Display for Digest {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0.to_hex())
  }
}

impl Debug for Digest {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Digest({})", self.0.to_hex())
  }
}

impl FromStr for Digest {
  type Err = WireError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    from_hex::<32>(s)
      .map(Digest)
      .ok_or(WireError::InvalidValue("hex digest"))
  }
}

impl WireEncode for Digest {
  fn encode(&self, out: &mut Vec<u8>) {
    self.0.encode(out);
  }
}

impl WireDecode for Digest {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Digest(<[u8; 32]>::decode(input)?))
  }
}

/// A block id is the SHA-256 digest of the block header with the
/// first 32 bits replaced by the big-endian block number, so that
/// id → number is a constant-time prefix read.
#[derive(
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Default,
  Serialize,
  Deserialize,
)]
pub struct BlockId(pub [u8; 32]);

impl BlockId {
  pub fn new(block_num: u32, digest: Digest) -> Self {
    let mut bytes = digest.0;
    bytes[..4].copy_from_slice(&block_num.to_be_bytes());
    BlockId(bytes)
  }

  /// The block number embedded in the first four bytes of the id.
  pub fn num(&self) -> u32 {
    u32::from_be_bytes(self.0[..4].try_into().unwrap())
  }

  /// The 32-bit slice of the id used by transactions as their
  /// reference-block prefix binding (TaPoS).
  pub fn ref_prefix(&self) -> u32 {
    u32::from_le_bytes(self.0[8..12].try_into().unwrap())
  }

  pub fn is_zero(&self) -> bool {
    self.0 == [0u8; 32]
  }
}

impl AsRef<[u8]> for BlockId {
  fn as_ref(&self) -> &[u8] {
    &self.0
  }
}

impl Display for BlockId {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0.to_hex())
  }
}

impl Debug for BlockId {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "BlockId(#{} {})", self.num(), self.0.to_hex())
  }
}

impl FromStr for BlockId {
  type Err = WireError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    from_hex::<32>(s)
      .map(BlockId)
      .ok_or(WireError::InvalidValue("hex block id"))
  }
}

impl WireEncode for BlockId {
  fn encode(&self, out: &mut Vec<u8>) {
    self.0.encode(out);
  }
}

impl WireDecode for BlockId {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(BlockId(<[u8; 32]>::decode(input)?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn digest_is_deterministic() {
    let a = Digest::of(b"hello");
    let b = Digest::of(b"hello");
    let c = Digest::of(b"world");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(
      a.to_string(),
      "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
  }

  #[test]
  fn combine_orders_operands() {
    let a = Digest::of(b"a");
    let b = Digest::of(b"b");
    assert_ne!(Digest::combine(&a, &b), Digest::combine(&b, &a));
  }

  #[test]
  fn block_num_prefix() {
    let id = BlockId::new(0xaabbccdd, Digest::of(b"header"));
    assert_eq!(id.num(), 0xaabbccdd);
    assert_eq!(&id.0[..4], &[0xaa, 0xbb, 0xcc, 0xdd]);
    // the tail of the digest is preserved
    assert_eq!(&id.0[4..], &Digest::of(b"header").0[4..]);
  }

  #[test]
  fn hex_parse_roundtrip() {
    let id = BlockId::new(17, Digest::of(b"x"));
    let parsed: BlockId = id.to_string().parse().unwrap();
    assert_eq!(parsed, id);
    assert_eq!(parsed.num(), 17);
  }
}
