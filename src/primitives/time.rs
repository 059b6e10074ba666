use {
  super::wire::{WireDecode, WireEncode, WireError},
  chrono::{DateTime, TimeZone, Utc},
  serde::{Deserialize, Serialize},
  std::{
    fmt::{Debug, Display, Formatter},
    time::Duration,
  },
};

/// Milliseconds between two consecutive block slots.
pub const BLOCK_INTERVAL_MS: u64 = 500;

/// 2000-01-01T00:00:00Z, the epoch of block timestamps, in unix millis.
pub const BLOCK_TIMESTAMP_EPOCH_MS: i64 = 946_684_800_000;

/// A block timestamp counts half-second slots since the chain epoch.
///
/// Slot arithmetic (rather than raw wall clock) keeps producer
/// scheduling and header validation integer-exact on every node.
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
pub struct BlockTimestamp(pub u32);

impl BlockTimestamp {
  pub fn from_datetime(when: DateTime<Utc>) -> Self {
    let elapsed_ms = when.timestamp_millis() - BLOCK_TIMESTAMP_EPOCH_MS;
    BlockTimestamp((elapsed_ms.max(0) as u64 / BLOCK_INTERVAL_MS) as u32)
  }

  pub fn to_datetime(self) -> DateTime<Utc> {
    let ms = BLOCK_TIMESTAMP_EPOCH_MS + (self.0 as i64) * 500;
    Utc.timestamp_millis_opt(ms).unwrap()
  }

  pub fn next(self) -> Self {
    BlockTimestamp(self.0 + 1)
  }

  /// Number of whole slots between two timestamps, zero if `earlier`
  /// is not actually earlier.
  pub fn slots_since(self, earlier: BlockTimestamp) -> u32 {
    self.0.saturating_sub(earlier.0)
  }
}

impl Display for BlockTimestamp {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.to_datetime().format("%Y-%m-%dT%H:%M:%S%.3f"))
  }
}

impl Debug for BlockTimestamp {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "BlockTimestamp({} slot {})", self, self.0)
  }
}

impl WireEncode for BlockTimestamp {
  fn encode(&self, out: &mut Vec<u8>) {
    self.0.encode(out);
  }
}

impl WireDecode for BlockTimestamp {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(BlockTimestamp(u32::decode(input)?))
  }
}

/// Second-resolution wall-clock time, used for transaction expiration
/// and the dedup index. Stored as unix seconds.
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
pub struct TimePointSec(pub u32);

impl TimePointSec {
  pub fn from_datetime(when: DateTime<Utc>) -> Self {
    TimePointSec(when.timestamp().max(0) as u32)
  }

  pub fn to_datetime(self) -> DateTime<Utc> {
    Utc.timestamp_opt(self.0 as i64, 0).unwrap()
  }

  pub fn plus(self, duration: Duration) -> Self {
    TimePointSec(self.0.saturating_add(duration.as_secs() as u32))
  }
}

impl From<BlockTimestamp> for TimePointSec {
  fn from(slot: BlockTimestamp) -> Self {
    TimePointSec::from_datetime(slot.to_datetime())
  }
}

impl Display for TimePointSec {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.to_datetime().format("%Y-%m-%dT%H:%M:%S"))
  }
}

impl Debug for TimePointSec {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "TimePointSec({})", self)
  }
}

impl WireEncode for TimePointSec {
  fn encode(&self, out: &mut Vec<u8>) {
    self.0.encode(out);
  }
}

impl WireDecode for TimePointSec {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(TimePointSec(u32::decode(input)?))
  }
}

#[cfg(test)]
mod tests {
  use {super::*, chrono::Duration as ChronoDuration};

  #[test]
  fn epoch_is_slot_zero() {
    let epoch = Utc.timestamp_millis_opt(BLOCK_TIMESTAMP_EPOCH_MS).unwrap();
    assert_eq!(BlockTimestamp::from_datetime(epoch), BlockTimestamp(0));
    assert_eq!(BlockTimestamp(0).to_datetime(), epoch);
  }

  #[test]
  fn slots_are_half_seconds() {
    let epoch = Utc.timestamp_millis_opt(BLOCK_TIMESTAMP_EPOCH_MS).unwrap();
    let later = epoch + ChronoDuration::milliseconds(1500);
    let slot = BlockTimestamp::from_datetime(later);
    assert_eq!(slot, BlockTimestamp(3));
    assert_eq!(slot.slots_since(BlockTimestamp(1)), 2);
    assert_eq!(BlockTimestamp(1).slots_since(slot), 0);
  }

  #[test]
  fn expiration_roundtrip() {
    let now = TimePointSec(1_700_000_000);
    let exp = now.plus(Duration::from_secs(30));
    assert_eq!(exp.0, 1_700_000_030);
    assert_eq!(TimePointSec::from_datetime(exp.to_datetime()), exp);
  }
}
