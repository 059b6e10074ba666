//! Row types of the chain-state database.
//!
//! Everything here participates in consensus: rows are mutated only
//! inside undo sessions and are serialized verbatim into snapshots.

use {
  crate::{
    chain::{block::ProducerSchedule, finality::FinalizerPolicy},
    primitives::{
      AccountName,
      BlockTimestamp,
      Digest,
      Pubkey,
      TimePointSec,
      TransactionId,
    },
  },
  serde::{Deserialize, Serialize},
  std::collections::BTreeSet,
};

/// A chain account: its authorization key, optional contract code
/// and privilege flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountObject {
  pub name: AccountName,
  pub key: Pubkey,
  /// Zero digest when the account carries no contract.
  pub code_hash: Digest,
  pub privileged: bool,
  pub created: BlockTimestamp,
  /// Count of actions this account has received, stamped into every
  /// action receipt addressed to it.
  pub recv_sequence: u64,
}

/// Consensus-critical resource ceilings, adjustable by privileged
/// contracts through the blockchain-parameters intrinsics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
  pub max_block_net_usage: u64,
  pub max_block_cpu_usage_us: u32,
  pub max_transaction_net_usage: u64,
  pub max_transaction_cpu_usage_us: u32,
  pub min_transaction_cpu_usage_us: u32,
  pub base_per_transaction_net_usage: u32,
}

impl Default for ChainParams {
  fn default() -> Self {
    Self {
      max_block_net_usage: 1024 * 1024,
      max_block_cpu_usage_us: 200_000,
      max_transaction_net_usage: 512 * 1024,
      max_transaction_cpu_usage_us: 150_000,
      min_transaction_cpu_usage_us: 100,
      base_per_transaction_net_usage: 12,
    }
  }
}

/// A producer schedule proposed by the system contract, waiting for
/// the block that proposed it to become irreversible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedSchedule {
  pub proposed_in: u32,
  pub schedule: ProducerSchedule,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalProperties {
  pub chain_id: Digest,
  pub params: ChainParams,
  pub proposed_schedule: Option<ProposedSchedule>,
  /// Set by the `set_finalizers` intrinsic; drained into the header
  /// extension of the next assembled block.
  pub proposed_finalizer_policy: Option<FinalizerPolicy>,
  /// Monotonic counter stamped on every action receipt.
  pub global_action_sequence: u64,
}

/// A protocol feature that has been activated, with the block that
/// activated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivatedFeature {
  pub feature_digest: Digest,
  pub activation_block_num: u32,
}

/// The protocol-state singleton: which consensus upgrades are live
/// and which intrinsics contracts may call because of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolState {
  pub activated: Vec<ActivatedFeature>,
  pub preactivated: Vec<Digest>,
  pub whitelisted_intrinsics: BTreeSet<String>,
  pub num_supported_key_types: u32,
  /// Armed by the instant-finality activation handler; the finality
  /// flavor takes over once a finalizer policy becomes active.
  pub finality_transition_armed: bool,
}

impl Default for ProtocolState {
  fn default() -> Self {
    Self {
      activated: Vec::new(),
      preactivated: Vec::new(),
      whitelisted_intrinsics: BTreeSet::new(),
      num_supported_key_types: 2,
      finality_transition_armed: false,
    }
  }
}

impl ProtocolState {
  pub fn is_activated(&self, digest: &Digest) -> bool {
    self.activated.iter().any(|f| f.feature_digest == *digest)
  }
}

/// A deferred transaction queued in the generated-transaction table
/// until its delay elapses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTransaction {
  pub trx_id: TransactionId,
  pub sender: AccountName,
  pub payer: AccountName,
  pub delay_until: TimePointSec,
  pub expiration: TimePointSec,
  pub published: BlockTimestamp,
  /// Wire bytes of the embedded signed transaction.
  pub packed_trx: Vec<u8>,
}

/// Exponentially decaying usage average, in the style of a moving
/// window: every accumulation first ages the running value by the
/// number of slots elapsed since the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageAccumulator {
  pub last_ordinal: u32,
  /// Average scaled by [`UsageAccumulator::PRECISION`].
  pub value_ex: u64,
  /// Raw units consumed in the current window slot.
  pub consumed: u64,
}

impl UsageAccumulator {
  pub const PRECISION: u64 = 1_000_000;

  pub fn add(&mut self, units: u64, ordinal: u32, window_slots: u32) {
    if self.last_ordinal != ordinal {
      if self.last_ordinal + window_slots > ordinal {
        let elapsed = (ordinal - self.last_ordinal) as u64;
        let decay = self.value_ex / window_slots as u64 * elapsed;
        self.value_ex = self.value_ex.saturating_sub(decay);
      } else {
        self.value_ex = 0;
      }
      self.last_ordinal = ordinal;
      self.consumed = self.average();
    }
    self.consumed = self.consumed.saturating_add(units);
    let added = units as u128 * Self::PRECISION as u128 / window_slots as u128;
    self.value_ex =
      self.value_ex.saturating_add(added.min(u64::MAX as u128) as u64);
  }

  pub fn average(&self) -> u64 {
    self.value_ex / Self::PRECISION
  }
}

/// Per-account resource bookkeeping: decayed usage plus staked
/// weights. A negative weight means the resource is unmetered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUsage {
  pub net: UsageAccumulator,
  pub cpu: UsageAccumulator,
  pub net_weight: i64,
  pub cpu_weight: i64,
}

impl Default for AccountUsage {
  fn default() -> Self {
    Self {
      net: UsageAccumulator::default(),
      cpu: UsageAccumulator::default(),
      net_weight: -1,
      cpu_weight: -1,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::UsageAccumulator;

  #[test]
  fn accumulator_decays_over_window() {
    let mut acc = UsageAccumulator::default();
    acc.add(1000, 1, 10);
    let initial = acc.value_ex;
    assert_eq!(acc.average(), 100);

    // half the window elapses, roughly half the average decays
    acc.add(0, 6, 10);
    assert!(acc.value_ex < initial);
    assert!(acc.value_ex >= initial / 2 - 1);

    // a full window with no activity clears it
    acc.add(0, 20, 10);
    assert_eq!(acc.value_ex, 0);
  }

  #[test]
  fn accumulator_same_ordinal_accumulates() {
    let mut acc = UsageAccumulator::default();
    acc.add(100, 5, 10);
    acc.add(100, 5, 10);
    assert_eq!(acc.consumed, 200);
  }
}
