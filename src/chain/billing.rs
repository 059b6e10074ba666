//! Subjective billing and the per-account failure limiter.
//!
//! Both are producer-local defenses, never consensus: subjective
//! billing charges an account for cpu it consumed in transactions
//! that failed or are still pending somewhere, so one account cannot
//! starve the node; the failure limiter stops re-validating
//! transactions from an account that keeps failing inside the
//! current block window.

use {
  crate::{
    primitives::{AccountName, TransactionId},
    state::UsageAccumulator,
  },
  indexmap::IndexMap,
  std::collections::HashMap,
  tracing::debug,
};

/// Half-second slots per minute of decay window.
const SLOTS_PER_MINUTE: u32 = 120;

pub struct SubjectiveBilling {
  accounts: IndexMap<AccountName, UsageAccumulator>,
  /// Per-transaction amounts still outstanding, so a transaction that
  /// later makes it into an accepted block can be un-billed.
  pending: HashMap<TransactionId, (AccountName, u64)>,
  window_slots: u32,
  disabled: bool,
}

impl SubjectiveBilling {
  pub fn new(decay_time_minutes: u32, disabled: bool) -> Self {
    Self {
      accounts: IndexMap::new(),
      pending: HashMap::new(),
      window_slots: decay_time_minutes.max(1) * SLOTS_PER_MINUTE,
      disabled,
    }
  }

  pub fn disabled(&self) -> bool {
    self.disabled
  }

  /// Charges `elapsed_us` of failed/pending cpu to the account.
  pub fn bill(
    &mut self,
    id: TransactionId,
    account: &AccountName,
    elapsed_us: u64,
    now_slot: u32,
  ) {
    if self.disabled || elapsed_us == 0 {
      return;
    }
    let acc = self.accounts.entry(account.clone()).or_default();
    acc.add(elapsed_us, now_slot, self.window_slots);
    self.pending.insert(id, (account.clone(), elapsed_us));
  }

  /// Reverses the outstanding charge for a transaction that ended up
  /// in an accepted block (it is objectively billed there).
  pub fn on_included(&mut self, id: &TransactionId, now_slot: u32) {
    if let Some((account, us)) = self.pending.remove(id) {
      if let Some(acc) = self.accounts.get_mut(&account) {
        let refund_ex = us.saturating_mul(UsageAccumulator::PRECISION)
          / self.window_slots as u64;
        acc.value_ex = acc.value_ex.saturating_sub(refund_ex);
        acc.add(0, now_slot, self.window_slots);
        debug!("unbilled {us}us of subjective cpu from {account}");
      }
    }
  }

  /// The account's current (decayed) subjective bill in microseconds
  /// over the window.
  pub fn get_bill_us(&mut self, account: &AccountName, now_slot: u32) -> u64 {
    if self.disabled {
      return 0;
    }
    match self.accounts.get_mut(account) {
      Some(acc) => {
        acc.add(0, now_slot, self.window_slots);
        acc.value_ex * self.window_slots as u64 / UsageAccumulator::PRECISION
      }
      None => 0,
    }
  }

  /// Drops fully decayed accounts; called from start-block eviction.
  pub fn evict_decayed(&mut self, now_slot: u32) {
    let window = self.window_slots;
    self.accounts.retain(|_, acc| {
      acc.add(0, now_slot, window);
      acc.value_ex > 0
    });
  }
}

/// Counts transaction failures per first-authorizer within a rolling
/// window of blocks; accounts over the threshold are refused locally
/// until the window rolls over.
pub struct FailureTracker {
  max_failures: u32,
  window_blocks: u32,
  window_start: u32,
  counts: HashMap<AccountName, u32>,
}

impl FailureTracker {
  pub fn new(max_failures: u32, window_blocks: u32) -> Self {
    Self {
      max_failures,
      window_blocks: window_blocks.max(1),
      window_start: 0,
      counts: HashMap::new(),
    }
  }

  fn roll(&mut self, block_num: u32) {
    if block_num >= self.window_start + self.window_blocks {
      self.window_start = block_num;
      self.counts.clear();
    }
  }

  pub fn add_failure(&mut self, account: &AccountName, block_num: u32) {
    self.roll(block_num);
    *self.counts.entry(account.clone()).or_insert(0) += 1;
  }

  pub fn is_blocked(&mut self, account: &AccountName, block_num: u32) -> bool {
    self.roll(block_num);
    self
      .counts
      .get(account)
      .map_or(false, |count| *count >= self.max_failures)
  }
}
