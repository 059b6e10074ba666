//! Objective resource accounting.
//!
//! CPU and NET spent by executed transactions accumulate per account
//! into exponentially decaying windows stored in the database (so the
//! numbers are consensus state and roll back with the transaction's
//! undo session). An account's allowance is its staked weight's share
//! of the chain-wide capacity over one averaging window.

use {
  super::{database::Database, objects::AccountUsage},
  crate::primitives::AccountName,
  thiserror::Error,
};

/// Averaging window for per-account usage: 24 hours of half-second
/// slots.
pub const ACCOUNT_USAGE_WINDOW_SLOTS: u32 = 172_800;

#[derive(Debug, Error)]
pub enum ResourceError {
  #[error("account {account} has insufficient cpu ({used_us}us of {allowance_us}us window allowance)")]
  TxCpuExceeded {
    account: AccountName,
    used_us: u64,
    allowance_us: u64,
  },

  #[error("account {account} has insufficient net ({used} of {allowance} byte window allowance)")]
  TxNetExceeded {
    account: AccountName,
    used: u64,
    allowance: u64,
  },
}

fn used_in_window(acc: &crate::state::UsageAccumulator) -> u64 {
  let used = acc.value_ex as u128 * ACCOUNT_USAGE_WINDOW_SLOTS as u128
    / crate::state::UsageAccumulator::PRECISION as u128;
  used.min(u64::MAX as u128) as u64
}

impl Database {
  pub fn set_account_limits(
    &mut self,
    name: &AccountName,
    net_weight: i64,
    cpu_weight: i64,
  ) {
    self.modify_usage(name, |usage| {
      usage.net_weight = net_weight;
      usage.cpu_weight = cpu_weight;
    });
  }

  fn total_weights(&self) -> (i64, i64) {
    let mut totals = (0i64, 0i64);
    for account in self.accounts() {
      if let Some(usage) = self.usage(&account.name) {
        if usage.net_weight > 0 {
          totals.0 += usage.net_weight;
        }
        if usage.cpu_weight > 0 {
          totals.1 += usage.cpu_weight;
        }
      }
    }
    totals
  }

  fn cpu_allowance_us(&self, usage: &AccountUsage, total_cpu: i64) -> Option<u64> {
    if usage.cpu_weight < 0 || total_cpu <= 0 {
      return None; // unmetered
    }
    let capacity = self.global().params.max_block_cpu_usage_us as u128
      * ACCOUNT_USAGE_WINDOW_SLOTS as u128;
    let share = capacity * usage.cpu_weight as u128 / total_cpu as u128;
    Some(share.min(u64::MAX as u128) as u64)
  }

  fn net_allowance(&self, usage: &AccountUsage, total_net: i64) -> Option<u64> {
    if usage.net_weight < 0 || total_net <= 0 {
      return None;
    }
    let capacity = self.global().params.max_block_net_usage as u128
      * ACCOUNT_USAGE_WINDOW_SLOTS as u128;
    let share = capacity * usage.net_weight as u128 / total_net as u128;
    Some(share.min(u64::MAX as u128) as u64)
  }

  /// Bills cpu and net to every billed account of a transaction and
  /// enforces the objective per-account window allowances. Callers
  /// run this inside the transaction's undo session, so an error
  /// leaves no usage behind.
  pub fn add_transaction_usage(
    &mut self,
    accounts: &[AccountName],
    cpu_us: u64,
    net_bytes: u64,
    ordinal: u32,
  ) -> Result<(), ResourceError> {
    for name in accounts {
      self.modify_usage(name, |usage| {
        usage.cpu.add(cpu_us, ordinal, ACCOUNT_USAGE_WINDOW_SLOTS);
        usage.net.add(net_bytes, ordinal, ACCOUNT_USAGE_WINDOW_SLOTS);
      });
    }

    let (total_net, total_cpu) = self.total_weights();
    for name in accounts {
      let usage = self.usage(name).expect("billed above");
      if let Some(allowance) = self.cpu_allowance_us(usage, total_cpu) {
        let used = used_in_window(&usage.cpu);
        if used > allowance {
          return Err(ResourceError::TxCpuExceeded {
            account: name.clone(),
            used_us: used,
            allowance_us: allowance,
          });
        }
      }
      if let Some(allowance) = self.net_allowance(usage, total_net) {
        let used = used_in_window(&usage.net);
        if used > allowance {
          return Err(ResourceError::TxNetExceeded {
            account: name.clone(),
            used,
            allowance,
          });
        }
      }
    }
    Ok(())
  }

  /// Remaining objective cpu budget of an account in microseconds,
  /// or `None` when the account is unmetered.
  pub fn account_cpu_limit_us(
    &self,
    name: &AccountName,
    _ordinal: u32,
  ) -> Option<u64> {
    let usage = self.usage(name)?;
    let (_, total_cpu) = self.total_weights();
    let allowance = self.cpu_allowance_us(usage, total_cpu)?;
    Some(allowance.saturating_sub(used_in_window(&usage.cpu)))
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      primitives::{BlockTimestamp, Digest, Keypair},
      state::AccountObject,
    },
  };

  fn db_with_account(name: &str, cpu_weight: i64) -> (Database, AccountName) {
    let mut db = Database::new();
    let account: AccountName = name.parse().unwrap();
    db.create_account(AccountObject {
      name: account.clone(),
      key: Keypair::from_seed([1u8; 32]).public(),
      code_hash: Digest::default(),
      privileged: false,
      created: BlockTimestamp(0),
      recv_sequence: 0,
    })
    .unwrap();
    db.set_account_limits(&account, -1, cpu_weight);
    (db, account)
  }

  #[test]
  fn unmetered_account_never_exceeds() {
    let (mut db, account) = db_with_account("alice", -1);
    assert!(db
      .add_transaction_usage(&[account.clone()], u64::MAX / 2, 1000, 1)
      .is_ok());
    assert!(db.account_cpu_limit_us(&account, 1).is_none());
  }

  #[test]
  fn metered_account_hits_objective_limit() {
    let (mut db, account) = db_with_account("alice", 1);
    let allowance = db.account_cpu_limit_us(&account, 1).unwrap();
    assert!(allowance > 0);

    // spending the whole window allowance at once trips the limit
    let result =
      db.add_transaction_usage(&[account.clone()], allowance + 1, 0, 1);
    assert!(matches!(result, Err(ResourceError::TxCpuExceeded { .. })));
  }

  #[test]
  fn usage_decays_back_below_the_limit() {
    let (mut db, account) = db_with_account("alice", 1);
    let allowance = db.account_cpu_limit_us(&account, 1).unwrap();

    db.add_transaction_usage(&[account.clone()], allowance / 2, 0, 1)
      .unwrap();
    let after_spend = db.account_cpu_limit_us(&account, 1).unwrap();
    assert!(after_spend < allowance);

    // a full window later the average has fully decayed
    db.add_transaction_usage(
      &[account.clone()],
      0,
      0,
      1 + 2 * ACCOUNT_USAGE_WINDOW_SLOTS,
    )
    .unwrap();
    let after_decay = db
      .account_cpu_limit_us(&account, 1 + 2 * ACCOUNT_USAGE_WINDOW_SLOTS)
      .unwrap();
    assert!(after_decay > after_spend);
  }
}
