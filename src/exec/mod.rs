//! Seams to the execution engine and the authorization checker.
//!
//! The controller never interprets contract code itself: it hands an
//! [`ActionContext`] to an [`ExecutionEngine`] and gets back the cpu
//! the engine metered. The engine mutates state only through the
//! context, which also collects inline actions, deferred requests and
//! the action's return value. Authorization is an equally opaque
//! collaborator behind [`AuthorizationChecker`].

use {
  crate::{
    chain::transaction::{Action, Transaction},
    primitives::{
      wire::WireEncode,
      AccountName,
      BlockTimestamp,
      Digest,
      Pubkey,
    },
    state::Database,
  },
  serde::{Deserialize, Serialize},
  std::{
    collections::HashSet,
    time::{Duration, Instant},
  },
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum ExecError {
  #[error("execution deadline reached")]
  Deadline,

  #[error("intrinsic {0} is not enabled by any activated protocol feature")]
  IntrinsicNotEnabled(String),

  #[error("contract aborted: {0}")]
  ContractAbort(String),

  #[error("authorization failed: {0}")]
  Unauthorized(String),

  #[error("database: {0}")]
  Database(#[from] crate::state::DbError),
}

/// Deadline poller handed to the engine; the engine is expected to
/// call [`Checktime::check`] at function-call granularity, which is
/// the only cancellation mechanism (there is no preemption).
#[derive(Debug, Clone, Copy)]
pub struct Checktime {
  deadline: Instant,
}

impl Checktime {
  pub fn new(deadline: Instant) -> Self {
    Self { deadline }
  }

  pub fn from_now(budget: Duration) -> Self {
    Self { deadline: Instant::now() + budget }
  }

  pub fn check(&self) -> Result<(), ExecError> {
    if Instant::now() >= self.deadline {
      return Err(ExecError::Deadline);
    }
    Ok(())
  }

  pub fn deadline(&self) -> Instant {
    self.deadline
  }

  pub fn expired(&self) -> bool {
    Instant::now() >= self.deadline
  }
}

/// A deferred transaction emitted by an action, to be queued in the
/// generated-transaction table.
#[derive(Debug, Clone)]
pub struct DeferredRequest {
  pub payer: AccountName,
  pub delay: Duration,
  pub trx: Transaction,
}

/// Everything one action execution may observe and effect.
pub struct ActionContext<'a> {
  pub db: &'a mut Database,
  pub receiver: AccountName,
  pub action: &'a Action,
  pub pending_block_time: BlockTimestamp,
  pub checktime: Checktime,
  /// The account that sent this action inline, if any; surfaced to
  /// contracts through the `get_sender` intrinsic.
  pub sender: Option<AccountName>,
  pub(crate) inline_actions: Vec<Action>,
  pub(crate) deferred: Vec<DeferredRequest>,
  pub(crate) return_value: Vec<u8>,
}

impl<'a> ActionContext<'a> {
  pub fn new(
    db: &'a mut Database,
    receiver: AccountName,
    action: &'a Action,
    pending_block_time: BlockTimestamp,
    checktime: Checktime,
    sender: Option<AccountName>,
  ) -> Self {
    Self {
      db,
      receiver,
      action,
      pending_block_time,
      checktime,
      sender,
      inline_actions: Vec::new(),
      deferred: Vec::new(),
      return_value: Vec::new(),
    }
  }

  /// Gate for protocol-feature guarded intrinsics: contracts may only
  /// call what an activated feature whitelisted.
  pub fn use_intrinsic(&self, name: &str) -> Result<(), ExecError> {
    if self.db.protocol().whitelisted_intrinsics.contains(name) {
      Ok(())
    } else {
      Err(ExecError::IntrinsicNotEnabled(name.to_string()))
    }
  }

  pub fn require_auth(&self, account: &AccountName) -> Result<(), ExecError> {
    if self.action.authorization.iter().any(|level| level.actor == *account) {
      Ok(())
    } else {
      Err(ExecError::Unauthorized(format!(
        "action lacks authority of {account}"
      )))
    }
  }

  /// Schedules a nested action, executed after the current one in
  /// the same transaction.
  pub fn push_inline(&mut self, action: Action) {
    self.inline_actions.push(action);
  }

  /// Emits a deferred transaction for the generated-transaction
  /// table.
  pub fn send_deferred(&mut self, request: DeferredRequest) {
    self.deferred.push(request);
  }

  pub fn set_return_value(&mut self, value: Vec<u8>) -> Result<(), ExecError> {
    self.use_intrinsic("set_action_return_value")?;
    self.return_value = value;
    Ok(())
  }
}

/// The WASM execution engine boundary: given the code hash of the
/// receiver and the action context, run the action and return the cpu
/// the engine metered, in microseconds.
pub trait ExecutionEngine: Send + Sync {
  fn execute(
    &self,
    code_hash: &Digest,
    ctx: &mut ActionContext<'_>,
  ) -> Result<u64, ExecError>;
}

/// Engine used when no contract system is deployed: every action is
/// accepted as a no-op, which keeps implicit system transactions
/// (e.g. onblock) harmless on a fresh chain.
pub struct NoopEngine;

impl ExecutionEngine for NoopEngine {
  fn execute(
    &self,
    _code_hash: &Digest,
    ctx: &mut ActionContext<'_>,
  ) -> Result<u64, ExecError> {
    ctx.checktime.check()?;
    Ok(0)
  }
}

/// The authorization checker boundary.
pub trait AuthorizationChecker: Send + Sync {
  fn check(
    &self,
    db: &Database,
    actions: &[Action],
    provided_keys: &HashSet<Pubkey>,
    provided_delay: Duration,
  ) -> Result<(), ExecError>;
}

/// Key-per-account authorization: every declared actor's account key
/// must be among the provided (signature-verified) keys.
pub struct StateAuthorizer;

impl AuthorizationChecker for StateAuthorizer {
  fn check(
    &self,
    db: &Database,
    actions: &[Action],
    provided_keys: &HashSet<Pubkey>,
    _provided_delay: Duration,
  ) -> Result<(), ExecError> {
    for action in actions {
      for level in &action.authorization {
        let account = db.account(&level.actor).ok_or_else(|| {
          ExecError::Unauthorized(format!("unknown account {}", level.actor))
        })?;
        if !provided_keys.contains(&account.key) {
          return Err(ExecError::Unauthorized(format!(
            "missing signature of {}",
            level.actor
          )));
        }
      }
    }
    Ok(())
  }
}

/// The ordered receipt every executed action leaves behind; their
/// digests accumulate into the block's action merkle root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReceipt {
  pub receiver: AccountName,
  pub act_digest: Digest,
  pub global_sequence: u64,
  pub recv_sequence: u64,
}

impl ActionReceipt {
  pub fn digest(&self) -> Digest {
    let mut bytes = Vec::new();
    self.receiver.encode(&mut bytes);
    self.act_digest.encode(&mut bytes);
    self.global_sequence.encode(&mut bytes);
    self.recv_sequence.encode(&mut bytes);
    Digest::of(bytes)
  }
}

/// Execution record of one action within a transaction trace.
#[derive(Debug, Clone)]
pub struct ActionTrace {
  pub receipt: ActionReceipt,
  pub action: Action,
  pub return_value: Vec<u8>,
  pub elapsed_us: u64,
}

/// What the pipeline reports for one transaction: its receipt fields
/// plus per-action traces, or the error that stopped it.
#[derive(Debug, Clone, Default)]
pub struct TransactionTrace {
  pub id: crate::primitives::TransactionId,
  pub block_num: u32,
  pub elapsed_us: u64,
  pub net_usage: u64,
  pub action_traces: Vec<ActionTrace>,
  pub error: Option<String>,
  pub error_code: Option<u64>,
}

impl TransactionTrace {
  pub fn failed(&self) -> bool {
    self.error.is_some()
  }
}

/// Computes the serialized-size based net usage of a transaction,
/// rounded up to 8-byte words.
pub fn net_usage_words(packed_size: usize, base_overhead: u32) -> u32 {
  let bytes = packed_size as u64 + base_overhead as u64;
  ((bytes + 7) / 8) as u32
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      chain::transaction::PermissionLevel,
      primitives::Keypair,
      state::AccountObject,
    },
  };

  fn test_db_with(name: &str, key: Pubkey) -> Database {
    let mut db = Database::new();
    db.create_account(AccountObject {
      name: name.parse().unwrap(),
      key,
      code_hash: Digest::default(),
      privileged: false,
      created: BlockTimestamp(0),
      recv_sequence: 0,
    })
    .unwrap();
    db
  }

  fn transfer_action(actor: &str) -> Action {
    Action {
      account: "system".parse().unwrap(),
      name: "transfer".to_string(),
      authorization: vec![PermissionLevel::active(actor.parse().unwrap())],
      data: vec![],
    }
  }

  #[test]
  fn authorizer_accepts_matching_key() {
    let alice = Keypair::from_seed([1u8; 32]);
    let db = test_db_with("alice", alice.public());
    let mut keys = HashSet::new();
    keys.insert(alice.public());

    StateAuthorizer
      .check(&db, &[transfer_action("alice")], &keys, Duration::ZERO)
      .unwrap();
  }

  #[test]
  fn authorizer_rejects_missing_key() {
    let alice = Keypair::from_seed([1u8; 32]);
    let mallory = Keypair::from_seed([2u8; 32]);
    let db = test_db_with("alice", alice.public());
    let mut keys = HashSet::new();
    keys.insert(mallory.public());

    assert!(StateAuthorizer
      .check(&db, &[transfer_action("alice")], &keys, Duration::ZERO)
      .is_err());
    assert!(StateAuthorizer
      .check(&db, &[transfer_action("nobody")], &keys, Duration::ZERO)
      .is_err());
  }

  #[test]
  fn intrinsic_whitelist_gates_context() {
    let alice = Keypair::from_seed([1u8; 32]);
    let mut db = test_db_with("alice", alice.public());
    let action = transfer_action("alice");

    let ctx = ActionContext::new(
      &mut db,
      "system".parse().unwrap(),
      &action,
      BlockTimestamp(1),
      Checktime::from_now(Duration::from_millis(50)),
      None,
    );
    assert!(ctx.use_intrinsic("get_sender").is_err());

    ctx.db.modify_protocol(|p| {
      p.whitelisted_intrinsics.insert("get_sender".to_string());
    });
    assert!(ctx.use_intrinsic("get_sender").is_ok());
  }

  #[test]
  fn checktime_expires() {
    let checktime = Checktime::new(Instant::now());
    assert!(matches!(checktime.check(), Err(ExecError::Deadline)));
    assert!(Checktime::from_now(Duration::from_secs(5)).check().is_ok());
  }

  #[test]
  fn net_words_round_up() {
    assert_eq!(net_usage_words(0, 0), 0);
    assert_eq!(net_usage_words(1, 0), 1);
    assert_eq!(net_usage_words(8, 0), 1);
    assert_eq!(net_usage_words(9, 0), 2);
    assert_eq!(net_usage_words(10, 12), 3);
  }
}
