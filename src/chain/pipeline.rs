//! The transaction pipeline: applying one transaction to the
//! building block.
//!
//! A restore point over the building block's ordered lists plus a
//! nested undo session guarantee that a failed transaction leaves
//! the pending block byte-identical to before the attempt. The cpu
//! budget is the minimum of the block deadline, the node's own limit,
//! the objective per-account allowance and (when producing against an
//! explicit bill) the billed amount — and which of those fired
//! decides the error kind.

use {
  super::{
    block::{ReceiptTrx, TransactionReceipt, TransactionStatus},
    error::ChainError,
    pending::{BlockMode, BuildingBlock},
    transaction::{Action, TransactionMetadata, TrxType},
  },
  crate::{
    exec::{
      net_usage_words,
      ActionContext,
      ActionReceipt,
      ActionTrace,
      AuthorizationChecker,
      Checktime,
      ExecError,
      ExecutionEngine,
      TransactionTrace,
    },
    primitives::{AccountName, Digest, TimePointSec, WireEncode},
    state::{ResourceError, ScheduledTransaction, SharedDb, UndoSession},
  },
  std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
  },
  tracing::debug,
};

/// Which bound ended up limiting the transaction's cpu budget;
/// decides how a deadline hit is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BudgetSource {
  /// The wall-clock deadline of the whole block.
  Block,
  /// The node-local maximum transaction time (subjective).
  Node,
  /// The account's objective window allowance.
  Account,
  /// The chain-wide or transaction-declared objective cap, or an
  /// explicitly billed amount.
  Objective,
}

pub struct ApplyParams<'a> {
  pub db: &'a SharedDb,
  pub building: &'a mut BuildingBlock,
  pub meta: &'a Arc<TransactionMetadata>,
  pub engine: &'a dyn ExecutionEngine,
  pub authorizer: &'a dyn AuthorizationChecker,
  pub chain_id: Digest,
  pub mode: BlockMode,
  pub block_deadline: Instant,
  pub max_trx_time: Duration,
  /// Trusted billed cpu: the receipt value when validating, or the
  /// explicit bill when producing for a known-costly transaction.
  pub billed_cpu_override: Option<u64>,
  /// Outstanding subjective bill of the first authorizer, subtracted
  /// from its objective allowance while producing.
  pub subjective_billed_us: u64,
  /// Slack granted on top of an explicitly billed cpu amount.
  pub cpu_leeway_us: u64,
}

/// Applies one transaction against the building block. On success the
/// receipt and digests are appended and the nested session is merged
/// into the pending block's; on failure everything is restored.
pub fn apply_transaction(
  mut params: ApplyParams<'_>,
) -> Result<TransactionTrace, ChainError> {
  let checkpoint = params.building.checkpoint();
  let start = Instant::now();
  match apply_inner(&mut params, start) {
    Ok(trace) => Ok(trace),
    Err(error) => {
      params.building.restore(checkpoint);
      Err(error)
    }
  }
}

fn budget_for(
  params: &ApplyParams<'_>,
  now: Instant,
) -> (Duration, BudgetSource) {
  let mut budget = params.max_trx_time;
  let mut source = BudgetSource::Node;

  let until_block_deadline =
    params.block_deadline.saturating_duration_since(now);
  if until_block_deadline < budget {
    budget = until_block_deadline;
    source = BudgetSource::Block;
  }

  let trx = params.meta.packed.trx();
  let db = params.db.read().expect("db lock poisoned");

  let mut objective_caps = vec![
    db.global().params.max_transaction_cpu_usage_us as u64,
  ];
  if trx.max_cpu_usage_ms > 0 {
    objective_caps.push(trx.max_cpu_usage_ms as u64 * 1000);
  }
  if let Some(billed) = params.billed_cpu_override {
    // the billed amount plus the configured leeway, so a validator
    // marginally slower than the producer still reproduces receipts
    objective_caps.push(billed + params.cpu_leeway_us);
  }
  if let Some(cap_us) = objective_caps.iter().min() {
    let cap = Duration::from_micros(*cap_us);
    if cap < budget {
      budget = cap;
      source = BudgetSource::Objective;
    }
  }

  // the account's decayed window allowance, tightened while
  // producing by whatever is already subjectively billed
  if params.mode != BlockMode::Validating
    && params.billed_cpu_override.is_none()
  {
    if let Some(first_auth) = trx.first_authorizer() {
      if let Some(limit) =
        db.account_cpu_limit_us(first_auth, params.building.block_num())
      {
        let available = limit.saturating_sub(params.subjective_billed_us);
        let cap = Duration::from_micros(available);
        if cap < budget {
          budget = cap;
          source = BudgetSource::Account;
        }
      }
    }
  }

  (budget, source)
}

fn classify_deadline(
  source: BudgetSource,
  budget: Duration,
) -> ChainError {
  let budget_us = budget.as_micros() as u64;
  match source {
    BudgetSource::Block => ChainError::DeadlineExceeded,
    BudgetSource::Node => {
      ChainError::TxCpuUsageExceeded { budget_us, objective: false }
    }
    BudgetSource::Account | BudgetSource::Objective => {
      ChainError::TxCpuUsageExceeded { budget_us, objective: true }
    }
  }
}

fn apply_inner(
  params: &mut ApplyParams<'_>,
  start: Instant,
) -> Result<TransactionTrace, ChainError> {
  let meta = Arc::clone(params.meta);
  let trx = meta.packed.trx();
  let id = *meta.id();
  let pending_time: TimePointSec = params.building.timestamp.into();
  let is_input = matches!(meta.trx_type, TrxType::Input);
  let is_scheduled = matches!(meta.trx_type, TrxType::Scheduled);

  if (is_input || is_scheduled) && trx.expiration <= pending_time {
    return Err(ChainError::ExpiredTx(id));
  }

  let (budget, budget_source) = budget_for(params, start);
  if budget.is_zero() {
    return Err(classify_deadline(budget_source, budget));
  }
  let checktime = Checktime::new(start + budget);

  let mut session = UndoSession::new(params.db);

  // dedup index entry lives exactly as long as the transaction can
  // be replayed
  if is_input {
    let fresh = session.with(|db| db.dedup_insert(trx.expiration, id))?;
    if !fresh {
      return Err(ChainError::TxDuplicate(id));
    }
  }

  if is_input {
    let keys = meta.recovered_keys(&params.chain_id);
    let delay = Duration::from_secs(trx.delay_sec as u64);
    session
      .with(|db| {
        params.authorizer.check(db, &trx.actions, keys, delay)
      })
      .map_err(|e| ChainError::Authorization(e.to_string()))?;
  }

  // a delayed input transaction is queued, not executed
  if is_input && trx.delay_sec > 0 {
    return delay_transaction(params, session, &meta, start);
  }

  let mut trace = TransactionTrace {
    id,
    block_num: params.building.block_num(),
    ..TransactionTrace::default()
  };

  let mut queue: VecDeque<(Action, Option<AccountName>)> =
    trx.actions.iter().map(|a| (a.clone(), None)).collect();
  while let Some((action, sender)) = queue.pop_front() {
    checktime
      .check()
      .map_err(|_| classify_deadline(budget_source, budget))?;

    let action_start = Instant::now();
    let action_trace = session.with(|db| -> Result<ActionTrace, ChainError> {
      let receiver = action.account.clone();
      let code_hash = db
        .account(&receiver)
        .map(|a| a.code_hash)
        .unwrap_or_default();

      let mut global_sequence = 0;
      db.modify_global(|g| {
        g.global_action_sequence += 1;
        global_sequence = g.global_action_sequence;
      });
      let mut recv_sequence = 0;
      if db.account(&receiver).is_some() {
        db.modify_account(&receiver, |a| {
          a.recv_sequence += 1;
          recv_sequence = a.recv_sequence;
        })?;
      }

      let mut ctx = ActionContext::new(
        db,
        receiver.clone(),
        &action,
        params.building.timestamp,
        checktime,
        sender.clone(),
      );
      let engine_result = if code_hash.is_zero() {
        Ok(0)
      } else {
        params.engine.execute(&code_hash, &mut ctx)
      };
      let elapsed_us = match engine_result {
        Ok(cpu) => cpu.max(action_start.elapsed().as_micros() as u64),
        Err(ExecError::Deadline) => {
          return Err(classify_deadline(budget_source, budget))
        }
        Err(error) => return Err(ChainError::Execution(error.to_string())),
      };

      // inline actions run after the ones already queued, deferred
      // requests land in the generated-transaction table
      let inline = std::mem::take(&mut ctx.inline_actions);
      let deferred = std::mem::take(&mut ctx.deferred);
      let return_value = std::mem::take(&mut ctx.return_value);
      drop(ctx);
      for inline_action in inline {
        queue.push_back((inline_action, Some(receiver.clone())));
      }
      for request in deferred {
        let deferred_id = request.trx.id();
        db.schedule_transaction(ScheduledTransaction {
          trx_id: deferred_id,
          sender: receiver.clone(),
          payer: request.payer,
          delay_until: pending_time.plus(request.delay),
          expiration: request.trx.expiration,
          published: params.building.timestamp,
          packed_trx: request.trx.to_wire_bytes(),
        })?;
      }

      let receipt = ActionReceipt {
        receiver,
        act_digest: action.digest(),
        global_sequence,
        recv_sequence,
      };
      Ok(ActionTrace {
        receipt,
        action: action.clone(),
        return_value,
        elapsed_us,
      })
    })?;
    trace.action_traces.push(action_trace);
  }

  // usage finalization: wall clock for cpu (floored at the chain
  // minimum), serialized size for net, rounded up to 8-byte words
  let db_params = {
    let db = params.db.read().expect("db lock poisoned");
    db.global().params.clone()
  };
  let elapsed_us = start.elapsed().as_micros() as u64;
  let is_implicit = matches!(meta.trx_type, TrxType::Implicit);
  let billed_us = match params.billed_cpu_override {
    Some(billed) => billed,
    // implicit system transactions bill the chain minimum so their
    // receipts are identical on every node
    None if is_implicit => db_params.min_transaction_cpu_usage_us as u64,
    None => elapsed_us.max(db_params.min_transaction_cpu_usage_us as u64),
  };
  if params.billed_cpu_override.is_none()
    && !is_implicit
    && billed_us > budget.as_micros() as u64
  {
    return Err(classify_deadline(budget_source, budget));
  }

  let words = net_usage_words(
    meta.packed.size(),
    db_params.base_per_transaction_net_usage,
  ) as u64;
  let net_bytes = words * 8;
  if trx.max_net_usage_words > 0 && words > trx.max_net_usage_words as u64 {
    return Err(ChainError::TxNetUsageExceeded {
      used: net_bytes,
      limit: trx.max_net_usage_words as u64 * 8,
    });
  }
  if net_bytes > db_params.max_transaction_net_usage {
    return Err(ChainError::TxNetUsageExceeded {
      used: net_bytes,
      limit: db_params.max_transaction_net_usage,
    });
  }

  // block-level budgets
  if params.building.block_cpu_used_us + billed_us
    > db_params.max_block_cpu_usage_us as u64
  {
    return Err(ChainError::BlockCpuExhausted);
  }
  if params.building.block_net_used + net_bytes
    > db_params.max_block_net_usage
  {
    return Err(ChainError::BlockNetExhausted);
  }

  // objective billing; trusted values when validating, measured ones
  // when producing, nothing while speculating and nothing for
  // implicit system transactions
  if params.mode != BlockMode::Speculating && (is_input || is_scheduled) {
    if let Some(first_auth) = trx.first_authorizer().cloned() {
      let block_num = params.building.block_num();
      session
        .with(|db| {
          db.add_transaction_usage(&[first_auth], billed_us, net_bytes, block_num)
        })
        .map_err(map_resource_error)?;
    }
  }

  trace.elapsed_us = elapsed_us;
  trace.net_usage = net_bytes;
  meta.set_billed_cpu_time_us(billed_us);

  // transient transactions leave no receipt and no state
  if meta.is_transient() {
    session.undo();
    return Ok(trace);
  }

  let receipt = TransactionReceipt {
    status: TransactionStatus::Executed,
    cpu_usage_us: billed_us as u32,
    net_usage_words: words as u32,
    trx: if is_scheduled {
      ReceiptTrx::Id(id)
    } else {
      ReceiptTrx::Packed(meta.packed.clone())
    },
  };
  push_receipt(params.building, receipt, &trace, &meta);
  params.building.block_cpu_used_us += billed_us;
  params.building.block_net_used += net_bytes;

  session.squash();
  debug!(
    "applied transaction {id} ({billed_us}us, {net_bytes} net bytes)"
  );
  Ok(trace)
}

/// Queues a delayed input transaction into the generated-transaction
/// table and commits a `Delayed` receipt for it.
fn delay_transaction(
  params: &mut ApplyParams<'_>,
  mut session: UndoSession,
  meta: &Arc<TransactionMetadata>,
  start: Instant,
) -> Result<TransactionTrace, ChainError> {
  let trx = meta.packed.trx();
  let id = *meta.id();
  let pending_time: TimePointSec = params.building.timestamp.into();

  let db_params = {
    let db = params.db.read().expect("db lock poisoned");
    db.global().params.clone()
  };
  let billed_us = db_params.min_transaction_cpu_usage_us as u64;
  let words = net_usage_words(
    meta.packed.size(),
    db_params.base_per_transaction_net_usage,
  ) as u64;

  session.with(|db| {
    db.schedule_transaction(ScheduledTransaction {
      trx_id: id,
      sender: trx
        .first_authorizer()
        .cloned()
        .unwrap_or_default(),
      payer: trx.first_authorizer().cloned().unwrap_or_default(),
      delay_until: pending_time
        .plus(Duration::from_secs(trx.delay_sec as u64)),
      expiration: trx.expiration,
      published: params.building.timestamp,
      packed_trx: meta.packed.signed().to_wire_bytes(),
    })
  })?;

  let trace = TransactionTrace {
    id,
    block_num: params.building.block_num(),
    elapsed_us: start.elapsed().as_micros() as u64,
    net_usage: words * 8,
    ..TransactionTrace::default()
  };
  let receipt = TransactionReceipt {
    status: TransactionStatus::Delayed,
    cpu_usage_us: billed_us as u32,
    net_usage_words: words as u32,
    trx: ReceiptTrx::Packed(meta.packed.clone()),
  };
  push_receipt(params.building, receipt, &trace, meta);
  params.building.block_cpu_used_us += billed_us;
  params.building.block_net_used += words * 8;

  session.squash();
  Ok(trace)
}

fn push_receipt(
  building: &mut BuildingBlock,
  receipt: TransactionReceipt,
  trace: &TransactionTrace,
  meta: &Arc<TransactionMetadata>,
) {
  building.receipt_digests.push(receipt.digest());
  for action_trace in &trace.action_traces {
    building
      .action_receipt_digests
      .push(action_trace.receipt.digest());
  }
  building.receipts.push(receipt);
  building.trx_metas.push(Arc::clone(meta));
}

fn map_resource_error(error: ResourceError) -> ChainError {
  match error {
    ResourceError::TxCpuExceeded { allowance_us, .. } => {
      ChainError::TxCpuUsageExceeded {
        budget_us: allowance_us,
        objective: true,
      }
    }
    ResourceError::TxNetExceeded { used, allowance, .. } => {
      ChainError::TxNetUsageExceeded { used, limit: allowance }
    }
  }
}
