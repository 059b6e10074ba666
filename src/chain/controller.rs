//! The block controller.
//!
//! Owns the fork database, the chain-state database, the pending
//! block and the queues around them, and drives every block through
//! its lifecycle: start, transaction drain, assembly, completion (or
//! validation of an incoming block), fork arbitration, and finally
//! irreversibility into the block log. All mutation happens on the
//! app thread; the only data shared with workers are the read-only
//! snapshot and the block-arrival counter.

use {
  super::{
    billing::{FailureTracker, SubjectiveBilling},
    block::{
      feature_activation_extension,
      BlockHeader,
      Extension,
      ProducerSchedule,
      ReceiptTrx,
      SignedBlock,
      TransactionReceipt,
      TransactionStatus,
      FINALITY_EXTENSION_ID,
    },
    block_state::{BlockState, Trust},
    error::ChainError,
    features,
    finality::{
      FinalityExtension,
      LocalFinalizer,
      PendingQc,
      QcClaim,
      QcState,
      QuorumCertificate,
      VoteMessage,
    },
    fork_database::ForkDatabase,
    pending::{
      AssembledBlock,
      BlockMode,
      BlockStage,
      BuildingBlock,
      CompletedBlock,
      PendingBlock,
    },
    pipeline::{self, ApplyParams},
    signals::Signal,
    transaction::{
      Action,
      PackedTransaction,
      PermissionLevel,
      Transaction,
      TransactionMetadata,
      TrxType,
    },
    unapplied::{NextCallback, TrxOrigin, UnappliedQueue, UnappliedTransaction},
  },
  crate::{
    exec::{AuthorizationChecker, ExecutionEngine, TransactionTrace},
    primitives::{
      canonical_merkle,
      AccountName,
      BlockId,
      BlockTimestamp,
      Digest,
      MountainRange,
      Pubkey,
      TimePointSec,
      TransactionId,
      WireDecode,
      WireEncode,
    },
    snapshot::{SerializedBlockState, SnapshotReader, SnapshotWriter},
    state::{
      shared,
      AccountObject,
      ChainTables,
      Database,
      SharedDb,
      UndoSession,
    },
    storage::BlockLog,
  },
  ed25519_dalek::Signature,
  rayon::prelude::*,
  std::{
    collections::{HashSet, VecDeque},
    path::PathBuf,
    sync::{
      atomic::{AtomicU64, Ordering},
      Arc,
      Mutex,
    },
    time::{Duration, Instant},
  },
  tracing::{debug, error, info, warn},
};

type Result<T> = std::result::Result<T, ChainError>;

/// Which view of the chain reads observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
  /// Reads observe the current best head.
  Head,
  /// Like head, but the speculative pending block is visible too.
  Speculative,
  /// Reads observe only irreversible state; the head accessor is
  /// clamped to the last irreversible block.
  Irreversible,
}

/// The initial condition of a chain.
#[derive(Debug, Clone)]
pub struct Genesis {
  pub chain_id: Digest,
  pub timestamp: BlockTimestamp,
  pub initial_schedule: ProducerSchedule,
  /// Accounts created at genesis with their authorization keys.
  pub accounts: Vec<(AccountName, Pubkey)>,
}

#[derive(Debug, Clone)]
pub struct Config {
  pub max_transaction_time: Duration,
  pub max_irreversible_block_age: Option<Duration>,
  pub produce_time_offset_us: u64,
  pub last_block_time_offset_us: u64,
  pub cpu_effort_percent: u32,
  pub last_block_cpu_effort_percent: u32,
  pub max_block_cpu_usage_threshold_us: u64,
  pub max_block_net_usage_threshold_bytes: u64,
  pub max_scheduled_transaction_time_per_block: Duration,
  pub subjective_cpu_leeway_us: u64,
  pub subjective_account_max_failures: u32,
  pub subjective_account_max_failures_window_size: u32,
  pub subjective_account_decay_time_minutes: u32,
  pub incoming_defer_ratio: f64,
  pub incoming_transaction_queue_size_mb: usize,
  pub disable_subjective_billing: bool,
  pub disable_subjective_p2p_billing: bool,
  pub disable_subjective_api_billing: bool,
  pub producer_threads: usize,
  pub read_only_threads: usize,
  pub read_only_write_window_time: Duration,
  pub read_only_read_window_time: Duration,
  pub terminate_at_block: u32,
  pub snapshots_dir: PathBuf,
  pub actor_whitelist: HashSet<AccountName>,
  pub actor_blacklist: HashSet<AccountName>,
  pub contract_whitelist: HashSet<AccountName>,
  pub contract_blacklist: HashSet<AccountName>,
  pub action_blacklist: HashSet<(AccountName, String)>,
  pub key_blacklist: HashSet<Pubkey>,
  pub trusted_producers: HashSet<AccountName>,
  pub read_mode: ReadMode,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      max_transaction_time: Duration::from_millis(30),
      max_irreversible_block_age: None,
      produce_time_offset_us: 0,
      last_block_time_offset_us: 0,
      cpu_effort_percent: 80,
      last_block_cpu_effort_percent: 80,
      max_block_cpu_usage_threshold_us: 5000,
      max_block_net_usage_threshold_bytes: 1024,
      max_scheduled_transaction_time_per_block: Duration::from_millis(100),
      subjective_cpu_leeway_us: 31_000,
      subjective_account_max_failures: 3,
      subjective_account_max_failures_window_size: 1,
      subjective_account_decay_time_minutes: 24 * 60,
      incoming_defer_ratio: 1.0,
      incoming_transaction_queue_size_mb: 1024,
      disable_subjective_billing: false,
      disable_subjective_p2p_billing: false,
      disable_subjective_api_billing: false,
      producer_threads: 2,
      read_only_threads: 0,
      read_only_write_window_time: Duration::from_micros(200_000),
      read_only_read_window_time: Duration::from_micros(60_000),
      terminate_at_block: 0,
      snapshots_dir: PathBuf::from("snapshots"),
      actor_whitelist: HashSet::new(),
      actor_blacklist: HashSet::new(),
      contract_whitelist: HashSet::new(),
      contract_blacklist: HashSet::new(),
      action_blacklist: HashSet::new(),
      key_blacklist: HashSet::new(),
      trusted_producers: HashSet::new(),
      read_mode: ReadMode::Head,
    }
  }
}

/// Events the controller fans out, in commit order, on the app
/// thread.
pub struct Signals {
  pub block_start: Signal<u32>,
  pub accepted_block_header: Signal<Arc<BlockState>>,
  pub accepted_block: Signal<Arc<BlockState>>,
  pub irreversible_block: Signal<Arc<BlockState>>,
  pub applied_transaction: Signal<(TransactionTrace, PackedTransaction)>,
  pub voted_block: Signal<VoteMessage>,
}

impl Default for Signals {
  fn default() -> Self {
    Self {
      block_start: Signal::new("block_start"),
      accepted_block_header: Signal::new("accepted_block_header"),
      accepted_block: Signal::new("accepted_block"),
      irreversible_block: Signal::new("irreversible_block"),
      applied_transaction: Signal::new("applied_transaction"),
      voted_block: Signal::new("voted_block"),
    }
  }
}

/// Why a queue drain stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
  /// Every eligible transaction was attempted.
  Drained,
  /// The block ran out of cpu or net budget.
  Exhausted,
  /// The block deadline arrived.
  Deadline,
  /// A higher-priority inbound block arrived.
  Interrupted,
}

pub const SYSTEM_ACCOUNT: &str = "system";
pub const ONBLOCK_ACTION: &str = "onblock";

pub struct Controller {
  config: Config,
  chain_id: Digest,
  db: SharedDb,
  fork_db: ForkDatabase,
  block_log: BlockLog,
  pending: Option<PendingBlock>,
  unapplied: UnappliedQueue,
  subjective: SubjectiveBilling,
  failures: FailureTracker,
  engine: Arc<dyn ExecutionEngine>,
  authorizer: Arc<dyn AuthorizationChecker>,
  signals: Signals,
  finalizers: Vec<LocalFinalizer>,
  /// Tip of the branch currently applied to the database; its block
  /// number always equals the database revision.
  applied_head: BlockId,
  /// Highest block proven irreversible by aggregated votes, which
  /// can run ahead of what any block header claims.
  vote_lib_num: u32,
  received_block: Arc<AtomicU64>,
  received_at_block_start: u64,
  read_only_queue: Option<Arc<Mutex<VecDeque<crate::window::ReadOnlyJob>>>>,
  shutdown_requested: bool,
}

impl Controller {
  pub fn new(
    genesis: Genesis,
    config: Config,
    engine: Arc<dyn ExecutionEngine>,
    authorizer: Arc<dyn AuthorizationChecker>,
    block_log_dir: &std::path::Path,
  ) -> Result<Self> {
    let mut db = Database::new();
    db.modify_global(|g| g.chain_id = genesis.chain_id);
    let system: AccountName =
      SYSTEM_ACCOUNT.parse().expect("static system account name");
    if !genesis.accounts.iter().any(|(name, _)| *name == system) {
      db.create_account(AccountObject {
        name: system.clone(),
        key: Pubkey([0u8; 32]),
        code_hash: Digest::default(),
        privileged: true,
        created: genesis.timestamp,
        recv_sequence: 0,
      })?;
    }
    for (name, key) in &genesis.accounts {
      db.create_account(AccountObject {
        name: name.clone(),
        key: *key,
        code_hash: Digest::default(),
        privileged: *name == system,
        created: genesis.timestamp,
        recv_sequence: 0,
      })?;
    }
    db.set_revision(0)?;

    let root = Arc::new(BlockState::genesis(
      genesis.chain_id,
      genesis.timestamp,
      genesis.initial_schedule,
    ));
    let block_log = BlockLog::open(block_log_dir)
      .map_err(|e| ChainError::BlockLog(e.to_string()))?;

    let applied_head = root.id;
    Ok(Self {
      chain_id: genesis.chain_id,
      db: shared(db),
      fork_db: ForkDatabase::new(root),
      block_log,
      pending: None,
      unapplied: UnappliedQueue::new(
        config.incoming_transaction_queue_size_mb * 1024 * 1024,
      ),
      subjective: SubjectiveBilling::new(
        config.subjective_account_decay_time_minutes,
        config.disable_subjective_billing,
      ),
      failures: FailureTracker::new(
        config.subjective_account_max_failures,
        config.subjective_account_max_failures_window_size,
      ),
      engine,
      authorizer,
      signals: Signals::default(),
      finalizers: Vec::new(),
      applied_head,
      vote_lib_num: 0,
      received_block: Arc::new(AtomicU64::new(0)),
      received_at_block_start: 0,
      read_only_queue: None,
      shutdown_requested: false,
      config,
    })
  }

  // --- accessors ---------------------------------------------------

  pub fn chain_id(&self) -> Digest {
    self.chain_id
  }

  pub fn signals_mut(&mut self) -> &mut Signals {
    &mut self.signals
  }

  pub fn db(&self) -> SharedDb {
    Arc::clone(&self.db)
  }

  pub fn fork_db(&self) -> &ForkDatabase {
    &self.fork_db
  }

  /// The chain head under the configured read mode: the preferred tip
  /// normally, the last irreversible block in irreversible mode.
  pub fn head(&self) -> Arc<BlockState> {
    match self.config.read_mode {
      ReadMode::Irreversible => Arc::clone(self.fork_db.root()),
      _ => self.fork_db.head(),
    }
  }

  /// The preferred tip regardless of read mode.
  pub fn pending_head(&self) -> Arc<BlockState> {
    self.fork_db.head()
  }

  pub fn last_irreversible_block_num(&self) -> u32 {
    self.fork_db.root().block_num()
  }

  pub fn is_building_block(&self) -> bool {
    matches!(
      self.pending,
      Some(PendingBlock { stage: BlockStage::Building(_), .. })
    )
  }

  pub fn pending_block_num(&self) -> Option<u32> {
    self.pending.as_ref().map(|p| p.block_num())
  }

  pub fn shutdown_requested(&self) -> bool {
    self.shutdown_requested
  }

  pub fn add_finalizer(&mut self, finalizer: LocalFinalizer) {
    self.finalizers.push(finalizer);
  }

  /// Shares the block-arrival counter with the window controller so
  /// both sides observe the same ordering of arrivals and switches.
  pub fn set_received_block_counter(&mut self, counter: Arc<AtomicU64>) {
    self.received_block = counter;
  }

  pub fn attach_read_only_queue(
    &mut self,
    queue: Arc<Mutex<VecDeque<crate::window::ReadOnlyJob>>>,
  ) {
    self.read_only_queue = Some(queue);
  }

  /// A copy of the committed tables for the read window.
  pub fn read_only_snapshot(&self) -> ChainTables {
    self.db.read().expect("db lock poisoned").tables().clone()
  }

  /// Reference-block binding (TaPoS fields) for a new transaction
  /// against the current head.
  pub fn reference_block(&self) -> (u16, u32) {
    let head = self.pending_head();
    ((head.block_num() & 0xffff) as u16, head.id.ref_prefix())
  }

  fn applied_head_state(&self) -> Arc<BlockState> {
    self
      .fork_db
      .get(&self.applied_head)
      .unwrap_or_else(|| Arc::clone(self.fork_db.root()))
  }

  /// Whether a start-block drain should yield: the deadline passed or
  /// a new block arrived since this block started.
  pub fn should_interrupt_start_block(&self, deadline: Instant) -> bool {
    Instant::now() >= deadline
      || self.received_block.load(Ordering::SeqCst)
        != self.received_at_block_start
  }

  // --- the block-stage state machine -------------------------------

  /// Opens a new block in the building stage on top of the applied
  /// head. Producing callers pick the producer from the schedule;
  /// validation passes the incoming header's identity.
  pub fn start_block(
    &mut self,
    when: BlockTimestamp,
    confirm_count: u16,
    new_feature_activations: &[Digest],
    mode: BlockMode,
  ) -> Result<()> {
    let parent = self.applied_head_state();
    let producer = parent
      .active_schedule
      .producer_for(when)
      .producer_name
      .clone();
    self.start_block_with(
      when,
      producer,
      confirm_count,
      new_feature_activations,
      mode,
    )
  }

  fn start_block_with(
    &mut self,
    when: BlockTimestamp,
    producer: AccountName,
    confirmed: u16,
    new_feature_activations: &[Digest],
    mode: BlockMode,
  ) -> Result<()> {
    if self.pending.is_some() {
      return Err(ChainError::AlreadyPending);
    }
    let parent = self.applied_head_state();
    let block_num = parent.block_num() + 1;
    if self.config.terminate_at_block > 0
      && block_num > self.config.terminate_at_block
    {
      self.shutdown_requested = true;
      return Err(ChainError::TerminateAtBlock(self.config.terminate_at_block));
    }
    if when <= parent.timestamp() {
      return Err(ChainError::InvalidHeader(
        "block time must advance past the parent".into(),
      ));
    }

    self.signals.block_start.emit(&block_num);
    self.received_at_block_start =
      self.received_block.load(Ordering::SeqCst);

    let skip_session =
      mode == BlockMode::Validating && self.config.read_mode == ReadMode::Irreversible;
    let session = if skip_session {
      None
    } else {
      Some(UndoSession::new(&self.db))
    };

    // every preactivated feature must ship with this block
    {
      let db = self.db.read().expect("db lock poisoned");
      for digest in &db.protocol().preactivated {
        if !new_feature_activations.contains(digest) {
          return Err(ChainError::ProtocolFeatureBadBlock(format!(
            "preactivated feature {digest} is not activated by the block"
          )));
        }
      }
    }

    {
      let mut db = self.db.write().expect("db lock poisoned");
      let mut earlier: Vec<Digest> = Vec::new();
      for digest in new_feature_activations {
        features::activate_feature(&mut db, digest, &earlier, block_num)?;
        earlier.push(*digest);
      }
    }

    self.pending = Some(PendingBlock {
      stage: BlockStage::Building(BuildingBlock {
        timestamp: when,
        producer,
        confirmed,
        previous: Arc::clone(&parent),
        new_activated_features: new_feature_activations.to_vec(),
        receipts: Vec::new(),
        receipt_digests: Vec::new(),
        action_receipt_digests: Vec::new(),
        trx_metas: Vec::new(),
        block_cpu_used_us: 0,
        block_net_used: 0,
      }),
      session,
      mode,
    });

    // the implicit onblock transaction hands the previous header to
    // the system contract; faults are logged and swallowed
    let onblock = self.onblock_metadata(&parent);
    let deadline = Instant::now() + self.config.max_transaction_time;
    if let Err(e) =
      self.push_transaction_inner(&onblock, deadline, None, None)
    {
      warn!("onblock transaction failed in block {block_num}: {e}");
    }

    // evict expired state: the dedup index (consensus, inside the
    // block session), the unapplied queue and the subjective ledger
    let pending_time: TimePointSec = when.into();
    self
      .db
      .write()
      .expect("db lock poisoned")
      .dedup_expire(pending_time);
    self.unapplied.clear_expired(pending_time, |id, next| {
      debug!("expired unapplied transaction {id}");
      if let Some(next) = next {
        next(Err(ChainError::ExpiredTx(id)));
      }
    });
    self.subjective.evict_decayed(when.0);

    Ok(())
  }

  fn onblock_metadata(&self, parent: &BlockState) -> Arc<TransactionMetadata> {
    let pending_time = parent.timestamp().next();
    let trx = Transaction {
      expiration: TimePointSec::from(pending_time)
        .plus(Duration::from_secs(60)),
      ref_block_num: 0,
      ref_block_prefix: 0,
      max_net_usage_words: 0,
      max_cpu_usage_ms: 0,
      delay_sec: 0,
      actions: vec![Action {
        account: SYSTEM_ACCOUNT.parse().expect("static name"),
        name: ONBLOCK_ACTION.to_string(),
        authorization: vec![PermissionLevel::active(
          SYSTEM_ACCOUNT.parse().expect("static name"),
        )],
        data: parent.header().to_wire_bytes(),
      }],
    };
    Arc::new(TransactionMetadata::new(
      PackedTransaction::from_signed(
        super::transaction::SignedTransaction { trx, signatures: vec![] },
      ),
      TrxType::Implicit,
    ))
  }

  /// Applies one transaction to the building block. The pipeline
  /// guarantees restoration on failure; this wrapper adds the
  /// node-local layers: TaPoS, the failure limiter, subjective
  /// billing and signals.
  pub fn push_transaction(
    &mut self,
    meta: &Arc<TransactionMetadata>,
    block_deadline: Instant,
    billed_cpu_override: Option<u64>,
  ) -> Result<TransactionTrace> {
    self.push_transaction_inner(meta, block_deadline, billed_cpu_override, None)
  }

  fn push_transaction_inner(
    &mut self,
    meta: &Arc<TransactionMetadata>,
    block_deadline: Instant,
    billed_cpu_override: Option<u64>,
    origin: Option<TrxOrigin>,
  ) -> Result<TransactionTrace> {
    let (mode, block_num, slot, prev) = {
      let pending = self
        .pending
        .as_ref()
        .ok_or(ChainError::WrongBlockStage("building"))?;
      let BlockStage::Building(building) = &pending.stage else {
        return Err(ChainError::WrongBlockStage("building"));
      };
      (
        pending.mode,
        building.block_num(),
        building.timestamp.0,
        Arc::clone(&building.previous),
      )
    };
    let is_input = matches!(meta.trx_type, TrxType::Input);
    let first_auth = meta.packed.trx().first_authorizer().cloned();

    if is_input {
      self.check_subjective_lists(meta)?;
      if mode == BlockMode::Producing {
        if let Some(account) = &first_auth {
          if self.failures.is_blocked(account, block_num) {
            return Err(ChainError::AccountFailureLimit(account.clone()));
          }
        }
      }
      Self::verify_tapos(
        &self.fork_db,
        &mut self.block_log,
        &prev,
        meta.packed.trx().ref_block_num,
        meta.packed.trx().ref_block_prefix,
      )?;
    }

    let bill_subjectively = mode == BlockMode::Producing
      && is_input
      && !self.subjective.disabled()
      && match origin {
        Some(TrxOrigin::IncomingApi) => {
          !self.config.disable_subjective_api_billing
        }
        Some(TrxOrigin::IncomingP2p) => {
          !self.config.disable_subjective_p2p_billing
        }
        _ => true,
      };
    let prior_bill = match (&first_auth, bill_subjectively) {
      (Some(account), true) => self.subjective.get_bill_us(account, slot),
      _ => 0,
    };

    let started = Instant::now();
    let result = {
      let pending = self.pending.as_mut().expect("checked above");
      let BlockStage::Building(building) = &mut pending.stage else {
        return Err(ChainError::WrongBlockStage("building"));
      };
      pipeline::apply_transaction(ApplyParams {
        db: &self.db,
        building,
        meta,
        engine: self.engine.as_ref(),
        authorizer: self.authorizer.as_ref(),
        chain_id: self.chain_id,
        mode,
        block_deadline,
        max_trx_time: self.config.max_transaction_time,
        billed_cpu_override,
        subjective_billed_us: prior_bill,
        cpu_leeway_us: self.config.subjective_cpu_leeway_us,
      })
    };

    match result {
      Ok(trace) => {
        meta.accepted.store(true, Ordering::Relaxed);
        if bill_subjectively {
          self.subjective.on_included(meta.id(), slot);
        }
        if !meta.is_transient() {
          self
            .signals
            .applied_transaction
            .emit(&(trace.clone(), meta.packed.clone()));
        }
        Ok(trace)
      }
      Err(error) => {
        let elapsed_us = started.elapsed().as_micros() as u64;
        if mode == BlockMode::Producing && is_input {
          if let Some(account) = &first_auth {
            match &error {
              ChainError::TxCpuUsageExceeded { objective: false, .. } => {
                if bill_subjectively {
                  self.subjective.bill(*meta.id(), account, elapsed_us, slot);
                }
                self.failures.add_failure(account, block_num);
              }
              ChainError::Authorization(_) | ChainError::Execution(_) => {
                self.failures.add_failure(account, block_num);
              }
              _ => {}
            }
          }
        }

        // producing against an explicit bill turns an objective cpu
        // failure into a committed hard-fail receipt
        if let ChainError::TxCpuUsageExceeded { objective: true, .. } = &error
        {
          if let Some(billed) = billed_cpu_override {
            if mode != BlockMode::Speculating {
              return self.commit_hard_fail(meta, billed, error);
            }
          }
        }
        Err(error)
      }
    }
  }

  fn commit_hard_fail(
    &mut self,
    meta: &Arc<TransactionMetadata>,
    billed_us: u64,
    error: ChainError,
  ) -> Result<TransactionTrace> {
    let block_num = {
      let pending = self.pending.as_mut().expect("checked by caller");
      let BlockStage::Building(building) = &mut pending.stage else {
        return Err(ChainError::WrongBlockStage("building"));
      };
      let receipt = TransactionReceipt {
        status: TransactionStatus::HardFail,
        cpu_usage_us: billed_us as u32,
        net_usage_words: 0,
        trx: match meta.trx_type {
          TrxType::Scheduled => ReceiptTrx::Id(*meta.id()),
          _ => ReceiptTrx::Packed(meta.packed.clone()),
        },
      };
      building.receipt_digests.push(receipt.digest());
      building.receipts.push(receipt);
      building.trx_metas.push(Arc::clone(meta));
      building.block_cpu_used_us += billed_us;
      building.block_num()
    };

    if let Some(account) = meta.packed.trx().first_authorizer().cloned() {
      self
        .db
        .write()
        .expect("db lock poisoned")
        .add_transaction_usage(&[account], billed_us, 0, block_num)
        .ok();
    }

    Ok(TransactionTrace {
      id: *meta.id(),
      block_num,
      elapsed_us: billed_us,
      error: Some(error.to_string()),
      error_code: Some(3_080_004), // tx_cpu_usage_exceeded
      ..TransactionTrace::default()
    })
  }

  /// Executes one due scheduled transaction (or expires it), leaving
  /// the matching receipt in the building block.
  pub fn push_scheduled_transaction(
    &mut self,
    key: (TimePointSec, TransactionId),
    block_deadline: Instant,
    billed_cpu_override: Option<u64>,
  ) -> Result<TransactionTrace> {
    let pending_time: TimePointSec = {
      let pending = self
        .pending
        .as_ref()
        .ok_or(ChainError::WrongBlockStage("building"))?;
      pending.timestamp().into()
    };

    let scheduled = {
      let db = self.db.read().expect("db lock poisoned");
      db.scheduled(&key).cloned().ok_or_else(|| {
        ChainError::ForkDatabase("scheduled trx vanished".into())
      })?
    };

    // consuming the row and executing (or expiring) the transaction
    // is one atomic unit: if execution fails, the row stays due
    let mut session = UndoSession::new(&self.db);
    session.with(|db| db.remove_scheduled(&key));

    if scheduled.expiration <= pending_time {
      let trace = self.expire_scheduled_receipt(&scheduled.trx_id)?;
      session.squash();
      return Ok(trace);
    }

    let signed = super::transaction::SignedTransaction::from_wire_bytes(
      &scheduled.packed_trx,
    )?;
    let meta = Arc::new(TransactionMetadata::new(
      PackedTransaction::from_signed(signed),
      TrxType::Scheduled,
    ));
    match self.push_transaction_inner(
      &meta,
      block_deadline,
      billed_cpu_override,
      None,
    ) {
      Ok(trace) => {
        session.squash();
        Ok(trace)
      }
      Err(error) => {
        drop(session);
        Err(error)
      }
    }
  }

  fn expire_scheduled_receipt(
    &mut self,
    id: &TransactionId,
  ) -> Result<TransactionTrace> {
    let pending = self.pending.as_mut().expect("checked by caller");
    let BlockStage::Building(building) = &mut pending.stage else {
      return Err(ChainError::WrongBlockStage("building"));
    };
    let receipt = TransactionReceipt {
      status: TransactionStatus::Expired,
      cpu_usage_us: 0,
      net_usage_words: 0,
      trx: ReceiptTrx::Id(*id),
    };
    building.receipt_digests.push(receipt.digest());
    building.receipts.push(receipt);
    Ok(TransactionTrace { id: *id, ..TransactionTrace::default() })
  }

  /// Drains the unapplied queue and then the due scheduled
  /// transactions into the building block.
  pub fn drain_queues(&mut self, block_deadline: Instant) -> Result<DrainOutcome> {
    if !self.is_building_block() {
      return Err(ChainError::WrongBlockStage("building"));
    }

    let mut retained: HashSet<TransactionId> = HashSet::new();
    while let Some(mut entry) = self.unapplied.next() {
      if retained.contains(entry.meta.id()) {
        // already failed once this block; keep it for the next one
        self.unapplied.add(entry);
        break;
      }
      if self.should_interrupt_start_block(block_deadline) {
        self.unapplied.add(entry);
        return Ok(DrainOutcome::Interrupted);
      }
      if self.block_budget_nearly_exhausted() {
        self.unapplied.add(entry);
        return Ok(DrainOutcome::Exhausted);
      }
      let meta = Arc::clone(&entry.meta);
      let origin = entry.origin;
      match self.push_transaction_inner(
        &meta,
        block_deadline,
        None,
        Some(origin),
      ) {
        Ok(trace) => {
          if let Some(next) = entry.next.take() {
            next(Ok(trace));
          }
        }
        Err(
          error @ (ChainError::BlockCpuExhausted
          | ChainError::BlockNetExhausted),
        ) => {
          debug!("stopping drain: {error}");
          self.unapplied.add(entry);
          return Ok(DrainOutcome::Exhausted);
        }
        Err(ChainError::DeadlineExceeded) => {
          self.unapplied.add(entry);
          return Ok(DrainOutcome::Deadline);
        }
        Err(error @ ChainError::TxCpuUsageExceeded { objective: false, .. }) => {
          // subjectively billed and retained for a later block
          debug!("retaining transaction after subjective failure: {error}");
          retained.insert(*meta.id());
          self.unapplied.add(entry);
        }
        Err(error) => {
          if let Some(next) = entry.next.take() {
            next(Err(error));
          } else {
            debug!("dropping unapplied transaction: {error}");
          }
        }
      }
    }

    // scheduled transactions get their own, smaller time slice
    let scheduled_deadline = (Instant::now()
      + self.config.max_scheduled_transaction_time_per_block)
      .min(block_deadline);
    let pending_time: TimePointSec = self
      .pending
      .as_ref()
      .expect("building checked above")
      .timestamp()
      .into();
    let due = {
      let db = self.db.read().expect("db lock poisoned");
      db.due_scheduled(pending_time)
    };
    for key in due {
      if Instant::now() >= scheduled_deadline
        || self.should_interrupt_start_block(block_deadline)
      {
        return Ok(DrainOutcome::Deadline);
      }
      match self.push_scheduled_transaction(key, block_deadline, None) {
        Ok(_) => {}
        Err(
          error @ (ChainError::BlockCpuExhausted
          | ChainError::BlockNetExhausted),
        ) => {
          debug!("stopping scheduled drain: {error}");
          return Ok(DrainOutcome::Exhausted);
        }
        Err(error) => debug!("scheduled transaction failed: {error}"),
      }
    }

    Ok(DrainOutcome::Drained)
  }

  /// Whether the remaining block budget has fallen under the
  /// configured thresholds, i.e. the block should be produced now
  /// rather than squeezed further.
  fn block_budget_nearly_exhausted(&self) -> bool {
    let Some(pending) = &self.pending else {
      return false;
    };
    let BlockStage::Building(building) = &pending.stage else {
      return false;
    };
    let db = self.db.read().expect("db lock poisoned");
    let params = &db.global().params;
    let cpu_left = (params.max_block_cpu_usage_us as u64)
      .saturating_sub(building.block_cpu_used_us);
    let net_left =
      params.max_block_net_usage.saturating_sub(building.block_net_used);
    cpu_left < self.config.max_block_cpu_usage_threshold_us
      || net_left < self.config.max_block_net_usage_threshold_bytes
  }

  /// Freezes the building block: computes both merkle roots (in
  /// parallel), resolves the schedule and finality extensions, and
  /// moves to the assembled stage.
  pub fn assemble_block(&mut self) -> Result<()> {
    let pending = self
      .pending
      .as_mut()
      .ok_or(ChainError::WrongBlockStage("building"))?;
    let BlockStage::Building(_) = &pending.stage else {
      return Err(ChainError::WrongBlockStage("building"));
    };
    let stage = std::mem::replace(
      &mut pending.stage,
      BlockStage::Assembled(AssembledBlock {
        id: BlockId::default(),
        header: placeholder_header(),
        previous: Arc::clone(self.fork_db.root()),
        new_activated_features: vec![],
        receipts: vec![],
        trx_metas: vec![],
        qc_to_attach: None,
      }),
    );
    let BlockStage::Building(building) = stage else {
      unreachable!("checked above");
    };
    let prev = Arc::clone(&building.previous);

    // schedule promotion mirrors what every validator will compute
    let reached = prev.claimed_irreversible_num();
    let (schedule_version, promoting) = match &prev.pending_schedule {
      Some(pending_schedule)
        if pending_schedule.schedule_lib_num <= reached =>
      {
        (pending_schedule.schedule.version, true)
      }
      _ => (prev.active_schedule.version, false),
    };

    let mut header_extensions = Vec::new();
    if !building.new_activated_features.is_empty() {
      header_extensions
        .push(feature_activation_extension(&building.new_activated_features));
    }

    // finality: carry the best claim (attaching its certificate), or
    // emit the transition extension when armed
    let mut qc_to_attach: Option<QuorumCertificate> = None;
    let mut finality_active = prev.finality_state().is_some();
    {
      let mut db = self.db.write().expect("db lock poisoned");
      if finality_active {
        let (claim, qc) = prev.best_qc_claim();
        let mut new_policy = None;
        db.modify_global(|g| new_policy = g.proposed_finalizer_policy.take());
        let ext = FinalityExtension { qc_claim: claim, new_finalizer_policy: new_policy };
        header_extensions.push(Extension {
          id: FINALITY_EXTENSION_ID,
          data: ext.to_wire_bytes(),
        });
        qc_to_attach = qc;
      } else if db.protocol().finality_transition_armed {
        let mut policy = None;
        db.modify_global(|g| policy = g.proposed_finalizer_policy.take());
        if let Some(policy) = policy {
          let ext = FinalityExtension {
            qc_claim: QcClaim {
              block_num: building.block_num(),
              is_strong: false,
            },
            new_finalizer_policy: Some(policy),
          };
          header_extensions.push(Extension {
            id: FINALITY_EXTENSION_ID,
            data: ext.to_wire_bytes(),
          });
          finality_active = true;
        }
      }
    }

    // a proposed producer schedule ripens into the header once its
    // proposal block is irreversible (legacy protocol only)
    let mut new_producers = None;
    if !finality_active && prev.pending_schedule.is_none() && !promoting {
      let mut db = self.db.write().expect("db lock poisoned");
      let ripe = db
        .global()
        .proposed_schedule
        .as_ref()
        .map(|p| p.proposed_in <= reached)
        .unwrap_or(false);
      if ripe {
        let mut taken = None;
        db.modify_global(|g| taken = g.proposed_schedule.take());
        new_producers = taken.map(|p| p.schedule);
      }
    }

    let (transaction_mroot, action_mroot) = rayon::join(
      || merkle_root(&building.receipt_digests, finality_active),
      || merkle_root(&building.action_receipt_digests, finality_active),
    );

    let header = BlockHeader {
      timestamp: building.timestamp,
      producer: building.producer.clone(),
      confirmed: building.confirmed,
      previous: prev.id,
      transaction_mroot,
      action_mroot,
      schedule_version,
      new_producers,
      header_extensions,
    };

    let pending = self.pending.as_mut().expect("still pending");
    pending.stage = BlockStage::Assembled(AssembledBlock {
      id: header.id(),
      header,
      previous: prev,
      new_activated_features: building.new_activated_features,
      receipts: building.receipts,
      trx_metas: building.trx_metas,
      qc_to_attach,
    });
    Ok(())
  }

  /// Signs the assembled header and atomically: builds the new block
  /// state, inserts it into the fork database and leaves the block's
  /// undo layer on the database stack. Any failure discards the
  /// pending block entirely.
  pub fn complete_block(
    &mut self,
    signer: impl FnOnce(&Digest) -> Signature,
  ) -> Result<Arc<BlockState>> {
    let pending = self
      .pending
      .take()
      .ok_or(ChainError::WrongBlockStage("assembled"))?;
    let PendingBlock { stage, session, mode } = pending;
    let assembled = match stage {
      BlockStage::Assembled(assembled) => assembled,
      other => {
        let name = other.name();
        self.pending = Some(PendingBlock { stage: other, session, mode });
        return Err(ChainError::WrongBlockStage(name));
      }
    };

    let mut block_extensions = Vec::new();
    if let Some(qc) = &assembled.qc_to_attach {
      block_extensions.push(qc.to_extension());
    }
    let signature = signer(&assembled.header.digest());
    let block = SignedBlock {
      header: assembled.header,
      producer_signature: signature,
      transactions: assembled.receipts,
      block_extensions,
    };

    let state = match BlockState::next(
      &assembled.previous,
      block,
      assembled.new_activated_features,
      Trust::Produced,
    ) {
      Ok(state) => state,
      Err(error) => {
        // the session drops here, undoing everything the block staged
        self.resurrect_metas(&assembled.trx_metas);
        return Err(error);
      }
    };
    let state = match self.fork_db.add(Arc::new(state), true) {
      Ok(state) => state,
      Err(error) => {
        self.resurrect_metas(&assembled.trx_metas);
        return Err(error);
      }
    };
    state.cache_trx_metas(assembled.trx_metas);

    if let Some(session) = session {
      session.push();
    }
    self.applied_head = state.id;

    // the block sits in the completed stage while its signals fan
    // out, then the pending slot frees up for the next one
    self.pending = Some(PendingBlock {
      stage: BlockStage::Completed(CompletedBlock {
        state: Arc::clone(&state),
      }),
      session: None,
      mode,
    });

    self.signals.accepted_block_header.emit(&state);
    self.signals.accepted_block.emit(&state);
    info!(
      "produced block {} #{} with {} receipts",
      state.id,
      state.block_num(),
      state.block.transactions.len()
    );

    self.consider_voting(&state);
    self.pending = None;
    self.log_irreversible()?;
    Ok(state)
  }

  /// Drops the pending block: rolls back its session and returns its
  /// input transactions to the unapplied queue for the next attempt.
  pub fn abort_block(&mut self) {
    let Some(pending) = self.pending.take() else {
      return;
    };
    let metas: Vec<Arc<TransactionMetadata>> = match pending.stage {
      BlockStage::Building(building) => building.trx_metas,
      BlockStage::Assembled(assembled) => assembled.trx_metas,
      BlockStage::Completed(_) => Vec::new(),
    };
    self.resurrect_metas(&metas);
    // dropping the session undoes the block's database changes
    drop(pending.session);
  }

  fn resurrect_metas(&mut self, metas: &[Arc<TransactionMetadata>]) {
    for meta in metas {
      if matches!(meta.trx_type, TrxType::Input) {
        self.unapplied.add(UnappliedTransaction {
          meta: Arc::clone(meta),
          origin: TrxOrigin::Aborted,
          next: None,
        });
      }
    }
  }

  // --- incoming blocks and fork arbitration ------------------------

  /// Accepts a block from the network. Returns `Ok(true)` when the
  /// block was accepted or already known. A consensus-rejecting
  /// error leaves the block (and any descendants) out of the fork
  /// database; the caller is expected to drop the sending peer.
  pub fn on_incoming_block(&mut self, block: SignedBlock) -> Result<bool> {
    let id = block.id();
    if self.fork_db.contains(&id)
      || id.num() <= self.fork_db.root().block_num()
    {
      return Ok(true);
    }
    let prev = self
      .fork_db
      .get(&block.header.previous)
      .ok_or(ChainError::UnlinkableBlock(id))?;

    if self.pending.is_some() {
      self.abort_block();
    }

    let activations = block.header.new_feature_activations()?;
    let trust = if self.config.trusted_producers.contains(&block.header.producer)
    {
      Trust::Light
    } else {
      Trust::Full
    };
    let state = BlockState::next(&prev, block, activations, trust)?;
    self.integrate_block_qc(&state)?;

    let state = self.fork_db.add(Arc::new(state), false)?;
    self.received_block.fetch_add(1, Ordering::SeqCst);
    self.signals.accepted_block_header.emit(&state);

    self.consider_voting(&state);
    self.maybe_switch_forks()?;
    Ok(true)
  }

  /// Deep verification of a block's attached certificate, and its
  /// integration into the certified ancestor's state.
  fn integrate_block_qc(&self, state: &BlockState) -> Result<()> {
    let Some(extension) = state.block.qc_extension() else {
      return Ok(());
    };
    let qc = QuorumCertificate::parse(extension)?;
    let target = self
      .fork_db
      .search_on_branch(&state.previous(), qc.block_num)
      .ok_or_else(|| {
        ChainError::InvalidQc(format!(
          "certified block {} is not an ancestor",
          qc.block_num
        ))
      })?;
    let policy = match target.finality_state() {
      Some(finality) => Arc::clone(&finality.active_finalizer_policy),
      None => {
        return Err(ChainError::InvalidQc(
          "certificate for a pre-finality block".into(),
        ))
      }
    };
    qc.verify(&policy, &target.id)?;
    let strong = qc.is_strong(&policy);
    target.set_valid_qc(qc, strong);
    Ok(())
  }

  /// Adopts the preferred head if it changed: rewinds the applied
  /// branch to the common ancestor, replays the winning branch, and
  /// restores the original chain wholesale if any replayed block
  /// fails.
  pub fn maybe_switch_forks(&mut self) -> Result<()> {
    let best = self.fork_db.head();
    if best.id == self.applied_head {
      self.log_irreversible()?;
      return Ok(());
    }

    let (to_apply, to_unwind) =
      self.fork_db.fetch_branch_from(&best.id, &self.applied_head)?;

    if !to_unwind.is_empty() {
      info!(
        "switching forks from {} to {} (unwinding {} blocks)",
        self.applied_head,
        best.id,
        to_unwind.len()
      );
    }

    // rewind to the common ancestor, resurrecting reversed trxs
    for _ in &to_unwind {
      self.pop_block()?;
    }

    let mut applied: Vec<Arc<BlockState>> = Vec::new();
    for state in to_apply.iter().rev() {
      match self.apply_block(state) {
        Ok(()) => applied.push(Arc::clone(state)),
        Err(error) => {
          error!("failed to apply block {}: {error}", state.id);
          self.fork_db.remove_with_descendants(&state.id)?;

          // restore the original head exactly
          for _ in &applied {
            self.pop_block()?;
          }
          for state in to_unwind.iter().rev() {
            self.apply_block(state).map_err(|e| {
              ChainError::ForkDatabase(format!(
                "failed to restore original branch at {}: {e}",
                state.id
              ))
            })?;
          }
          return Err(error);
        }
      }
    }

    self.log_irreversible()?;
    Ok(())
  }

  /// Rolls back the applied tip by one block, returning its input
  /// transactions to the unapplied queue.
  fn pop_block(&mut self) -> Result<()> {
    let state = self.fork_db.get(&self.applied_head).ok_or_else(|| {
      ChainError::ForkDatabase("cannot pop below the fork root".into())
    })?;
    self
      .db
      .write()
      .expect("db lock poisoned")
      .undo()
      .map_err(ChainError::from)?;
    let metas = state.take_cached_trx_metas();
    for meta in metas {
      if matches!(meta.trx_type, TrxType::Input) {
        self.unapplied.add(UnappliedTransaction {
          meta,
          origin: TrxOrigin::Forked,
          next: None,
        });
      }
    }
    self.applied_head = state.previous();
    Ok(())
  }

  /// Re-executes a block from the fork database against the applied
  /// head and checks the outcome against its header.
  fn apply_block(&mut self, state: &Arc<BlockState>) -> Result<()> {
    let block = Arc::clone(&state.block);
    debug_assert_eq!(block.header.previous, self.applied_head);

    let activations = block.header.new_feature_activations()?;
    self.start_block_with(
      block.header.timestamp,
      block.header.producer.clone(),
      block.header.confirmed,
      &activations,
      BlockMode::Validating,
    )?;

    let result = self.apply_block_transactions(state, &block);
    match result {
      Ok(()) => {
        let pending = self.pending.take().expect("validating block");
        if let Some(session) = pending.session {
          session.push();
        }
        self.applied_head = state.id;
        self.fork_db.mark_valid(&state.id);
        self.signals.accepted_block.emit(state);
        Ok(())
      }
      Err(error) => {
        // drop the half-applied block; metas from a failed block are
        // not resurrected
        if let Some(pending) = self.pending.take() {
          drop(pending.session);
        }
        Err(error)
      }
    }
  }

  fn apply_block_transactions(
    &mut self,
    state: &Arc<BlockState>,
    block: &SignedBlock,
  ) -> Result<()> {
    // a far-off wall deadline: validation is bounded by objective
    // budgets, not by production timing
    let block_deadline = Instant::now() + Duration::from_secs(3600);

    let mut cached: std::collections::HashMap<
      TransactionId,
      Arc<TransactionMetadata>,
    > = state
      .take_cached_trx_metas()
      .into_iter()
      .map(|meta| (*meta.id(), meta))
      .collect();
    let mut used_metas = Vec::new();

    for receipt in &block.transactions {
      if is_onblock_receipt(receipt) {
        // start_block already injected and executed our own copy
        continue;
      }
      match (&receipt.trx, receipt.status) {
        (ReceiptTrx::Id(id), TransactionStatus::Expired) => {
          let key = self.scheduled_key_by_id(id)?;
          self
            .db
            .write()
            .expect("db lock poisoned")
            .remove_scheduled(&key);
          self.expire_scheduled_receipt(id)?;
        }
        (ReceiptTrx::Id(id), _) => {
          let key = self.scheduled_key_by_id(id)?;
          self.push_scheduled_transaction(
            key,
            block_deadline,
            Some(receipt.cpu_usage_us as u64),
          )?;
        }
        (ReceiptTrx::Packed(packed), _) => {
          let meta = cached.remove(packed.id()).unwrap_or_else(|| {
            Arc::new(TransactionMetadata::new(
              packed.clone(),
              TrxType::Input,
            ))
          });
          self.push_transaction(
            &meta,
            block_deadline,
            Some(receipt.cpu_usage_us as u64),
          )?;
          used_metas.push(meta);
        }
      }
    }

    // the merkle roots are the arbiter of whether re-execution
    // reproduced the block exactly
    let pending = self.pending.as_ref().expect("validating block");
    let BlockStage::Building(building) = &pending.stage else {
      return Err(ChainError::WrongBlockStage("building"));
    };
    let finality_active = state.finality_state().is_some();
    let transaction_mroot =
      merkle_root(&building.receipt_digests, finality_active);
    if transaction_mroot != block.header.transaction_mroot {
      return Err(ChainError::InvalidMerkleRoot("transaction"));
    }
    let action_mroot =
      merkle_root(&building.action_receipt_digests, finality_active);
    if action_mroot != block.header.action_mroot {
      return Err(ChainError::InvalidMerkleRoot("action"));
    }

    state.cache_trx_metas(used_metas);
    Ok(())
  }

  fn scheduled_key_by_id(
    &self,
    id: &TransactionId,
  ) -> Result<(TimePointSec, TransactionId)> {
    let db = self.db.read().expect("db lock poisoned");
    db.tables()
      .scheduled
      .keys()
      .find(|(_, trx_id)| trx_id == id)
      .copied()
      .ok_or_else(|| {
        ChainError::ProtocolFeatureBadBlock(format!(
          "receipt references unknown scheduled transaction {id}"
        ))
      })
  }

  fn verify_tapos(
    fork_db: &ForkDatabase,
    block_log: &mut BlockLog,
    parent: &Arc<BlockState>,
    ref_block_num: u16,
    ref_block_prefix: u32,
  ) -> Result<()> {
    let head_num = parent.block_num();
    let masked = head_num & 0xffff;
    let delta = masked.wrapping_sub(ref_block_num as u32) & 0xffff;
    if delta > head_num {
      return Err(ChainError::InvalidRefBlock(ref_block_num));
    }
    let candidate = head_num - delta;

    let id = if let Some(state) = fork_db.search_on_branch(&parent.id, candidate)
    {
      state.id
    } else {
      match block_log
        .read_by_num(candidate)
        .map_err(|e| ChainError::BlockLog(e.to_string()))?
      {
        Some(block) => block.id(),
        None => return Err(ChainError::InvalidRefBlock(ref_block_num)),
      }
    };
    if id.ref_prefix() != ref_block_prefix {
      return Err(ChainError::InvalidRefBlock(ref_block_num));
    }
    Ok(())
  }

  // --- irreversibility ---------------------------------------------

  /// Advances the last irreversible block: appends every newly final
  /// block to the block log (serialized in parallel), commits its
  /// database revision and advances the fork root. A failed append
  /// stops the loop, leaving the already-appended prefix durable.
  pub fn log_irreversible(&mut self) -> Result<()> {
    let head_state = self.applied_head_state();
    let target = head_state
      .claimed_irreversible_num()
      .max(self.vote_lib_num);
    let root_num = self.fork_db.root().block_num();
    if target <= root_num {
      return Ok(());
    }

    let branch: Vec<Arc<BlockState>> = self
      .fork_db
      .fetch_branch(&self.applied_head, Some(target))
      .into_iter()
      .rev()
      .collect();

    let serialized: Vec<(u32, BlockId, BlockId, Vec<u8>)> = branch
      .par_iter()
      .map(|state| {
        (
          state.block_num(),
          state.id,
          state.previous(),
          state.block.to_wire_bytes(),
        )
      })
      .collect();

    for (state, (num, id, previous, bytes)) in
      branch.iter().zip(serialized)
    {
      if let Err(e) = self.block_log.append_serialized(num, id, previous, &bytes)
      {
        error!("block log append failed at {num}: {e}");
        break;
      }
      self.db.write().expect("db lock poisoned").commit(num as i64);
      self.fork_db.advance_root(&id)?;
      self.signals.irreversible_block.emit(state);
      debug!("block {num} is irreversible");

      if self.config.terminate_at_block > 0
        && num >= self.config.terminate_at_block
      {
        info!("reached terminate-at-block {num}");
        self.shutdown_requested = true;
        break;
      }
    }
    Ok(())
  }

  // --- finality votes ----------------------------------------------

  /// Aggregates one finalizer vote. Returns whether the vote was
  /// accepted into some block's pending certificate.
  pub fn on_finalizer_vote(&mut self, vote: &VoteMessage) -> bool {
    if !vote.verify() {
      warn!("rejecting vote with invalid signature for {}", vote.block_id);
      return false;
    }
    let Some(state) = self.fork_db.get(&vote.block_id) else {
      debug!("vote for unknown block {}", vote.block_id);
      return false;
    };
    let Some(finality) = state.finality_state() else {
      return false;
    };
    let policy = Arc::clone(&finality.active_finalizer_policy);
    let Some(index) = policy.index_of(&vote.finalizer_key) else {
      warn!("vote from a key outside the finalizer policy");
      return false;
    };

    let reached_strong = {
      let mut pending = state.pending_qc.lock().expect("qc lock poisoned");
      let pending = pending.get_or_insert_with(|| PendingQc::new(&policy));
      match pending.add_vote(index, vote.strong, vote.signature) {
        Ok(qc_state) => {
          let quorum = !matches!(qc_state, QcState::Aggregating);
          if quorum {
            match pending.to_qc(state.block_num()) {
              Ok(qc) => {
                let strong = matches!(qc_state, QcState::StrongAchieved);
                state.set_valid_qc(qc, strong);
                strong
              }
              Err(e) => {
                warn!("failed to aggregate certificate: {e}");
                false
              }
            }
          } else {
            false
          }
        }
        Err(e) => {
          debug!("vote not aggregated: {e}");
          return false;
        }
      }
    };

    if reached_strong {
      let final_num = finality.core.final_on_strong_qc_block_num;
      if final_num > self.vote_lib_num {
        self.vote_lib_num = final_num;
        if let Err(e) = self.log_irreversible() {
          error!("irreversibility advance failed: {e}");
        }
      }
    }
    true
  }

  /// Lets every locally configured finalizer consider voting on a
  /// newly accepted block, aggregating our own votes immediately.
  fn consider_voting(&mut self, state: &Arc<BlockState>) {
    let Some(finality) = state.finality_state() else {
      return;
    };
    let claim = finality.core.latest_qc_claim();
    let mut votes = Vec::new();
    for finalizer in &mut self.finalizers {
      match finalizer.maybe_vote(&state.id, state.timestamp(), claim) {
        Ok(Some(vote)) => votes.push(vote),
        Ok(None) => {}
        Err(e) => warn!("finalizer could not persist its safety record: {e}"),
      }
    }
    for vote in votes {
      self.signals.voted_block.emit(&vote);
      self.on_finalizer_vote(&vote);
    }
  }

  // --- incoming transactions ---------------------------------------

  fn check_subjective_lists(
    &self,
    meta: &Arc<TransactionMetadata>,
  ) -> Result<()> {
    let trx = meta.packed.trx();
    for action in &trx.actions {
      if !self.config.contract_whitelist.is_empty()
        && !self.config.contract_whitelist.contains(&action.account)
      {
        return Err(ChainError::Authorization(format!(
          "contract {} is not whitelisted",
          action.account
        )));
      }
      if self.config.contract_blacklist.contains(&action.account) {
        return Err(ChainError::Authorization(format!(
          "contract {} is blacklisted",
          action.account
        )));
      }
      if self
        .config
        .action_blacklist
        .contains(&(action.account.clone(), action.name.clone()))
      {
        return Err(ChainError::Authorization(format!(
          "action {}::{} is blacklisted",
          action.account, action.name
        )));
      }
      for level in &action.authorization {
        if !self.config.actor_whitelist.is_empty()
          && !self.config.actor_whitelist.contains(&level.actor)
        {
          return Err(ChainError::Authorization(format!(
            "actor {} is not whitelisted",
            level.actor
          )));
        }
        if self.config.actor_blacklist.contains(&level.actor) {
          return Err(ChainError::Authorization(format!(
            "actor {} is blacklisted",
            level.actor
          )));
        }
      }
    }
    for signature in &meta.packed.signed().signatures {
      if self.config.key_blacklist.contains(&signature.key) {
        return Err(ChainError::Authorization(format!(
          "key {} is blacklisted",
          signature.key
        )));
      }
    }
    Ok(())
  }

  /// Entry point for transactions arriving from the API or p2p. The
  /// callback fires exactly once: with the trace after the
  /// transaction is applied in some block attempt, or with the error
  /// that disposed of it. Read-only transactions are deferred to the
  /// next read window.
  pub fn on_incoming_transaction_async(
    &mut self,
    packed: PackedTransaction,
    trx_type: TrxType,
    api: bool,
    next: NextCallback,
  ) {
    let meta = Arc::new(TransactionMetadata::new(packed, trx_type));
    if meta.is_read_only() {
      match &self.read_only_queue {
        Some(queue) => {
          queue
            .lock()
            .expect("read-only queue poisoned")
            .push_back(crate::window::ReadOnlyJob { meta, next: Some(next) });
        }
        None => next(Err(ChainError::Execution(
          "read-only execution is not enabled".into(),
        ))),
      }
      return;
    }
    if let Err(error) = self.check_subjective_lists(&meta) {
      next(Err(error));
      return;
    }
    self.unapplied.add(UnappliedTransaction {
      meta,
      origin: if api {
        TrxOrigin::IncomingApi
      } else {
        TrxOrigin::IncomingP2p
      },
      next: Some(next),
    });
  }

  pub fn unapplied_len(&self) -> usize {
    self.unapplied.len()
  }

  // --- snapshots ---------------------------------------------------

  /// Writes a snapshot of the committed state (head block state plus
  /// all tables) and returns the integrity hash of the stream.
  pub fn write_snapshot(&self, out: impl std::io::Write) -> Result<Digest> {
    if self.pending.is_some() {
      return Err(ChainError::Snapshot(
        "cannot snapshot while a block is pending".into(),
      ));
    }
    let head = self.applied_head_state();
    let mut writer = SnapshotWriter::new(out)?;
    writer.write_block_state(&SerializedBlockState::capture(&head))?;
    let db = self.db.read().expect("db lock poisoned");
    writer.write_tables(db.tables())?;
    writer.finish()
  }

  /// The canonical digest of committed state: the integrity hash of
  /// the snapshot this node would write right now.
  pub fn integrity_hash(&self) -> Result<Digest> {
    self.write_snapshot(std::io::sink())
  }

  /// Boots a node from a snapshot: the restored head becomes the
  /// fork-database root and the tables become the committed state.
  pub fn from_snapshot(
    input: impl std::io::Read,
    config: Config,
    engine: Arc<dyn ExecutionEngine>,
    authorizer: Arc<dyn AuthorizationChecker>,
    block_log_dir: &std::path::Path,
  ) -> Result<Self> {
    let mut reader = SnapshotReader::new(input)?;
    let head = reader.read_block_state()?.restore()?;
    let tables = reader.read_tables()?;

    let mut db = Database::new();
    db.restore_tables(tables)?;
    db.set_revision(head.block_num() as i64)?;
    let chain_id = db.global().chain_id;

    let block_log = BlockLog::open(block_log_dir)
      .map_err(|e| ChainError::BlockLog(e.to_string()))?;
    let root = Arc::new(head);
    let applied_head = root.id;

    Ok(Self {
      chain_id,
      db: shared(db),
      fork_db: ForkDatabase::new(root),
      block_log,
      pending: None,
      unapplied: UnappliedQueue::new(
        config.incoming_transaction_queue_size_mb * 1024 * 1024,
      ),
      subjective: SubjectiveBilling::new(
        config.subjective_account_decay_time_minutes,
        config.disable_subjective_billing,
      ),
      failures: FailureTracker::new(
        config.subjective_account_max_failures,
        config.subjective_account_max_failures_window_size,
      ),
      engine,
      authorizer,
      signals: Signals::default(),
      finalizers: Vec::new(),
      applied_head,
      vote_lib_num: 0,
      received_block: Arc::new(AtomicU64::new(0)),
      received_at_block_start: 0,
      read_only_queue: None,
      shutdown_requested: false,
      config,
    })
  }
}

/// Whether a receipt embeds the implicit onblock transaction: the
/// system onblock action, unsigned.
fn is_onblock_receipt(receipt: &TransactionReceipt) -> bool {
  let ReceiptTrx::Packed(packed) = &receipt.trx else {
    return false;
  };
  packed.signed().signatures.is_empty()
    && packed.trx().actions.len() == 1
    && packed.trx().actions[0].account.as_str() == SYSTEM_ACCOUNT
    && packed.trx().actions[0].name == ONBLOCK_ACTION
}

fn placeholder_header() -> BlockHeader {
  BlockHeader {
    timestamp: BlockTimestamp(0),
    producer: AccountName::default(),
    confirmed: 0,
    previous: BlockId::default(),
    transaction_mroot: Digest::default(),
    action_mroot: Digest::default(),
    schedule_version: 0,
    new_producers: None,
    header_extensions: vec![],
  }
}

/// Root over an ordered digest list with the algorithm the block's
/// protocol state selects: the canonical balanced tree before the
/// finality upgrade, the mountain range after.
fn merkle_root(digests: &[Digest], finality_active: bool) -> Digest {
  if finality_active {
    let mut range = MountainRange::new();
    range.extend(digests.iter().copied());
    range.root()
  } else {
    canonical_merkle(digests)
  }
}
