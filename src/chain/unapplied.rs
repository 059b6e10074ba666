//! The unapplied transaction queue.
//!
//! Node-local holding area for transactions that should be tried (or
//! retried) in a future block: transactions resurrected from an
//! abandoned fork, transactions from an aborted pending block, and
//! fresh arrivals from the API or p2p. Bounded by a byte budget;
//! overflow rejects newcomers rather than evicting older work.

use {
  super::{error::ChainError, transaction::TransactionMetadata},
  crate::{
    exec::TransactionTrace,
    primitives::{TimePointSec, TransactionId},
  },
  indexmap::IndexMap,
  std::{collections::VecDeque, sync::Arc},
};

/// Delivery callback attached to an incoming transaction; invoked
/// exactly once with the trace or the error that disposed of it.
pub type NextCallback =
  Box<dyn FnOnce(Result<TransactionTrace, ChainError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxOrigin {
  Forked,
  Aborted,
  IncomingApi,
  IncomingP2p,
}

impl TrxOrigin {
  /// Drain priority: forked first, then aborted, then fresh input.
  fn bucket(&self) -> usize {
    match self {
      TrxOrigin::Forked => 0,
      TrxOrigin::Aborted => 1,
      TrxOrigin::IncomingApi | TrxOrigin::IncomingP2p => 2,
    }
  }
}

pub struct UnappliedTransaction {
  pub meta: Arc<TransactionMetadata>,
  pub origin: TrxOrigin,
  pub next: Option<NextCallback>,
}

impl UnappliedTransaction {
  fn expiration(&self) -> TimePointSec {
    self.meta.packed.trx().expiration
  }

  fn footprint(&self) -> usize {
    self.meta.packed.size() + std::mem::size_of::<Self>()
  }
}

pub struct UnappliedQueue {
  entries: IndexMap<TransactionId, UnappliedTransaction>,
  buckets: [VecDeque<TransactionId>; 3],
  size_bytes: usize,
  max_bytes: usize,
}

impl UnappliedQueue {
  pub fn new(max_bytes: usize) -> Self {
    Self {
      entries: IndexMap::new(),
      buckets: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
      size_bytes: 0,
      max_bytes,
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn contains(&self, id: &TransactionId) -> bool {
    self.entries.contains_key(id)
  }

  /// Queues a transaction. Duplicates are ignored (the callback of
  /// the duplicate, if any, is failed). A full queue rejects the
  /// newcomer the same way.
  pub fn add(&mut self, mut unapplied: UnappliedTransaction) {
    let id = *unapplied.meta.id();
    if self.entries.contains_key(&id) {
      if let Some(next) = unapplied.next.take() {
        next(Err(ChainError::TxDuplicate(id)));
      }
      return;
    }
    let footprint = unapplied.footprint();
    if self.size_bytes + footprint > self.max_bytes {
      if let Some(next) = unapplied.next.take() {
        next(Err(ChainError::BlockNetExhausted));
      }
      return;
    }
    self.size_bytes += footprint;
    self.buckets[unapplied.origin.bucket()].push_back(id);
    self.entries.insert(id, unapplied);
  }

  /// Pops the highest-priority transaction, forked branches first.
  pub fn next(&mut self) -> Option<UnappliedTransaction> {
    for bucket in &mut self.buckets {
      while let Some(id) = bucket.pop_front() {
        if let Some(entry) = self.entries.shift_remove(&id) {
          self.size_bytes -= entry.footprint();
          return Some(entry);
        }
        // stale id: the entry was dropped by expiry
      }
    }
    None
  }

  /// Removes a specific transaction (e.g. it arrived inside a block
  /// from the network and no longer needs local retry).
  pub fn remove(&mut self, id: &TransactionId) -> Option<UnappliedTransaction> {
    let entry = self.entries.shift_remove(id)?;
    self.size_bytes -= entry.footprint();
    Some(entry)
  }

  /// Drops every transaction expired at `now`, reporting each to the
  /// handler (which typically fails its delivery callback).
  pub fn clear_expired(
    &mut self,
    now: TimePointSec,
    mut on_expired: impl FnMut(TransactionId, Option<NextCallback>),
  ) {
    let expired: Vec<TransactionId> = self
      .entries
      .iter()
      .filter(|(_, e)| e.expiration() <= now)
      .map(|(id, _)| *id)
      .collect();
    for id in expired {
      if let Some(mut entry) = self.entries.shift_remove(&id) {
        self.size_bytes -= entry.footprint();
        on_expired(id, entry.next.take());
      }
    }
  }

  pub fn size_bytes(&self) -> usize {
    self.size_bytes
  }
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
      primitives::Keypair,
    },
  };

  fn meta(data: &[u8]) -> Arc<TransactionMetadata> {
    let key = Keypair::from_seed([1u8; 32]);
    Arc::new(TransactionMetadata::new(
      PackedTransaction::from_signed(test_transaction(&key, "alice", data)),
      TrxType::Input,
    ))
  }

  fn entry(data: &[u8], origin: TrxOrigin) -> UnappliedTransaction {
    UnappliedTransaction { meta: meta(data), origin, next: None }
  }

  #[test]
  fn drains_forked_before_incoming() {
    let mut queue = UnappliedQueue::new(1 << 20);
    queue.add(entry(b"incoming", TrxOrigin::IncomingApi));
    queue.add(entry(b"aborted", TrxOrigin::Aborted));
    queue.add(entry(b"forked", TrxOrigin::Forked));

    assert_eq!(queue.next().unwrap().origin, TrxOrigin::Forked);
    assert_eq!(queue.next().unwrap().origin, TrxOrigin::Aborted);
    assert_eq!(queue.next().unwrap().origin, TrxOrigin::IncomingApi);
    assert!(queue.next().is_none());
  }

  #[test]
  fn duplicate_ids_fail_their_callback() {
    let mut queue = UnappliedQueue::new(1 << 20);
    queue.add(entry(b"x", TrxOrigin::IncomingApi));

    let (tx, rx) = std::sync::mpsc::channel();
    let mut dup = entry(b"x", TrxOrigin::IncomingApi);
    dup.next = Some(Box::new(move |result| {
      tx.send(result.is_err()).unwrap();
    }));
    queue.add(dup);

    assert!(rx.recv().unwrap());
    assert_eq!(queue.len(), 1);
  }

  #[test]
  fn byte_budget_rejects_newcomers() {
    let first = entry(b"first", TrxOrigin::IncomingApi);
    let mut queue = UnappliedQueue::new(first.footprint());
    queue.add(first);
    assert_eq!(queue.len(), 1);

    let (tx, rx) = std::sync::mpsc::channel();
    let mut over = entry(b"second, does not fit", TrxOrigin::IncomingApi);
    over.next = Some(Box::new(move |result| {
      tx.send(result.is_err()).unwrap();
    }));
    queue.add(over);
    assert!(rx.recv().unwrap());
    assert_eq!(queue.len(), 1);
  }

  #[test]
  fn expiry_evicts_and_reports() {
    let mut queue = UnappliedQueue::new(1 << 20);
    let e = entry(b"will expire", TrxOrigin::IncomingApi);
    let expiration = e.expiration();
    queue.add(e);

    let mut reported = vec![];
    queue.clear_expired(expiration, |id, _| reported.push(id));
    assert_eq!(reported.len(), 1);
    assert!(queue.is_empty());
    assert_eq!(queue.size_bytes(), 0);
    // the popped bucket entry is stale now and silently skipped
    assert!(queue.next().is_none());
  }
}
