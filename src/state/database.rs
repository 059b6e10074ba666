//! The chain-state database.
//!
//! A set of ordered tables mutated in place, with a stack of undo
//! layers on top. Each layer records the previous value of every row
//! it first touches, so `undo` restores the exact prior state and
//! `squash` folds a layer into its parent. The controller keeps one
//! layer per reversible block (revision == block number) plus short
//! lived nested layers for the pending block and each transaction.

use {
  super::objects::{
    AccountObject,
    AccountUsage,
    GlobalProperties,
    ProtocolState,
    ScheduledTransaction,
  },
  crate::primitives::{AccountName, Digest, TimePointSec, TransactionId},
  serde::{Deserialize, Serialize},
  std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
  },
  thiserror::Error,
  tracing::warn,
};

#[derive(Debug, Error)]
pub enum DbError {
  #[error("no undo session is active")]
  NoActiveSession,

  #[error("cannot set revision while {0} undo sessions are open")]
  SessionsOpen(usize),

  #[error("account {0} already exists")]
  AccountExists(AccountName),

  #[error("unknown account {0}")]
  UnknownAccount(AccountName),

  #[error("database object guard exceeded ({0} live objects)")]
  Guard(usize),
}

type Result<T> = std::result::Result<T, DbError>;

/// All consensus tables, serializable as a unit for snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTables {
  pub accounts: BTreeMap<AccountName, AccountObject>,
  pub contract_kv: BTreeMap<(AccountName, Vec<u8>), Vec<u8>>,
  pub scheduled: BTreeMap<(TimePointSec, TransactionId), ScheduledTransaction>,
  pub dedup: BTreeMap<(TimePointSec, TransactionId), ()>,
  pub dedup_by_id: BTreeMap<TransactionId, TimePointSec>,
  pub usage: BTreeMap<AccountName, AccountUsage>,
  pub global: GlobalProperties,
  pub protocol: ProtocolState,
}

impl ChainTables {
  fn object_count(&self) -> usize {
    self.accounts.len()
      + self.contract_kv.len()
      + self.scheduled.len()
      + self.dedup.len()
      + self.usage.len()
  }
}

/// Previous values of rows first touched inside one undo layer.
/// `None` means the row did not exist before the layer.
#[derive(Debug, Default)]
struct UndoLayer {
  revision: i64,
  accounts: BTreeMap<AccountName, Option<AccountObject>>,
  contract_kv: BTreeMap<(AccountName, Vec<u8>), Option<Vec<u8>>>,
  scheduled:
    BTreeMap<(TimePointSec, TransactionId), Option<ScheduledTransaction>>,
  dedup: BTreeMap<(TimePointSec, TransactionId), Option<()>>,
  dedup_by_id: BTreeMap<TransactionId, Option<TimePointSec>>,
  usage: BTreeMap<AccountName, Option<AccountUsage>>,
  global: Option<GlobalProperties>,
  protocol: Option<ProtocolState>,
}

fn record<K: Ord + Clone, V: Clone>(
  undo: &mut BTreeMap<K, Option<V>>,
  live: &BTreeMap<K, V>,
  key: &K,
) {
  if !undo.contains_key(key) {
    undo.insert(key.clone(), live.get(key).cloned());
  }
}

fn restore<K: Ord, V>(live: &mut BTreeMap<K, V>, undo: BTreeMap<K, Option<V>>) {
  for (key, old) in undo {
    match old {
      Some(value) => {
        live.insert(key, value);
      }
      None => {
        live.remove(&key);
      }
    }
  }
}

fn merge_down<K: Ord, V>(
  parent: &mut BTreeMap<K, Option<V>>,
  child: BTreeMap<K, Option<V>>,
) {
  for (key, old) in child {
    parent.entry(key).or_insert(old);
  }
}

#[derive(Debug, Default)]
pub struct Database {
  tables: ChainTables,
  undo_stack: Vec<UndoLayer>,
  revision: i64,
  /// Optional ceiling on live object count; exceeding it is the
  /// database guard tripping, which the node treats as fatal.
  guard: Option<usize>,
}

impl Database {
  pub fn new() -> Self {
    Self::default()
  }

  /// A detached database over a copy of some committed tables; used
  /// by read-only workers, which execute against a snapshot and
  /// discard it.
  pub fn from_tables(tables: ChainTables) -> Self {
    Self { tables, ..Self::default() }
  }

  pub fn set_guard(&mut self, max_objects: usize) {
    self.guard = Some(max_objects);
  }

  fn check_guard(&self) -> Result<()> {
    if let Some(max) = self.guard {
      let live = self.tables.object_count();
      if live >= max {
        return Err(DbError::Guard(live));
      }
    }
    Ok(())
  }

  pub fn revision(&self) -> i64 {
    self.revision
  }

  /// Sets the base revision. Only legal with no open sessions; used
  /// when seeding from genesis or restoring from a snapshot.
  pub fn set_revision(&mut self, revision: i64) -> Result<()> {
    if !self.undo_stack.is_empty() {
      return Err(DbError::SessionsOpen(self.undo_stack.len()));
    }
    self.revision = revision;
    Ok(())
  }

  pub(crate) fn begin_undo(&mut self) -> i64 {
    self.revision += 1;
    self.undo_stack.push(UndoLayer {
      revision: self.revision,
      ..UndoLayer::default()
    });
    self.revision
  }

  pub fn session_count(&self) -> usize {
    self.undo_stack.len()
  }

  /// Reverts every change recorded by the top undo layer.
  pub fn undo(&mut self) -> Result<()> {
    let layer = self.undo_stack.pop().ok_or(DbError::NoActiveSession)?;
    restore(&mut self.tables.accounts, layer.accounts);
    restore(&mut self.tables.contract_kv, layer.contract_kv);
    restore(&mut self.tables.scheduled, layer.scheduled);
    restore(&mut self.tables.dedup, layer.dedup);
    restore(&mut self.tables.dedup_by_id, layer.dedup_by_id);
    restore(&mut self.tables.usage, layer.usage);
    if let Some(global) = layer.global {
      self.tables.global = global;
    }
    if let Some(protocol) = layer.protocol {
      self.tables.protocol = protocol;
    }
    self.revision -= 1;
    Ok(())
  }

  /// Folds the top undo layer into its parent, keeping its changes.
  pub fn squash(&mut self) -> Result<()> {
    let layer = self.undo_stack.pop().ok_or(DbError::NoActiveSession)?;
    let parent = match self.undo_stack.last_mut() {
      Some(parent) => parent,
      None => {
        // no parent: squashing into the committed base just forgets
        // the undo information
        self.revision = layer.revision - 1;
        return Ok(());
      }
    };
    merge_down(&mut parent.accounts, layer.accounts);
    merge_down(&mut parent.contract_kv, layer.contract_kv);
    merge_down(&mut parent.scheduled, layer.scheduled);
    merge_down(&mut parent.dedup, layer.dedup);
    merge_down(&mut parent.dedup_by_id, layer.dedup_by_id);
    if parent.global.is_none() {
      parent.global = layer.global;
    }
    if parent.protocol.is_none() {
      parent.protocol = layer.protocol;
    }
    merge_down(&mut parent.usage, layer.usage);
    self.revision = layer.revision - 1;
    Ok(())
  }

  pub fn undo_all(&mut self) {
    while !self.undo_stack.is_empty() {
      self.undo().expect("stack is non-empty");
    }
  }

  /// Makes every layer at or below `revision` permanent by dropping
  /// its undo information. Called when blocks become irreversible.
  pub fn commit(&mut self, revision: i64) {
    while let Some(first) = self.undo_stack.first() {
      if first.revision > revision {
        break;
      }
      self.undo_stack.remove(0);
    }
  }

  // --- accounts --------------------------------------------------

  pub fn account(&self, name: &AccountName) -> Option<&AccountObject> {
    self.tables.accounts.get(name)
  }

  pub fn create_account(&mut self, account: AccountObject) -> Result<()> {
    self.check_guard()?;
    if self.tables.accounts.contains_key(&account.name) {
      return Err(DbError::AccountExists(account.name));
    }
    let Database { tables, undo_stack, .. } = self;
    if let Some(layer) = undo_stack.last_mut() {
      record(&mut layer.accounts, &tables.accounts, &account.name);
    }
    tables.accounts.insert(account.name.clone(), account);
    Ok(())
  }

  pub fn modify_account(
    &mut self,
    name: &AccountName,
    f: impl FnOnce(&mut AccountObject),
  ) -> Result<()> {
    let Database { tables, undo_stack, .. } = self;
    let account = tables
      .accounts
      .get(name)
      .ok_or_else(|| DbError::UnknownAccount(name.clone()))?;
    if let Some(layer) = undo_stack.last_mut() {
      layer
        .accounts
        .entry(name.clone())
        .or_insert_with(|| Some(account.clone()));
    }
    f(tables.accounts.get_mut(name).unwrap());
    Ok(())
  }

  pub fn accounts(&self) -> impl Iterator<Item = &AccountObject> {
    self.tables.accounts.values()
  }

  // --- contract key-value rows ------------------------------------

  pub fn kv_get(&self, owner: &AccountName, key: &[u8]) -> Option<&Vec<u8>> {
    self.tables.contract_kv.get(&(owner.clone(), key.to_vec()))
  }

  pub fn kv_set(
    &mut self,
    owner: &AccountName,
    key: Vec<u8>,
    value: Vec<u8>,
  ) -> Result<()> {
    self.check_guard()?;
    let full_key = (owner.clone(), key);
    let Database { tables, undo_stack, .. } = self;
    if let Some(layer) = undo_stack.last_mut() {
      record(&mut layer.contract_kv, &tables.contract_kv, &full_key);
    }
    tables.contract_kv.insert(full_key, value);
    Ok(())
  }

  pub fn kv_remove(&mut self, owner: &AccountName, key: &[u8]) {
    let full_key = (owner.clone(), key.to_vec());
    let Database { tables, undo_stack, .. } = self;
    if let Some(layer) = undo_stack.last_mut() {
      record(&mut layer.contract_kv, &tables.contract_kv, &full_key);
    }
    tables.contract_kv.remove(&full_key);
  }

  // --- scheduled (deferred) transactions --------------------------

  pub fn schedule_transaction(
    &mut self,
    scheduled: ScheduledTransaction,
  ) -> Result<()> {
    self.check_guard()?;
    let key = (scheduled.delay_until, scheduled.trx_id);
    let Database { tables, undo_stack, .. } = self;
    if let Some(layer) = undo_stack.last_mut() {
      record(&mut layer.scheduled, &tables.scheduled, &key);
    }
    tables.scheduled.insert(key, scheduled);
    Ok(())
  }

  pub fn remove_scheduled(&mut self, key: &(TimePointSec, TransactionId)) {
    let Database { tables, undo_stack, .. } = self;
    if let Some(layer) = undo_stack.last_mut() {
      record(&mut layer.scheduled, &tables.scheduled, key);
    }
    tables.scheduled.remove(key);
  }

  /// Scheduled transactions whose delay has elapsed, oldest first.
  pub fn due_scheduled(
    &self,
    now: TimePointSec,
  ) -> Vec<(TimePointSec, TransactionId)> {
    self
      .tables
      .scheduled
      .range(..=(now, Digest([0xff; 32])))
      .map(|(key, _)| *key)
      .collect()
  }

  pub fn scheduled(
    &self,
    key: &(TimePointSec, TransactionId),
  ) -> Option<&ScheduledTransaction> {
    self.tables.scheduled.get(key)
  }

  pub fn all_scheduled(&self) -> Vec<(TimePointSec, TransactionId)> {
    self.tables.scheduled.keys().copied().collect()
  }

  // --- transaction dedup index ------------------------------------

  /// Records a transaction id until its expiration. Returns false if
  /// the id is already known (a duplicate).
  pub fn dedup_insert(
    &mut self,
    expiration: TimePointSec,
    id: TransactionId,
  ) -> Result<bool> {
    if self.tables.dedup_by_id.contains_key(&id) {
      return Ok(false);
    }
    self.check_guard()?;
    let key = (expiration, id);
    let Database { tables, undo_stack, .. } = self;
    if let Some(layer) = undo_stack.last_mut() {
      record(&mut layer.dedup, &tables.dedup, &key);
      record(&mut layer.dedup_by_id, &tables.dedup_by_id, &id);
    }
    tables.dedup.insert(key, ());
    tables.dedup_by_id.insert(id, expiration);
    Ok(true)
  }

  pub fn dedup_contains(&self, id: &TransactionId) -> bool {
    self.tables.dedup_by_id.contains_key(id)
  }

  /// Drops every dedup entry that expired at or before `now`.
  pub fn dedup_expire(&mut self, now: TimePointSec) -> Vec<TransactionId> {
    let expired: Vec<(TimePointSec, TransactionId)> = self
      .tables
      .dedup
      .range(..=(now, Digest([0xff; 32])))
      .map(|(key, _)| *key)
      .collect();
    let Database { tables, undo_stack, .. } = self;
    for key in &expired {
      if let Some(layer) = undo_stack.last_mut() {
        record(&mut layer.dedup, &tables.dedup, key);
        record(&mut layer.dedup_by_id, &tables.dedup_by_id, &key.1);
      }
      tables.dedup.remove(key);
      tables.dedup_by_id.remove(&key.1);
    }
    expired.into_iter().map(|(_, id)| id).collect()
  }

  // --- resource usage ---------------------------------------------

  pub fn usage(&self, name: &AccountName) -> Option<&AccountUsage> {
    self.tables.usage.get(name)
  }

  pub fn modify_usage(
    &mut self,
    name: &AccountName,
    f: impl FnOnce(&mut AccountUsage),
  ) {
    let Database { tables, undo_stack, .. } = self;
    if let Some(layer) = undo_stack.last_mut() {
      record(&mut layer.usage, &tables.usage, name);
    }
    f(tables.usage.entry(name.clone()).or_default());
  }

  // --- singletons -------------------------------------------------

  pub fn global(&self) -> &GlobalProperties {
    &self.tables.global
  }

  pub fn modify_global(&mut self, f: impl FnOnce(&mut GlobalProperties)) {
    let Database { tables, undo_stack, .. } = self;
    if let Some(layer) = undo_stack.last_mut() {
      layer.global.get_or_insert_with(|| tables.global.clone());
    }
    f(&mut tables.global);
  }

  pub fn protocol(&self) -> &ProtocolState {
    &self.tables.protocol
  }

  pub fn modify_protocol(&mut self, f: impl FnOnce(&mut ProtocolState)) {
    let Database { tables, undo_stack, .. } = self;
    if let Some(layer) = undo_stack.last_mut() {
      layer.protocol.get_or_insert_with(|| tables.protocol.clone());
    }
    f(&mut tables.protocol);
  }

  // --- snapshot support -------------------------------------------

  pub fn tables(&self) -> &ChainTables {
    &self.tables
  }

  /// Replaces the whole state. Only legal with no open sessions.
  pub fn restore_tables(&mut self, tables: ChainTables) -> Result<()> {
    if !self.undo_stack.is_empty() {
      return Err(DbError::SessionsOpen(self.undo_stack.len()));
    }
    self.tables = tables;
    Ok(())
  }
}

pub type SharedDb = Arc<RwLock<Database>>;

pub fn shared(db: Database) -> SharedDb {
  Arc::new(RwLock::new(db))
}

/// RAII undo scope over a [`SharedDb`].
///
/// Ends in exactly one of three ways: [`UndoSession::squash`] merges
/// the changes into the enclosing session, [`UndoSession::push`]
/// leaves the layer on the stack (used at block boundaries so the
/// block can later be popped), and dropping the session without
/// either undoes it.
pub struct UndoSession {
  db: SharedDb,
  revision: i64,
  armed: bool,
}

impl UndoSession {
  pub fn new(db: &SharedDb) -> Self {
    let revision = db.write().expect("db lock poisoned").begin_undo();
    Self { db: Arc::clone(db), revision, armed: true }
  }

  pub fn revision(&self) -> i64 {
    self.revision
  }

  fn check_top(&self, db: &Database) {
    assert_eq!(
      db.revision(),
      self.revision,
      "undo sessions must resolve in LIFO order"
    );
  }

  pub fn squash(mut self) {
    let mut db = self.db.write().expect("db lock poisoned");
    self.check_top(&db);
    db.squash().expect("session layer exists");
    self.armed = false;
  }

  pub fn undo(mut self) {
    let mut db = self.db.write().expect("db lock poisoned");
    self.check_top(&db);
    db.undo().expect("session layer exists");
    self.armed = false;
  }

  /// Detaches the session, leaving its undo layer on the stack. The
  /// layer then belongs to the database (one layer per reversible
  /// block) until `commit` or `undo` reaches it.
  pub fn push(mut self) {
    self.armed = false;
  }

  pub fn with<R>(&mut self, f: impl FnOnce(&mut Database) -> R) -> R {
    let mut db = self.db.write().expect("db lock poisoned");
    f(&mut db)
  }
}

impl Drop for UndoSession {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    match self.db.write() {
      Ok(mut db) => {
        if db.revision() == self.revision {
          let _ = db.undo();
        } else {
          // a nested session outlived its parent; this is a logic
          // error but drop must not panic
          warn!(
            "undo session dropped out of order (revision {} vs {})",
            self.revision,
            db.revision()
          );
        }
      }
      Err(_) => warn!("undo session dropped with a poisoned database lock"),
    }
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::primitives::{BlockTimestamp, Digest, Keypair},
  };

  fn test_account(name: &str) -> AccountObject {
    AccountObject {
      name: name.parse().unwrap(),
      key: Keypair::from_seed([1u8; 32]).public(),
      code_hash: Digest::default(),
      privileged: false,
      created: BlockTimestamp(0),
      recv_sequence: 0,
    }
  }

  #[test]
  fn undo_restores_prior_state() {
    let db = shared(Database::new());
    {
      let mut session = UndoSession::new(&db);
      session
        .with(|db| db.create_account(test_account("alice")))
        .unwrap();
      // dropped without squash or push
    }
    let db = db.read().unwrap();
    assert!(db.account(&"alice".parse().unwrap()).is_none());
    assert_eq!(db.revision(), 0);
  }

  #[test]
  fn squash_merges_into_parent() {
    let db = shared(Database::new());
    let outer = UndoSession::new(&db);
    {
      let mut inner = UndoSession::new(&db);
      inner
        .with(|db| db.create_account(test_account("alice")))
        .unwrap();
      inner.squash();
    }
    // inner changes survive the squash
    assert!(db
      .read()
      .unwrap()
      .account(&"alice".parse().unwrap())
      .is_some());

    // undoing the outer session now drops them
    outer.undo();
    assert!(db
      .read()
      .unwrap()
      .account(&"alice".parse().unwrap())
      .is_none());
  }

  #[test]
  fn push_and_commit_make_changes_permanent() {
    let db = shared(Database::new());
    let mut session = UndoSession::new(&db);
    session
      .with(|db| db.create_account(test_account("alice")))
      .unwrap();
    let revision = session.revision();
    session.push();

    let mut guard = db.write().unwrap();
    assert_eq!(guard.session_count(), 1);
    guard.commit(revision);
    assert_eq!(guard.session_count(), 0);
    assert!(guard.undo().is_err());
    assert!(guard.account(&"alice".parse().unwrap()).is_some());
  }

  #[test]
  fn modify_records_old_value_once() {
    let db = shared(Database::new());
    db.write()
      .unwrap()
      .create_account(test_account("alice"))
      .unwrap();

    let mut session = UndoSession::new(&db);
    session.with(|db| {
      let name = "alice".parse().unwrap();
      db.modify_account(&name, |a| a.privileged = true).unwrap();
      db.modify_account(&name, |a| a.privileged = false).unwrap();
      assert!(!db.account(&name).unwrap().privileged);
    });
    drop(session);

    // first recorded old value wins on undo
    assert!(
      !db
        .read()
        .unwrap()
        .account(&"alice".parse().unwrap())
        .unwrap()
        .privileged
    );
  }

  #[test]
  fn dedup_index_tracks_expiration() {
    let mut db = Database::new();
    let id = Digest::of(b"trx");
    assert!(db.dedup_insert(TimePointSec(100), id).unwrap());
    assert!(!db.dedup_insert(TimePointSec(200), id).unwrap());
    assert!(db.dedup_contains(&id));

    assert!(db.dedup_expire(TimePointSec(99)).is_empty());
    assert_eq!(db.dedup_expire(TimePointSec(100)), vec![id]);
    assert!(!db.dedup_contains(&id));
  }

  #[test]
  fn revision_tracks_sessions() {
    let db = shared(Database::new());
    db.write().unwrap().set_revision(41).unwrap();

    let session = UndoSession::new(&db);
    assert_eq!(session.revision(), 42);
    assert!(matches!(
      db.write().unwrap().set_revision(7),
      Err(DbError::SessionsOpen(1))
    ));
    session.push();
    assert_eq!(db.read().unwrap().revision(), 42);
  }

  #[test]
  fn guard_trips_on_object_ceiling() {
    let mut db = Database::new();
    db.set_guard(1);
    db.create_account(test_account("alice")).unwrap();
    assert!(matches!(
      db.create_account(test_account("bob")),
      Err(DbError::Guard(1))
    ));
  }
}
