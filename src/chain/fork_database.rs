//! The fork database: every reversible block state this node knows,
//! indexed by id, by parent and by number.
//!
//! Blocks reference their parent by id only; the database owns every
//! node and resolves links by lookup, which keeps pruning a plain map
//! erase and keeps the structure serializable. The preference order
//! for head selection is, most significant first: irreversibility
//! watermark, validated bit, earlier timestamp, smaller id.

use {
  super::{block_state::BlockState, error::ChainError},
  crate::primitives::{BlockId, BlockTimestamp},
  std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    sync::Arc,
  },
  tracing::debug,
};

type Result<T> = std::result::Result<T, ChainError>;

pub struct ForkDatabase {
  root: Arc<BlockState>,
  head_id: BlockId,
  index: HashMap<BlockId, Arc<BlockState>>,
  by_prev: HashMap<BlockId, Vec<BlockId>>,
  by_num: BTreeMap<u32, Vec<BlockId>>,
}

/// Sort key realizing the head preference order; bigger wins.
fn preference(state: &BlockState) -> (u32, bool, Reverse<BlockTimestamp>, Reverse<BlockId>) {
  (
    state.preference_irreversible_num(),
    state.is_valid(),
    Reverse(state.timestamp()),
    Reverse(state.id),
  )
}

impl ForkDatabase {
  pub fn new(root: Arc<BlockState>) -> Self {
    let head_id = root.id;
    Self {
      root,
      head_id,
      index: HashMap::new(),
      by_prev: HashMap::new(),
      by_num: BTreeMap::new(),
    }
  }

  pub fn root(&self) -> &Arc<BlockState> {
    &self.root
  }

  /// The most preferred tip (the pending head in irreversible read
  /// mode, the head otherwise).
  pub fn head(&self) -> Arc<BlockState> {
    self
      .get(&self.head_id)
      .unwrap_or_else(|| Arc::clone(&self.root))
  }

  pub fn get(&self, id: &BlockId) -> Option<Arc<BlockState>> {
    if self.root.id == *id {
      return Some(Arc::clone(&self.root));
    }
    self.index.get(id).cloned()
  }

  pub fn get_by_previous(&self, prev: &BlockId) -> Vec<Arc<BlockState>> {
    self
      .by_prev
      .get(prev)
      .map(|children| {
        children.iter().filter_map(|id| self.index.get(id).cloned()).collect()
      })
      .unwrap_or_default()
  }

  pub fn contains(&self, id: &BlockId) -> bool {
    self.root.id == *id || self.index.contains_key(id)
  }

  /// Inserts a new block state. The parent must already be present;
  /// nothing at or below the root may be added.
  pub fn add(
    &mut self,
    state: Arc<BlockState>,
    mark_valid: bool,
  ) -> Result<Arc<BlockState>> {
    if self.contains(&state.id) {
      return Err(ChainError::DuplicateBlock(state.id));
    }
    if state.block_num() <= self.root.block_num() {
      return Err(ChainError::UnlinkableBlock(state.id));
    }
    if !self.contains(&state.previous()) {
      return Err(ChainError::UnlinkableBlock(state.id));
    }

    if mark_valid {
      state.set_valid();
    }
    self.index.insert(state.id, Arc::clone(&state));
    self.by_prev.entry(state.previous()).or_default().push(state.id);
    self.by_num.entry(state.block_num()).or_default().push(state.id);
    self.refresh_head();
    Ok(state)
  }

  /// Flips the validated bit, which can promote the block in the
  /// head preference order.
  pub fn mark_valid(&mut self, id: &BlockId) {
    if let Some(state) = self.index.get(id) {
      state.set_valid();
      self.refresh_head();
    }
  }

  fn refresh_head(&mut self) {
    let best = self
      .index
      .values()
      .max_by_key(|state| preference(state))
      .map(|state| state.id)
      .unwrap_or(self.root.id);
    self.head_id = best;
  }

  /// The ancestor of `from` (inclusive) at height `num`, following
  /// parent links on that branch only.
  pub fn search_on_branch(
    &self,
    from: &BlockId,
    num: u32,
  ) -> Option<Arc<BlockState>> {
    let mut current = self.get(from)?;
    loop {
      if current.block_num() == num {
        return Some(current);
      }
      if current.block_num() < num {
        return None;
      }
      current = self.get(&current.previous())?;
    }
  }

  /// Ancestors of `from` (inclusive), youngest first, down to but
  /// excluding the root. With `to_num`, entries above it are skipped.
  pub fn fetch_branch(
    &self,
    from: &BlockId,
    to_num: Option<u32>,
  ) -> Vec<Arc<BlockState>> {
    let mut branch = Vec::new();
    let mut current = self.get(from);
    while let Some(state) = current {
      if state.id == self.root.id {
        break;
      }
      if to_num.map_or(true, |num| state.block_num() <= num) {
        branch.push(Arc::clone(&state));
      }
      current = self.get(&state.previous());
    }
    branch
  }

  /// The two branches from the common ancestor of `a` and `b` up to
  /// each of them, youngest first, ancestor excluded.
  pub fn fetch_branch_from(
    &self,
    a: &BlockId,
    b: &BlockId,
  ) -> Result<(Vec<Arc<BlockState>>, Vec<Arc<BlockState>>)> {
    let mut first = self
      .get(a)
      .ok_or_else(|| ChainError::ForkDatabase(format!("unknown block {a}")))?;
    let mut second = self
      .get(b)
      .ok_or_else(|| ChainError::ForkDatabase(format!("unknown block {b}")))?;
    let mut branch_a = Vec::new();
    let mut branch_b = Vec::new();

    let mut step = |state: &Arc<BlockState>,
                    branch: &mut Vec<Arc<BlockState>>|
     -> Result<Arc<BlockState>> {
      branch.push(Arc::clone(state));
      self.get(&state.previous()).ok_or_else(|| {
        ChainError::ForkDatabase(format!(
          "branch of {} does not reach the root",
          state.id
        ))
      })
    };

    while first.block_num() > second.block_num() {
      first = step(&first, &mut branch_a)?;
    }
    while second.block_num() > first.block_num() {
      second = step(&second, &mut branch_b)?;
    }
    while first.id != second.id {
      first = step(&first, &mut branch_a)?;
      second = step(&second, &mut branch_b)?;
    }
    Ok((branch_a, branch_b))
  }

  /// Makes `new_root_id` the root, pruning every block that is
  /// neither the new root nor one of its descendants. The old root
  /// is deleted.
  pub fn advance_root(&mut self, new_root_id: &BlockId) -> Result<()> {
    if *new_root_id == self.root.id {
      return Ok(());
    }
    let new_root = self.index.get(new_root_id).cloned().ok_or_else(|| {
      ChainError::ForkDatabase(format!("unknown new root {new_root_id}"))
    })?;

    // the new root must sit on the branch that reaches the old root
    let mut cursor = Arc::clone(&new_root);
    while cursor.id != self.root.id {
      cursor = self.get(&cursor.previous()).ok_or_else(|| {
        ChainError::ForkDatabase(format!(
          "new root {new_root_id} is not a descendant of the root"
        ))
      })?;
    }

    // keep only the new root's descendants
    let mut keep = vec![*new_root_id];
    let mut frontier = vec![*new_root_id];
    while let Some(id) = frontier.pop() {
      if let Some(children) = self.by_prev.get(&id) {
        keep.extend(children.iter().copied());
        frontier.extend(children.iter().copied());
      }
    }

    let keep: HashMap<BlockId, ()> = keep.into_iter().map(|id| (id, ())).collect();
    let pruned = self.index.len() + 1 - keep.len();
    self.index.retain(|id, _| keep.contains_key(id));
    self.index.remove(new_root_id);
    self.by_prev = HashMap::new();
    self.by_num = BTreeMap::new();
    for state in self.index.values() {
      self.by_prev.entry(state.previous()).or_default().push(state.id);
      self.by_num.entry(state.block_num()).or_default().push(state.id);
    }

    debug!(
      "advanced fork-db root to {} pruning {pruned} blocks",
      new_root_id
    );
    self.root = new_root;
    self.refresh_head();
    Ok(())
  }

  /// Removes a block and every descendant, e.g. after it failed to
  /// apply or was rejected by consensus rules.
  pub fn remove_with_descendants(&mut self, id: &BlockId) -> Result<()> {
    if *id == self.root.id {
      return Err(ChainError::ForkDatabase(
        "cannot remove the fork database root".into(),
      ));
    }
    let mut doomed = vec![*id];
    let mut frontier = vec![*id];
    while let Some(current) = frontier.pop() {
      if let Some(children) = self.by_prev.get(&current) {
        doomed.extend(children.iter().copied());
        frontier.extend(children.iter().copied());
      }
    }
    for id in &doomed {
      if let Some(state) = self.index.remove(id) {
        if let Some(children) = self.by_prev.get_mut(&state.previous()) {
          children.retain(|c| c != id);
        }
        if let Some(nums) = self.by_num.get_mut(&state.block_num()) {
          nums.retain(|c| c != id);
        }
      }
    }
    self.refresh_head();
    Ok(())
  }

  /// Blocks at a given height across all branches.
  pub fn blocks_at_num(&self, num: u32) -> Vec<Arc<BlockState>> {
    self
      .by_num
      .get(&num)
      .map(|ids| ids.iter().filter_map(|id| self.index.get(id).cloned()).collect())
      .unwrap_or_default()
  }

  pub fn size(&self) -> usize {
    self.index.len()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      chain::block_state::{
        tests::{make_block, single_producer_schedule},
        Trust,
      },
      primitives::{Digest, Keypair},
    },
  };

  struct Fixture {
    key: Keypair,
    fork_db: ForkDatabase,
  }

  impl Fixture {
    fn new() -> Self {
      let key = Keypair::from_seed([1u8; 32]);
      let genesis = BlockState::genesis(
        Digest::of(b"forkdb test"),
        BlockTimestamp(0),
        single_producer_schedule("prod.a", &key),
      );
      Self { key, fork_db: ForkDatabase::new(Arc::new(genesis)) }
    }

    fn extend(&mut self, parent: &Arc<BlockState>) -> Arc<BlockState> {
      let block = make_block(parent, "prod.a", &self.key);
      let state =
        BlockState::next(parent, block, vec![], Trust::Full).unwrap();
      self.fork_db.add(Arc::new(state), false).unwrap()
    }

    /// A sibling of `parent`'s child with a bumped timestamp so ids
    /// and preference differ.
    fn extend_at(
      &mut self,
      parent: &Arc<BlockState>,
      extra_slots: u32,
    ) -> Arc<BlockState> {
      let mut block = make_block(parent, "prod.a", &self.key);
      block.header.timestamp.0 += extra_slots;
      block.producer_signature =
        self.key.sign(block.header.digest().as_ref());
      let state =
        BlockState::next(parent, block, vec![], Trust::Full).unwrap();
      self.fork_db.add(Arc::new(state), false).unwrap()
    }
  }

  #[test]
  fn add_rejects_duplicates_and_orphans() {
    let mut fx = Fixture::new();
    let root = Arc::clone(fx.fork_db.root());
    let b1 = fx.extend(&root);

    assert!(matches!(
      fx.fork_db.add(Arc::clone(&b1), false),
      Err(ChainError::DuplicateBlock(_))
    ));

    // a block whose parent was never inserted is unlinkable
    let c1 = Arc::new(
      BlockState::next(
        &b1,
        make_block(&b1, "prod.a", &fx.key),
        vec![],
        Trust::Full,
      )
      .unwrap(),
    );
    let c2 =
      BlockState::next(&c1, make_block(&c1, "prod.a", &fx.key), vec![], Trust::Full)
        .unwrap();
    assert!(matches!(
      fx.fork_db.add(Arc::new(c2), false),
      Err(ChainError::UnlinkableBlock(_))
    ));
  }

  #[test]
  fn head_tracks_longest_preferred_branch() {
    let mut fx = Fixture::new();
    let root = Arc::clone(fx.fork_db.root());
    let b1 = fx.extend(&root);
    let b2 = fx.extend(&b1);
    assert_eq!(fx.fork_db.head().id, b2.id);

    let b3 = fx.extend(&b2);
    assert_eq!(fx.fork_db.head().id, b3.id);
  }

  #[test]
  fn earlier_timestamp_wins_at_equal_height() {
    let mut fx = Fixture::new();
    let root = Arc::clone(fx.fork_db.root());
    let b1 = fx.extend(&root);

    // two competing children of b1; the later-slot one first
    let late = fx.extend_at(&b1, 5);
    assert_eq!(fx.fork_db.head().id, late.id);
    let early = fx.extend(&b1);
    assert_eq!(fx.fork_db.head().id, early.id);
  }

  #[test]
  fn branch_fetching_finds_common_ancestor() {
    let mut fx = Fixture::new();
    let root = Arc::clone(fx.fork_db.root());
    let b1 = fx.extend(&root);
    let a2 = fx.extend(&b1);
    let a3 = fx.extend(&a2);
    let b2 = fx.extend_at(&b1, 7);
    let b3 = fx.extend(&b2);
    let b4 = fx.extend(&b3);

    let (to_a, to_b) = fx.fork_db.fetch_branch_from(&a3.id, &b4.id).unwrap();
    assert_eq!(
      to_a.iter().map(|s| s.id).collect::<Vec<_>>(),
      vec![a3.id, a2.id]
    );
    assert_eq!(
      to_b.iter().map(|s| s.id).collect::<Vec<_>>(),
      vec![b4.id, b3.id, b2.id]
    );

    let branch = fx.fork_db.fetch_branch(&a3.id, None);
    assert_eq!(
      branch.iter().map(|s| s.id).collect::<Vec<_>>(),
      vec![a3.id, a2.id, b1.id]
    );

    assert_eq!(
      fx.fork_db.search_on_branch(&b4.id, 2).unwrap().id,
      b2.id
    );
    assert!(fx.fork_db.search_on_branch(&a3.id, 9).is_none());
  }

  #[test]
  fn advance_root_prunes_other_branches() {
    let mut fx = Fixture::new();
    let root = Arc::clone(fx.fork_db.root());
    let b1 = fx.extend(&root);
    let a2 = fx.extend(&b1);
    let a3 = fx.extend(&a2);
    let b2 = fx.extend_at(&b1, 7);

    fx.fork_db.advance_root(&a2.id).unwrap();
    assert_eq!(fx.fork_db.root().id, a2.id);
    assert!(fx.fork_db.get(&a3.id).is_some());
    // the abandoned sibling and the old root are gone
    assert!(fx.fork_db.get(&b2.id).is_none());
    assert!(fx.fork_db.get(&b1.id).is_none());
    assert_eq!(fx.fork_db.head().id, a3.id);

    // a root from a pruned branch is refused
    assert!(fx.fork_db.advance_root(&b2.id).is_err());
  }

  #[test]
  fn remove_with_descendants_restores_previous_head() {
    let mut fx = Fixture::new();
    let root = Arc::clone(fx.fork_db.root());
    let b1 = fx.extend(&root);
    let b2 = fx.extend(&b1);
    let b3 = fx.extend(&b2);
    assert_eq!(fx.fork_db.head().id, b3.id);

    fx.fork_db.remove_with_descendants(&b2.id).unwrap();
    assert!(fx.fork_db.get(&b2.id).is_none());
    assert!(fx.fork_db.get(&b3.id).is_none());
    assert_eq!(fx.fork_db.head().id, b1.id);

    let root_id = fx.fork_db.root().id;
    assert!(fx.fork_db.remove_with_descendants(&root_id).is_err());
  }

  #[test]
  fn every_block_links_back_to_root() {
    let mut fx = Fixture::new();
    let root = Arc::clone(fx.fork_db.root());
    let b1 = fx.extend(&root);
    let _ = fx.extend(&b1);
    let _ = fx.extend_at(&b1, 3);

    // walking previous links from any block reaches the root
    for num in 1..=2 {
      for state in fx.fork_db.blocks_at_num(num) {
        let branch = fx.fork_db.fetch_branch(&state.id, None);
        assert_eq!(
          branch.last().unwrap().previous(),
          fx.fork_db.root().id
        );
      }
    }
  }
}
