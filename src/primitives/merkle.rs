//! The two merkle constructions used by consensus.
//!
//! Pre-finality blocks commit to receipt digests with the canonical
//! balanced tree ([`canonical_merkle`]); once the instant-finality
//! upgrade activates, headers switch to an append-only mountain range
//! ([`MountainRange`]). Which one a header uses is decided by the
//! block's own protocol state, never by node configuration.

use {
  super::id::Digest,
  itertools::Itertools,
  serde::{Deserialize, Serialize},
};

/// Root of the canonical balanced merkle tree over an ordered list of
/// digests. Odd layers are padded by duplicating their last element.
/// An empty list hashes to the zero digest.
pub fn canonical_merkle(leaves: &[Digest]) -> Digest {
  if leaves.is_empty() {
    return Digest::default();
  }

  let mut layer = leaves.to_vec();
  while layer.len() > 1 {
    if layer.len() % 2 == 1 {
      layer.push(*layer.last().unwrap());
    }
    layer = layer
      .iter()
      .tuples()
      .map(|(left, right)| Digest::combine(left, right))
      .collect();
  }
  layer[0]
}

/// An incremental merkle accumulator (merkle mountain range).
///
/// Leaves are appended one at a time; the structure keeps one peak
/// per set bit of the leaf count, exactly like a binary counter with
/// carry. Unlike the canonical tree there is no padding, so two
/// ranges with different leaf counts never share a root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountainRange {
  peaks: Vec<Option<Digest>>,
  count: u64,
}

impl MountainRange {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn count(&self) -> u64 {
    self.count
  }

  pub fn append(&mut self, leaf: Digest) {
    let mut carry = leaf;
    let mut height = 0;
    loop {
      if height == self.peaks.len() {
        self.peaks.push(None);
      }
      match self.peaks[height].take() {
        None => {
          self.peaks[height] = Some(carry);
          break;
        }
        Some(left) => {
          carry = Digest::combine(&left, &carry);
          height += 1;
        }
      }
    }
    self.count += 1;
  }

  /// Bags all peaks, higher peaks absorbing lower ones, into a single
  /// root. The empty range hashes to the zero digest.
  pub fn root(&self) -> Digest {
    let mut acc: Option<Digest> = None;
    for peak in self.peaks.iter().flatten() {
      acc = Some(match acc {
        None => *peak,
        Some(lower) => Digest::combine(peak, &lower),
      });
    }
    acc.unwrap_or_default()
  }
}

impl Extend<Digest> for MountainRange {
  fn extend<I: IntoIterator<Item = Digest>>(&mut self, leaves: I) {
    for leaf in leaves {
      self.append(leaf);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn leaves(n: usize) -> Vec<Digest> {
    (0..n).map(|i| Digest::of(i.to_le_bytes())).collect()
  }

  #[test]
  fn empty_roots_are_zero() {
    assert!(canonical_merkle(&[]).is_zero());
    assert!(MountainRange::new().root().is_zero());
  }

  #[test]
  fn single_leaf_is_its_own_root() {
    let leaf = Digest::of(b"leaf");
    assert_eq!(canonical_merkle(&[leaf]), leaf);

    let mut range = MountainRange::new();
    range.append(leaf);
    assert_eq!(range.root(), leaf);
  }

  #[test]
  fn canonical_pads_by_duplication() {
    let l = leaves(3);
    let d01 = Digest::combine(&l[0], &l[1]);
    let d22 = Digest::combine(&l[2], &l[2]);
    assert_eq!(canonical_merkle(&l), Digest::combine(&d01, &d22));
  }

  #[test]
  fn canonical_is_order_sensitive() {
    let l = leaves(4);
    let mut reversed = l.clone();
    reversed.reverse();
    assert_ne!(canonical_merkle(&l), canonical_merkle(&reversed));
  }

  #[test]
  fn range_matches_manual_tree_for_pow2() {
    let l = leaves(4);
    let mut range = MountainRange::new();
    range.extend(l.iter().copied());

    let d01 = Digest::combine(&l[0], &l[1]);
    let d23 = Digest::combine(&l[2], &l[3]);
    assert_eq!(range.root(), Digest::combine(&d01, &d23));
    assert_eq!(range.count(), 4);
  }

  #[test]
  fn range_does_not_pad() {
    // 3 leaves: peaks are [leaf2, combine(l0, l1)], bagged as
    // combine(higher, lower) = combine(d01, leaf2)
    let l = leaves(3);
    let mut range = MountainRange::new();
    range.extend(l.iter().copied());

    let d01 = Digest::combine(&l[0], &l[1]);
    assert_eq!(range.root(), Digest::combine(&d01, &l[2]));
    assert_ne!(range.root(), canonical_merkle(&l));
  }

  #[test]
  fn incremental_is_append_only() {
    let mut a = MountainRange::new();
    let mut b = MountainRange::new();
    for leaf in leaves(7) {
      a.append(leaf);
      b.append(leaf);
      assert_eq!(a.root(), b.root());
    }
    a.append(Digest::of(b"extra"));
    assert_ne!(a.root(), b.root());
  }
}
