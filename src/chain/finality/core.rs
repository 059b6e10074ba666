//! Per-block finality bookkeeping.
//!
//! Every block under the finality protocol carries a [`QcClaim`]
//! asserting that a quorum certificate exists for some ancestor. The
//! [`FinalityCore`] derived for each block tracks, for every ancestor
//! that is not yet final, what that ancestor claimed — enough to
//! answer the two-chain question: which block becomes final when a
//! strong certificate forms on this one.

use {
  crate::{
    chain::ChainError,
    primitives::wire::{WireDecode, WireEncode, WireError},
  },
  serde::{Deserialize, Serialize},
};

/// Assertion carried by a block header: a quorum certificate of the
/// given strength exists for ancestor `block_num`.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct QcClaim {
  pub block_num: u32,
  pub is_strong: bool,
}

impl WireEncode for QcClaim {
  fn encode(&self, out: &mut Vec<u8>) {
    self.block_num.encode(out);
    self.is_strong.encode(out);
  }
}

impl WireDecode for QcClaim {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    Ok(Self {
      block_num: u32::decode(input)?,
      is_strong: bool::decode(input)?,
    })
  }
}

/// One non-final ancestor's claim, kept so a later strong certificate
/// can be resolved through it.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct CoreLink {
  pub block_num: u32,
  pub claim_num: u32,
  pub is_strong_claim: bool,
  pub final_on_strong_qc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityCore {
  /// Links for every block in `(last_final_block_num, current]`,
  /// oldest first. Never empty: the current block always has one.
  pub links: Vec<CoreLink>,
  pub last_final_block_num: u32,
  /// The block that becomes final if a strong certificate forms on
  /// the current block (its two-chain ancestor).
  pub final_on_strong_qc_block_num: u32,
}

impl FinalityCore {
  /// Core of the block that activates the finality transition: it is
  /// its own claim target and already final.
  pub fn genesis(block_num: u32) -> Self {
    Self {
      links: vec![CoreLink {
        block_num,
        claim_num: block_num,
        is_strong_claim: false,
        final_on_strong_qc: block_num,
      }],
      last_final_block_num: block_num,
      final_on_strong_qc_block_num: block_num,
    }
  }

  pub fn current_block_num(&self) -> u32 {
    self.links.last().expect("links are never empty").block_num
  }

  pub fn latest_qc_claim(&self) -> QcClaim {
    let link = self.links.last().expect("links are never empty");
    QcClaim { block_num: link.claim_num, is_strong: link.is_strong_claim }
  }

  fn link(&self, block_num: u32) -> Option<&CoreLink> {
    self.links.iter().find(|l| l.block_num == block_num)
  }

  /// Validates the claim of a child block against this (the parent)
  /// core: claims may not regress, may only strengthen in place, and
  /// a certificate extension accompanies a claim exactly when the
  /// claim changed.
  pub fn validate_claim(
    &self,
    claim: &QcClaim,
    has_qc_extension: bool,
  ) -> Result<(), ChainError> {
    let parent_claim = self.latest_qc_claim();
    if claim.block_num > self.current_block_num() {
      return Err(ChainError::InvalidQcClaim(format!(
        "claim on future block {} (parent is {})",
        claim.block_num,
        self.current_block_num()
      )));
    }
    if claim.block_num < parent_claim.block_num {
      return Err(ChainError::InvalidQcClaim(format!(
        "claim regressed from {} to {}",
        parent_claim.block_num, claim.block_num
      )));
    }

    let changed = if claim.block_num == parent_claim.block_num {
      match (parent_claim.is_strong, claim.is_strong) {
        (true, false) => {
          return Err(ChainError::InvalidQcClaim(
            "claim weakened without advancing".into(),
          ))
        }
        (s, c) => s != c,
      }
    } else {
      true
    };

    if changed && !has_qc_extension {
      return Err(ChainError::InvalidQcClaim(
        "claim changed but no certificate attached".into(),
      ));
    }
    if !changed && has_qc_extension {
      return Err(ChainError::InvalidQcClaim(
        "certificate attached but claim unchanged".into(),
      ));
    }
    Ok(())
  }

  /// Derives the core of the next block given its (validated) claim.
  ///
  /// A strong claim on ancestor N does two things: it makes N the
  /// block that a future strong certificate on this block will
  /// finalize (the two-chain rule), and it finalizes whatever N
  /// itself promised to finalize on a strong certificate.
  pub fn next(&self, block_num: u32, claim: QcClaim) -> FinalityCore {
    debug_assert_eq!(block_num, self.current_block_num() + 1);

    let (final_on_strong, last_final) = if claim.is_strong {
      let finalized_by_claim = self
        .link(claim.block_num)
        .map(|link| link.final_on_strong_qc)
        .unwrap_or(self.last_final_block_num);
      (
        claim.block_num.max(self.final_on_strong_qc_block_num),
        finalized_by_claim.max(self.last_final_block_num),
      )
    } else {
      (self.final_on_strong_qc_block_num, self.last_final_block_num)
    };

    let mut links: Vec<CoreLink> = self
      .links
      .iter()
      .filter(|l| l.block_num > last_final)
      .copied()
      .collect();
    links.push(CoreLink {
      block_num,
      claim_num: claim.block_num,
      is_strong_claim: claim.is_strong,
      final_on_strong_qc: final_on_strong,
    });

    FinalityCore {
      links,
      last_final_block_num: last_final,
      final_on_strong_qc_block_num: final_on_strong,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn strong(block_num: u32) -> QcClaim {
    QcClaim { block_num, is_strong: true }
  }

  fn weak(block_num: u32) -> QcClaim {
    QcClaim { block_num, is_strong: false }
  }

  /// Builds a straight chain where every block claims a strong
  /// certificate on its parent, starting from a transition at 10.
  fn straight_chain(until: u32) -> FinalityCore {
    let mut core = FinalityCore::genesis(10);
    for num in 11..=until {
      core = core.next(num, strong(num - 1));
    }
    core
  }

  #[test]
  fn transition_block_shape_is_accepted() {
    // the mandated first post-activation shape: claim on self, weak,
    // no certificate
    let core = FinalityCore::genesis(10);
    core.validate_claim(&weak(10), false).unwrap();
  }

  #[test]
  fn two_chain_finality_advances() {
    let core = straight_chain(14);
    assert_eq!(core.current_block_num(), 14);
    // strong qc claimed on 13, so a strong qc on 14 finalizes 13
    assert_eq!(core.final_on_strong_qc_block_num, 13);
    // the strong claim on 13 finalized 13's two-chain ancestor 12
    assert_eq!(core.last_final_block_num, 12);
  }

  #[test]
  fn claims_may_not_regress() {
    let core = straight_chain(14);
    assert!(core.validate_claim(&strong(12), true).is_err());
    core.validate_claim(&strong(14), true).unwrap();
  }

  #[test]
  fn claim_on_future_block_rejected() {
    let core = straight_chain(14);
    assert!(core.validate_claim(&strong(15), true).is_err());
  }

  #[test]
  fn strengthening_requires_certificate() {
    let mut core = FinalityCore::genesis(10);
    core = core.next(11, weak(10));
    // same target, weak -> strong is a change and needs a qc
    assert!(core.validate_claim(&strong(10), false).is_err());
    core.validate_claim(&strong(10), true).unwrap();
    // same target, strong -> weak is forbidden outright
    core = core.next(12, strong(10));
    assert!(core.validate_claim(&weak(10), false).is_err());
    assert!(core.validate_claim(&weak(10), true).is_err());
  }

  #[test]
  fn unchanged_claim_forbids_certificate() {
    let core = straight_chain(12);
    let repeat = core.latest_qc_claim();
    core.validate_claim(&repeat, false).unwrap();
    assert!(core.validate_claim(&repeat, true).is_err());
  }

  #[test]
  fn weak_claims_do_not_advance_finality() {
    let mut core = straight_chain(14);
    let before = (core.last_final_block_num, core.final_on_strong_qc_block_num);
    core = core.next(15, weak(14));
    assert_eq!(
      (core.last_final_block_num, core.final_on_strong_qc_block_num),
      before
    );
  }

  #[test]
  fn links_are_pruned_below_last_final() {
    let core = straight_chain(20);
    assert!(core.links.iter().all(|l| l.block_num > core.last_final_block_num));
    assert_eq!(core.current_block_num(), 20);
  }
}
