//! Quorum-certificate finality.
//!
//! Once the instant-finality upgrade activates, irreversibility stops
//! following the longest chain and instead follows BLS quorum
//! certificates: finalizers vote on block digests, a 2/3+1 weight of
//! votes forms a strong certificate, and a strong certificate on a
//! block finalizes that block's two-chain ancestor.

mod core;
mod finalizer;
mod qc;

pub use {
  self::core::{CoreLink, FinalityCore, QcClaim},
  finalizer::{LocalFinalizer, SafetyRecord, VoteMessage},
  qc::{
    strong_vote_digest,
    weak_vote_digest,
    FinalityExtension,
    FinalizerAuthority,
    FinalizerPolicy,
    PendingQc,
    QcState,
    QuorumCertificate,
  },
};
