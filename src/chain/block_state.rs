//! The reversible block state: a block plus every fact derived from
//! its position in the chain.
//!
//! Two consensus flavors coexist while the network crosses the
//! instant-finality upgrade. The legacy flavor tracks per-producer
//! watermarks and derives irreversibility from the longest chain; the
//! finality flavor carries a [`FinalityCore`] and derives it from
//! quorum certificates. The flavors are a tagged union dispatched by
//! match (or the [`ConsensusFlavor::apply`] combinator), never a
//! hierarchy.

use {
  super::{
    block::{
      BlockHeader,
      ProducerSchedule,
      SignedBlock,
    },
    error::ChainError,
    finality::{
      FinalityCore,
      FinalityExtension,
      FinalizerPolicy,
      PendingQc,
      QcClaim,
      QuorumCertificate,
    },
    transaction::TransactionMetadata,
  },
  crate::primitives::{AccountName, BlockId, BlockTimestamp, Digest},
  serde::{Deserialize, Serialize},
  std::{
    collections::BTreeMap,
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc,
      Mutex,
    },
  },
};

/// How much to trust an incoming block while deriving its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
  /// We produced it ourselves; skip signature and schedule checks.
  Produced,
  /// Full validation of header, schedule and signature.
  Full,
  /// Light validation: from a trusted producer, signature skipped.
  Light,
}

/// A proposed schedule waiting for its proposal block to become
/// irreversible before taking over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSchedule {
  /// The block whose irreversibility promotes the schedule.
  pub schedule_lib_num: u32,
  pub schedule: ProducerSchedule,
}

/// Longest-chain bookkeeping (pre-finality).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyState {
  pub producer_to_last_produced: BTreeMap<AccountName, u32>,
  pub producer_to_last_implied_irb: BTreeMap<AccountName, u32>,
  pub dpos_proposed_irreversible_blocknum: u32,
  pub dpos_irreversible_blocknum: u32,
}

/// Quorum-certificate bookkeeping (post-finality).
#[derive(Debug, Clone)]
pub struct FinalityState {
  pub active_finalizer_policy: Arc<FinalizerPolicy>,
  pub core: FinalityCore,
}

#[derive(Debug, Clone)]
pub enum ConsensusFlavor {
  Legacy(LegacyState),
  Finality(FinalityState),
}

impl ConsensusFlavor {
  /// Single dispatch point over the two flavors, keeping call sites
  /// compact.
  pub fn apply<R>(
    &self,
    legacy: impl FnOnce(&LegacyState) -> R,
    finality: impl FnOnce(&FinalityState) -> R,
  ) -> R {
    match self {
      ConsensusFlavor::Legacy(state) => legacy(state),
      ConsensusFlavor::Finality(state) => finality(state),
    }
  }
}

/// The `(n-1)/3`-th smallest watermark: the highest block number that
/// more than two thirds of producers have reached.
fn calc_irreversible(watermarks: &BTreeMap<AccountName, u32>) -> u32 {
  if watermarks.is_empty() {
    return 0;
  }
  let mut values: Vec<u32> = watermarks.values().copied().collect();
  values.sort_unstable();
  values[(values.len() - 1) / 3]
}

pub struct BlockState {
  pub id: BlockId,
  pub block: Arc<SignedBlock>,
  pub active_schedule: ProducerSchedule,
  pub pending_schedule: Option<PendingSchedule>,
  /// Digests of every protocol feature active as of this block.
  pub activated_features: Vec<Digest>,
  pub flavor: ConsensusFlavor,
  /// Flipped by the fork database once the block has been applied
  /// locally; affects head preference.
  pub valid: AtomicBool,
  /// Vote accumulator, alive while the certificate is still forming.
  pub pending_qc: Mutex<Option<PendingQc>>,
  /// Proven certificate for this block, from votes or from a child
  /// block's extension. A strong certificate replaces a weak one but
  /// never the other way around.
  pub(crate) valid_qc: Mutex<Option<QuorumCertificate>>,
  /// Metadata of the transactions applied in this block, kept so a
  /// fork switch can replay without re-verifying signatures.
  pub cached_trx_metas: Mutex<Vec<Arc<TransactionMetadata>>>,
}

impl std::fmt::Debug for BlockState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BlockState")
      .field("id", &self.id)
      .field("num", &self.block_num())
      .field("producer", &self.header().producer)
      .field("valid", &self.is_valid())
      .finish()
  }
}

impl BlockState {
  /// The synthetic root state of an empty chain. Its id embeds the
  /// chain id, so two chains can never exchange blocks.
  pub fn genesis(
    chain_id: Digest,
    timestamp: BlockTimestamp,
    schedule: ProducerSchedule,
  ) -> Self {
    let header = BlockHeader {
      timestamp,
      producer: AccountName::default(),
      confirmed: 1,
      previous: BlockId::default(),
      transaction_mroot: Digest::default(),
      action_mroot: chain_id,
      schedule_version: schedule.version,
      new_producers: None,
      header_extensions: vec![],
    };
    let block = SignedBlock {
      header,
      producer_signature: ed25519_dalek::Signature::from_bytes(&[0u8; 64])
        .expect("zero bytes form a structurally valid signature"),
      transactions: vec![],
      block_extensions: vec![],
    };
    let state = Self {
      id: BlockId::new(0, chain_id),
      block: Arc::new(block),
      active_schedule: schedule,
      pending_schedule: None,
      activated_features: vec![],
      flavor: ConsensusFlavor::Legacy(LegacyState::default()),
      valid: AtomicBool::new(true),
      pending_qc: Mutex::new(None),
      valid_qc: Mutex::new(None),
      cached_trx_metas: Mutex::new(Vec::new()),
    };
    state
  }

  pub fn header(&self) -> &BlockHeader {
    &self.block.header
  }

  pub fn block_num(&self) -> u32 {
    self.id.num()
  }

  pub fn timestamp(&self) -> BlockTimestamp {
    self.block.header.timestamp
  }

  pub fn previous(&self) -> BlockId {
    self.block.header.previous
  }

  pub fn is_valid(&self) -> bool {
    self.valid.load(Ordering::Acquire)
  }

  pub(crate) fn set_valid(&self) {
    self.valid.store(true, Ordering::Release);
  }

  /// The irreversibility watermark used for head preference: dpos
  /// irreversible under legacy, final-on-strong under finality.
  pub fn preference_irreversible_num(&self) -> u32 {
    self.flavor.apply(
      |legacy| legacy.dpos_irreversible_blocknum,
      |finality| finality.core.final_on_strong_qc_block_num,
    )
  }

  /// The block number this state proves irreversible.
  pub fn claimed_irreversible_num(&self) -> u32 {
    self.flavor.apply(
      |legacy| legacy.dpos_irreversible_blocknum,
      |finality| finality.core.last_final_block_num,
    )
  }

  pub fn finality_state(&self) -> Option<&FinalityState> {
    match &self.flavor {
      ConsensusFlavor::Finality(state) => Some(state),
      ConsensusFlavor::Legacy(_) => None,
    }
  }

  /// The certificate proven for this block so far, if any.
  pub fn valid_qc(&self) -> Option<QuorumCertificate> {
    self.valid_qc.lock().expect("qc lock poisoned").clone()
  }

  /// Installs a proven certificate; a strong one may replace a weak
  /// one, anything else keeps the existing certificate.
  pub fn set_valid_qc(&self, qc: QuorumCertificate, strong: bool) {
    let mut slot = self.valid_qc.lock().expect("qc lock poisoned");
    let replace = match (&*slot, strong) {
      (None, _) => true,
      (Some(existing), true) => {
        self
          .finality_state()
          .map(|f| !existing.is_strong(&f.active_finalizer_policy))
          .unwrap_or(false)
      }
      (Some(_), false) => false,
    };
    if replace {
      *slot = Some(qc);
    }
  }

  /// The qc claim a child block should carry, and the certificate to
  /// attach when the claim differs from this block's own.
  pub fn best_qc_claim(&self) -> (QcClaim, Option<QuorumCertificate>) {
    let Some(finality) = self.finality_state() else {
      return (QcClaim { block_num: 0, is_strong: false }, None);
    };
    let inherited = finality.core.latest_qc_claim();
    match self.valid_qc() {
      Some(qc) => {
        let claim = QcClaim {
          block_num: self.block_num(),
          is_strong: qc.is_strong(&finality.active_finalizer_policy),
        };
        if claim.block_num > inherited.block_num
          || (claim.block_num == inherited.block_num
            && claim.is_strong
            && !inherited.is_strong)
        {
          (claim, Some(qc))
        } else {
          (inherited, None)
        }
      }
      None => (inherited, None),
    }
  }

  /// Derives the state of `block` on top of `prev`, validating the
  /// header against the schedule, the producer signature, and (under
  /// finality) the qc claim. This is the only way a block enters the
  /// fork database.
  pub fn next(
    prev: &BlockState,
    block: SignedBlock,
    activated_features: Vec<Digest>,
    trust: Trust,
  ) -> Result<BlockState, ChainError> {
    let header = &block.header;
    if header.previous != prev.id {
      return Err(ChainError::InvalidHeader(format!(
        "previous {} does not match {}",
        header.previous, prev.id
      )));
    }
    if header.timestamp <= prev.timestamp() {
      return Err(ChainError::InvalidHeader(
        "timestamp must advance past the parent".into(),
      ));
    }

    // promote the pending schedule first if this block's view of
    // irreversibility reaches the proposal block
    let mut active_schedule = prev.active_schedule.clone();
    let mut pending_schedule = prev.pending_schedule.clone();
    let reached = prev.claimed_irreversible_num();
    if let Some(pending) = &pending_schedule {
      if pending.schedule_lib_num <= reached {
        active_schedule = pending.schedule.clone();
        pending_schedule = None;
      }
    }

    if header.schedule_version != active_schedule.version {
      return Err(ChainError::InvalidHeader(format!(
        "schedule version {} does not match active {}",
        header.schedule_version, active_schedule.version
      )));
    }

    let authority = active_schedule
      .authority_of(&header.producer)
      .ok_or_else(|| {
        ChainError::InvalidHeader(format!(
          "producer {} is not in the active schedule",
          header.producer
        ))
      })?;
    if trust == Trust::Full {
      let scheduled = active_schedule.producer_for(header.timestamp);
      if scheduled.producer_name != header.producer {
        return Err(ChainError::InvalidHeader(format!(
          "producer {} produced in {}'s slot",
          header.producer, scheduled.producer_name
        )));
      }
      if !authority
        .signature_satisfies(&header.digest(), &block.producer_signature)
      {
        return Err(ChainError::InvalidBlockSignature);
      }
    }

    // a new pending schedule proposed by this block (legacy path)
    if let Some(new_producers) = &header.new_producers {
      if pending_schedule.is_some() {
        return Err(ChainError::InvalidHeader(
          "schedule proposed while another is pending".into(),
        ));
      }
      if new_producers.version != active_schedule.version + 1 {
        return Err(ChainError::InvalidHeader(format!(
          "proposed schedule version {} is not an increment",
          new_producers.version
        )));
      }
      pending_schedule = Some(PendingSchedule {
        schedule_lib_num: header.block_num(),
        schedule: new_producers.clone(),
      });
    }

    let finality_ext = header
      .finality_extension()
      .map(FinalityExtension::parse)
      .transpose()?;

    let flavor = match (&prev.flavor, finality_ext) {
      (ConsensusFlavor::Legacy(legacy), None) => ConsensusFlavor::Legacy(
        Self::next_legacy(legacy, header, &active_schedule),
      ),
      // the transition block: a legacy parent and a header that
      // carries the first finalizer policy
      (ConsensusFlavor::Legacy(_), Some(ext)) => {
        let policy = ext.new_finalizer_policy.ok_or_else(|| {
          ChainError::InvalidQcClaim(
            "transition block must carry a finalizer policy".into(),
          )
        })?;
        let expected =
          QcClaim { block_num: header.block_num(), is_strong: false };
        if ext.qc_claim != expected || block.qc_extension().is_some() {
          return Err(ChainError::InvalidQcClaim(
            "transition block must claim itself weakly with no \
             certificate"
              .into(),
          ));
        }
        ConsensusFlavor::Finality(FinalityState {
          active_finalizer_policy: Arc::new(policy),
          core: FinalityCore::genesis(header.block_num()),
        })
      }
      (ConsensusFlavor::Finality(finality), Some(ext)) => {
        finality
          .core
          .validate_claim(&ext.qc_claim, block.qc_extension().is_some())?;

        if let Some(extension) = block.qc_extension() {
          let qc = QuorumCertificate::parse(extension)?;
          if qc.block_num != ext.qc_claim.block_num {
            return Err(ChainError::InvalidQc(format!(
              "certificate for block {} attached to a claim on {}",
              qc.block_num, ext.qc_claim.block_num
            )));
          }
          if qc.is_strong(&finality.active_finalizer_policy)
            != ext.qc_claim.is_strong
          {
            return Err(ChainError::InvalidQc(
              "certificate strength does not match the claim".into(),
            ));
          }
        }

        let mut policy = Arc::clone(&finality.active_finalizer_policy);
        if let Some(new_policy) = ext.new_finalizer_policy {
          if new_policy.generation != policy.generation + 1 {
            return Err(ChainError::InvalidQcClaim(format!(
              "finalizer policy generation {} is not an increment",
              new_policy.generation
            )));
          }
          policy = Arc::new(new_policy);
        }
        ConsensusFlavor::Finality(FinalityState {
          active_finalizer_policy: policy,
          core: finality.core.next(header.block_num(), ext.qc_claim),
        })
      }
      (ConsensusFlavor::Finality(_), None) => {
        return Err(ChainError::InvalidQcClaim(
          "finality blocks must carry a qc claim".into(),
        ))
      }
    };

    let id = header.id();
    Ok(BlockState {
      id,
      block: Arc::new(block),
      active_schedule,
      pending_schedule,
      activated_features,
      flavor,
      valid: AtomicBool::new(trust == Trust::Produced),
      pending_qc: Mutex::new(None),
      valid_qc: Mutex::new(None),
      cached_trx_metas: Mutex::new(Vec::new()),
    })
  }

  fn next_legacy(
    prev: &LegacyState,
    header: &BlockHeader,
    schedule: &ProducerSchedule,
  ) -> LegacyState {
    let block_num = header.block_num();
    let mut state = prev.clone();

    // every scheduled producer needs a watermark: a missing entry
    // would let a minority imply irreversibility. Producers that left
    // the schedule stop counting.
    let seed = prev.dpos_irreversible_blocknum;
    for table in [
      &mut state.producer_to_last_produced,
      &mut state.producer_to_last_implied_irb,
    ] {
      table.retain(|name, _| schedule.authority_of(name).is_some());
      for producer in &schedule.producers {
        table.entry(producer.producer_name.clone()).or_insert(seed);
      }
    }

    state
      .producer_to_last_produced
      .insert(header.producer.clone(), block_num);
    state.dpos_proposed_irreversible_blocknum =
      calc_irreversible(&state.producer_to_last_produced)
        .max(prev.dpos_proposed_irreversible_blocknum);
    // producing this block endorses the proposed watermark as it
    // stood at the parent, one phase behind the proposal itself
    state.producer_to_last_implied_irb.insert(
      header.producer.clone(),
      prev.dpos_proposed_irreversible_blocknum,
    );
    state.dpos_irreversible_blocknum =
      calc_irreversible(&state.producer_to_last_implied_irb)
        .max(prev.dpos_irreversible_blocknum);
    state
  }

  pub(crate) fn cache_trx_metas(
    &self,
    metas: Vec<Arc<TransactionMetadata>>,
  ) {
    *self.cached_trx_metas.lock().expect("trx meta lock poisoned") = metas;
  }

  pub(crate) fn take_cached_trx_metas(&self) -> Vec<Arc<TransactionMetadata>> {
    std::mem::take(
      &mut *self.cached_trx_metas.lock().expect("trx meta lock poisoned"),
    )
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use {
    super::*,
    crate::{
      chain::block::{Extension, ProducerAuthority, FINALITY_EXTENSION_ID},
      primitives::{Keypair, WireEncode},
    },
  };

  pub(crate) fn single_producer_schedule(
    name: &str,
    key: &Keypair,
  ) -> ProducerSchedule {
    ProducerSchedule {
      version: 0,
      producers: vec![ProducerAuthority::single(
        name.parse().unwrap(),
        key.public(),
      )],
    }
  }

  pub(crate) fn make_block(
    prev: &BlockState,
    producer: &str,
    key: &Keypair,
  ) -> SignedBlock {
    let header = BlockHeader {
      timestamp: prev.timestamp().next(),
      producer: producer.parse().unwrap(),
      confirmed: 0,
      previous: prev.id,
      transaction_mroot: Digest::default(),
      action_mroot: Digest::default(),
      schedule_version: prev.active_schedule.version,
      new_producers: None,
      header_extensions: vec![],
    };
    let signature = key.sign(header.digest().as_ref());
    SignedBlock {
      header,
      producer_signature: signature,
      transactions: vec![],
      block_extensions: vec![],
    }
  }

  fn genesis_with(key: &Keypair) -> BlockState {
    BlockState::genesis(
      Digest::of(b"test chain"),
      BlockTimestamp(0),
      single_producer_schedule("prod.a", key),
    )
  }

  #[test]
  fn genesis_is_block_zero() {
    let key = Keypair::from_seed([1u8; 32]);
    let genesis = genesis_with(&key);
    assert_eq!(genesis.block_num(), 0);
    assert!(genesis.is_valid());
  }

  #[test]
  fn single_producer_advances_irreversibility() {
    let key = Keypair::from_seed([1u8; 32]);
    let genesis = genesis_with(&key);

    let b1 = BlockState::next(
      &genesis,
      make_block(&genesis, "prod.a", &key),
      vec![],
      Trust::Full,
    )
    .unwrap();
    assert_eq!(b1.block_num(), 1);
    // proposal and endorsement are separate phases, so even a solo
    // producer's irreversibility trails the head by one block
    assert_eq!(b1.claimed_irreversible_num(), 0);

    let b2 = BlockState::next(
      &b1,
      make_block(&b1, "prod.a", &key),
      vec![],
      Trust::Full,
    )
    .unwrap();
    assert_eq!(b2.claimed_irreversible_num(), 1);
  }

  #[test]
  fn dpos_needs_two_thirds_of_producers() {
    let keys: Vec<_> =
      (1u8..=4).map(|i| Keypair::from_seed([i; 32])).collect();
    let names = ["prod.a", "prod.b", "prod.c", "prod.d"];
    let schedule = ProducerSchedule {
      version: 0,
      producers: names
        .iter()
        .zip(&keys)
        .map(|(n, k)| ProducerAuthority::single(n.parse().unwrap(), k.public()))
        .collect(),
    };
    let genesis =
      BlockState::genesis(Digest::of(b"chain"), BlockTimestamp(0), schedule);

    // producers take turns; light trust skips slot alignment so the
    // test can rotate per block
    let mut head = Arc::new(genesis);
    for round in 0..3 {
      for (name, key) in names.iter().zip(&keys) {
        let block = make_block(&head, name, key);
        let state =
          BlockState::next(&head, block, vec![], Trust::Light).unwrap();
        head = Arc::new(state);
        if round == 0 {
          // one producer alone proves nothing
          assert_eq!(head.claimed_irreversible_num(), 0);
        }
      }
    }
    // after several full rotations irreversibility trails the head
    // by roughly a third of the schedule
    let lib = head.claimed_irreversible_num();
    assert!(lib > 0);
    assert!(lib < head.block_num());
  }

  #[test]
  fn rejects_wrong_previous() {
    let key = Keypair::from_seed([1u8; 32]);
    let genesis = genesis_with(&key);
    let b1 = BlockState::next(
      &genesis,
      make_block(&genesis, "prod.a", &key),
      vec![],
      Trust::Full,
    )
    .unwrap();

    let stale = make_block(&genesis, "prod.a", &key);
    assert!(matches!(
      BlockState::next(&b1, stale, vec![], Trust::Full),
      Err(ChainError::InvalidHeader(_))
    ));
  }

  #[test]
  fn rejects_bad_signature() {
    let key = Keypair::from_seed([1u8; 32]);
    let intruder = Keypair::from_seed([9u8; 32]);
    let genesis = genesis_with(&key);

    let mut block = make_block(&genesis, "prod.a", &key);
    block.producer_signature =
      intruder.sign(block.header.digest().as_ref());
    assert!(matches!(
      BlockState::next(&genesis, block, vec![], Trust::Full),
      Err(ChainError::InvalidBlockSignature)
    ));
  }

  #[test]
  fn schedule_promotion_waits_for_irreversibility() {
    let key = Keypair::from_seed([1u8; 32]);
    let other = Keypair::from_seed([2u8; 32]);
    let genesis = genesis_with(&key);

    // block 1 proposes a two-producer schedule
    let mut block = make_block(&genesis, "prod.a", &key);
    block.header.new_producers = Some(ProducerSchedule {
      version: 1,
      producers: vec![
        ProducerAuthority::single("prod.a".parse().unwrap(), key.public()),
        ProducerAuthority::single("prod.b".parse().unwrap(), other.public()),
      ],
    });
    block.producer_signature = key.sign(block.header.digest().as_ref());
    let b1 =
      BlockState::next(&genesis, block, vec![], Trust::Light).unwrap();
    assert!(b1.pending_schedule.is_some());
    assert_eq!(b1.active_schedule.version, 0);

    // block 2 does not promote yet: block 1 is not irreversible
    let b2 = BlockState::next(
      &b1,
      make_block(&b1, "prod.a", &key),
      vec![],
      Trust::Light,
    )
    .unwrap();
    assert!(b2.pending_schedule.is_some());
    assert_eq!(b2.active_schedule.version, 0);

    // by block 3 the proposal block is irreversible and the new
    // schedule takes over, reflected in the header version
    let mut b3_block = make_block(&b2, "prod.a", &key);
    b3_block.header.schedule_version = 1;
    b3_block.producer_signature =
      key.sign(b3_block.header.digest().as_ref());
    let b3 = BlockState::next(&b2, b3_block, vec![], Trust::Light).unwrap();
    assert!(b3.pending_schedule.is_none());
    assert_eq!(b3.active_schedule.version, 1);
    assert_eq!(b3.active_schedule.producers.len(), 2);
  }

  pub(crate) fn transition_block(
    prev: &BlockState,
    producer: &str,
    key: &Keypair,
    policy: FinalizerPolicy,
  ) -> SignedBlock {
    let mut block = make_block(prev, producer, key);
    let ext = FinalityExtension {
      qc_claim: QcClaim {
        block_num: prev.block_num() + 1,
        is_strong: false,
      },
      new_finalizer_policy: Some(policy),
    };
    block.header.header_extensions.push(Extension {
      id: FINALITY_EXTENSION_ID,
      data: ext.to_wire_bytes(),
    });
    block.producer_signature = key.sign(block.header.digest().as_ref());
    block
  }

  #[test]
  fn finality_transition_switches_flavor() {
    let key = Keypair::from_seed([1u8; 32]);
    let genesis = genesis_with(&key);
    let policy = FinalizerPolicy {
      generation: 1,
      finalizers: vec![],
    };

    let block = transition_block(&genesis, "prod.a", &key, policy);
    let state =
      BlockState::next(&genesis, block, vec![], Trust::Light).unwrap();
    let finality = state.finality_state().unwrap();
    assert_eq!(finality.core.current_block_num(), 1);
    assert_eq!(finality.core.last_final_block_num, 1);

    // subsequent blocks must carry a claim
    let bare = make_block(&state, "prod.a", &key);
    assert!(matches!(
      BlockState::next(&state, bare, vec![], Trust::Light),
      Err(ChainError::InvalidQcClaim(_))
    ));
  }
}
