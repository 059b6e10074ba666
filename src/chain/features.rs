//! Protocol features: the catalog of consensus upgrades and their
//! activation handlers.
//!
//! Every handler is idempotent and writes only to the protocol-state
//! singleton (plus the specific table it is defined to clean up), so
//! replaying an activation is harmless.

use {
  super::error::ChainError,
  crate::{
    primitives::{AccountName, Digest},
    state::{ActivatedFeature, Database},
  },
  indexmap::IndexMap,
  once_cell::sync::Lazy,
  tracing::info,
};

/// Key prefix of the ram-correction rows the `replace_deferred`
/// activation deletes.
pub const RAM_CORRECTION_PREFIX: &[u8] = b"ramcorrection.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinFeature {
  PreactivateFeature,
  GetSender,
  ReplaceDeferred,
  WebauthnKey,
  WtmsigBlockSignatures,
  ActionReturnValue,
  ConfigurableWasmLimits,
  BlockchainParameters,
  GetCodeHash,
  GetBlockNum,
  CryptoPrimitives,
  BlsPrimitives,
  DisableDeferredTrxsStage2,
  InstantFinality,
}

pub const ALL_FEATURES: [BuiltinFeature; 14] = [
  BuiltinFeature::PreactivateFeature,
  BuiltinFeature::GetSender,
  BuiltinFeature::ReplaceDeferred,
  BuiltinFeature::WebauthnKey,
  BuiltinFeature::WtmsigBlockSignatures,
  BuiltinFeature::ActionReturnValue,
  BuiltinFeature::ConfigurableWasmLimits,
  BuiltinFeature::BlockchainParameters,
  BuiltinFeature::GetCodeHash,
  BuiltinFeature::GetBlockNum,
  BuiltinFeature::CryptoPrimitives,
  BuiltinFeature::BlsPrimitives,
  BuiltinFeature::DisableDeferredTrxsStage2,
  BuiltinFeature::InstantFinality,
];

impl BuiltinFeature {
  pub fn codename(&self) -> &'static str {
    match self {
      BuiltinFeature::PreactivateFeature => "PREACTIVATE_FEATURE",
      BuiltinFeature::GetSender => "GET_SENDER",
      BuiltinFeature::ReplaceDeferred => "REPLACE_DEFERRED",
      BuiltinFeature::WebauthnKey => "WEBAUTHN_KEY",
      BuiltinFeature::WtmsigBlockSignatures => "WTMSIG_BLOCK_SIGNATURES",
      BuiltinFeature::ActionReturnValue => "ACTION_RETURN_VALUE",
      BuiltinFeature::ConfigurableWasmLimits => "CONFIGURABLE_WASM_LIMITS",
      BuiltinFeature::BlockchainParameters => "BLOCKCHAIN_PARAMETERS",
      BuiltinFeature::GetCodeHash => "GET_CODE_HASH",
      BuiltinFeature::GetBlockNum => "GET_BLOCK_NUM",
      BuiltinFeature::CryptoPrimitives => "CRYPTO_PRIMITIVES",
      BuiltinFeature::BlsPrimitives => "BLS_PRIMITIVES",
      BuiltinFeature::DisableDeferredTrxsStage2 => {
        "DISABLE_DEFERRED_TRXS_STAGE_2"
      }
      BuiltinFeature::InstantFinality => "INSTANT_FINALITY",
    }
  }

  /// The digest a block names this feature by.
  pub fn digest(&self) -> Digest {
    Digest::of(self.codename())
  }

  pub fn dependencies(&self) -> &'static [BuiltinFeature] {
    match self {
      BuiltinFeature::DisableDeferredTrxsStage2 => {
        &[BuiltinFeature::ReplaceDeferred]
      }
      BuiltinFeature::InstantFinality => {
        &[BuiltinFeature::WtmsigBlockSignatures]
      }
      _ => &[],
    }
  }

  fn whitelisted_intrinsics(&self) -> &'static [&'static str] {
    match self {
      BuiltinFeature::PreactivateFeature => {
        &["preactivate_feature", "is_feature_activated"]
      }
      BuiltinFeature::GetSender => &["get_sender"],
      BuiltinFeature::ReplaceDeferred => &[],
      BuiltinFeature::WebauthnKey => &[],
      BuiltinFeature::WtmsigBlockSignatures => &["set_proposed_producers_ex"],
      BuiltinFeature::ActionReturnValue => &["set_action_return_value"],
      BuiltinFeature::ConfigurableWasmLimits => &["set_wasm_parameters"],
      BuiltinFeature::BlockchainParameters => {
        &["get_parameters_packed", "set_parameters_packed"]
      }
      BuiltinFeature::GetCodeHash => &["get_code_hash"],
      BuiltinFeature::GetBlockNum => &["get_block_num"],
      BuiltinFeature::CryptoPrimitives => {
        &["alt_bn128_add", "alt_bn128_mul", "alt_bn128_pair", "mod_exp",
          "blake2_f", "sha3", "k1_recover"]
      }
      BuiltinFeature::BlsPrimitives => {
        &["bls_g1_add", "bls_g2_add", "bls_pairing", "bls_g1_map",
          "bls_g2_map", "bls_fp_mod"]
      }
      BuiltinFeature::DisableDeferredTrxsStage2 => &[],
      BuiltinFeature::InstantFinality => &["set_finalizers"],
    }
  }

  /// Runs the activation handler. Handlers only touch the protocol
  /// state singleton and the tables their upgrade retires.
  fn run_handler(&self, db: &mut Database) {
    db.modify_protocol(|p| {
      for name in self.whitelisted_intrinsics() {
        p.whitelisted_intrinsics.insert((*name).to_string());
      }
    });

    match self {
      BuiltinFeature::WebauthnKey => {
        db.modify_protocol(|p| p.num_supported_key_types = 3);
      }
      BuiltinFeature::ReplaceDeferred => {
        // outstanding ram corrections become moot under the new
        // deferred-transaction semantics
        let system: AccountName = "system".parse().expect("static name");
        let doomed: Vec<Vec<u8>> = db
          .tables()
          .contract_kv
          .range((system.clone(), RAM_CORRECTION_PREFIX.to_vec())..)
          .take_while(|((owner, key), _)| {
            *owner == system && key.starts_with(RAM_CORRECTION_PREFIX)
          })
          .map(|((_, key), _)| key.clone())
          .collect();
        for key in doomed {
          db.kv_remove(&system, &key);
        }
      }
      BuiltinFeature::DisableDeferredTrxsStage2 => {
        let doomed = db.all_scheduled();
        for key in doomed {
          if let Some(scheduled) = db.scheduled(&key) {
            info!(
              "deleting scheduled transaction {} of payer {}",
              scheduled.trx_id, scheduled.payer
            );
          }
          db.remove_scheduled(&key);
        }
      }
      BuiltinFeature::InstantFinality => {
        db.modify_protocol(|p| p.finality_transition_armed = true);
      }
      _ => {}
    }
  }
}

/// Catalog indexed by feature digest, in canonical order.
pub static CATALOG: Lazy<IndexMap<Digest, BuiltinFeature>> = Lazy::new(|| {
  ALL_FEATURES.iter().map(|f| (f.digest(), *f)).collect()
});

pub fn lookup(digest: &Digest) -> Option<BuiltinFeature> {
  CATALOG.get(digest).copied()
}

/// Activates one feature in a block: dependency check, handler, and
/// the activation record. Digests earlier in the same activation list
/// count as satisfied dependencies.
pub fn activate_feature(
  db: &mut Database,
  digest: &Digest,
  activated_earlier: &[Digest],
  block_num: u32,
) -> Result<(), ChainError> {
  let feature = lookup(digest).ok_or_else(|| {
    ChainError::ProtocolFeatureBadBlock(format!(
      "unrecognized protocol feature {digest}"
    ))
  })?;
  if db.protocol().is_activated(digest) {
    return Err(ChainError::ProtocolFeatureBadBlock(format!(
      "feature {} activated twice",
      feature.codename()
    )));
  }
  for dependency in feature.dependencies() {
    let dep_digest = dependency.digest();
    if !db.protocol().is_activated(&dep_digest)
      && !activated_earlier.contains(&dep_digest)
    {
      return Err(ChainError::ProtocolFeatureBadBlock(format!(
        "feature {} requires {}",
        feature.codename(),
        dependency.codename()
      )));
    }
  }

  feature.run_handler(db);
  db.modify_protocol(|p| {
    p.preactivated.retain(|d| d != digest);
    p.activated.push(ActivatedFeature {
      feature_digest: *digest,
      activation_block_num: block_num,
    });
  });
  info!("activated protocol feature {}", feature.codename());
  Ok(())
}

/// The `preactivate_feature` intrinsic: records governance consent
/// for a feature so a producer may activate it in an upcoming block.
pub fn preactivate_feature(
  db: &mut Database,
  digest: &Digest,
) -> Result<(), ChainError> {
  if lookup(digest).is_none() {
    return Err(ChainError::ProtocolFeatureBadBlock(format!(
      "cannot preactivate unknown feature {digest}"
    )));
  }
  if db.protocol().is_activated(digest) {
    return Err(ChainError::ProtocolFeatureBadBlock(
      "feature is already activated".into(),
    ));
  }
  db.modify_protocol(|p| {
    if !p.preactivated.contains(digest) {
      p.preactivated.push(*digest);
    }
  });
  Ok(())
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::state::ScheduledTransaction,
    crate::primitives::TimePointSec,
  };

  #[test]
  fn digests_are_stable_and_unique() {
    let mut seen = std::collections::HashSet::new();
    for feature in ALL_FEATURES {
      assert!(seen.insert(feature.digest()));
      assert_eq!(lookup(&feature.digest()), Some(feature));
    }
  }

  #[test]
  fn activation_whitelists_intrinsics() {
    let mut db = Database::new();
    let digest = BuiltinFeature::GetSender.digest();
    activate_feature(&mut db, &digest, &[], 5).unwrap();

    assert!(db.protocol().whitelisted_intrinsics.contains("get_sender"));
    assert!(db.protocol().is_activated(&digest));
    assert_eq!(db.protocol().activated[0].activation_block_num, 5);

    // second activation is rejected
    assert!(activate_feature(&mut db, &digest, &[], 6).is_err());
  }

  #[test]
  fn dependencies_must_be_active_or_earlier_in_list() {
    let mut db = Database::new();
    let stage2 = BuiltinFeature::DisableDeferredTrxsStage2.digest();
    let replace = BuiltinFeature::ReplaceDeferred.digest();

    assert!(activate_feature(&mut db, &stage2, &[], 1).is_err());
    // earlier in the same activation list satisfies the dependency
    activate_feature(&mut db, &replace, &[], 1).unwrap();
    activate_feature(&mut db, &stage2, &[replace], 1).unwrap();
  }

  #[test]
  fn stage2_deletes_scheduled_transactions() {
    let mut db = Database::new();
    db.schedule_transaction(ScheduledTransaction {
      trx_id: Digest::of(b"deferred"),
      sender: "alice".parse().unwrap(),
      payer: "alice".parse().unwrap(),
      delay_until: TimePointSec(100),
      expiration: TimePointSec(200),
      published: Default::default(),
      packed_trx: vec![],
    })
    .unwrap();

    activate_feature(
      &mut db,
      &BuiltinFeature::ReplaceDeferred.digest(),
      &[],
      1,
    )
    .unwrap();
    activate_feature(
      &mut db,
      &BuiltinFeature::DisableDeferredTrxsStage2.digest(),
      &[],
      1,
    )
    .unwrap();
    assert!(db.all_scheduled().is_empty());
  }

  #[test]
  fn webauthn_raises_key_types() {
    let mut db = Database::new();
    assert_eq!(db.protocol().num_supported_key_types, 2);
    activate_feature(&mut db, &BuiltinFeature::WebauthnKey.digest(), &[], 1)
      .unwrap();
    assert_eq!(db.protocol().num_supported_key_types, 3);
  }

  #[test]
  fn instant_finality_arms_the_transition() {
    let mut db = Database::new();
    activate_feature(
      &mut db,
      &BuiltinFeature::WtmsigBlockSignatures.digest(),
      &[],
      1,
    )
    .unwrap();
    activate_feature(
      &mut db,
      &BuiltinFeature::InstantFinality.digest(),
      &[],
      2,
    )
    .unwrap();
    assert!(db.protocol().finality_transition_armed);
    assert!(db.protocol().whitelisted_intrinsics.contains("set_finalizers"));
  }

  #[test]
  fn preactivation_is_recorded_once() {
    let mut db = Database::new();
    let digest = BuiltinFeature::GetBlockNum.digest();
    preactivate_feature(&mut db, &digest).unwrap();
    preactivate_feature(&mut db, &digest).unwrap();
    assert_eq!(db.protocol().preactivated, vec![digest]);

    assert!(preactivate_feature(&mut db, &Digest::of(b"bogus")).is_err());
  }
}
