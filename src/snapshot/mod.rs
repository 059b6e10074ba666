//! Snapshot encoding and decoding.
//!
//! A snapshot is a sequence of named sections, each framed as
//! `{name_len: u32, name, section_size: u64, rows}`, starting with a
//! versioned `chain_snapshot_header`. Rows are bincode. Versions 2
//! through the current one are readable (older versions get their
//! layout fixed up on read); writes always emit the current version.
//! The SHA-256 of the whole stream is the integrity hash, used as the
//! canonical digest of committed state.

use {
  crate::{
    chain::{
      block::{ProducerSchedule, SignedBlock},
      block_state::{
        BlockState,
        ConsensusFlavor,
        FinalityState,
        LegacyState,
        PendingSchedule,
      },
      finality::{FinalityCore, FinalizerPolicy},
      ChainError,
    },
    primitives::{Digest, WireDecode, WireEncode},
    state::ChainTables,
  },
  multihash::{Sha2_256, StatefulHasher},
  serde::{de::DeserializeOwned, Deserialize, Serialize},
  std::{
    io::{Read, Write},
    sync::{
      atomic::AtomicBool,
      Arc,
      Mutex,
    },
  },
};

pub const CURRENT_SNAPSHOT_VERSION: u32 = 6;
pub const MIN_SUPPORTED_SNAPSHOT_VERSION: u32 = 2;

const HEADER_SECTION: &str = "chain_snapshot_header";
const BLOCK_STATE_SECTION: &str = "block_state";
const TABLES_SECTION: &str = "chain_tables";

fn snapshot_err(e: impl std::fmt::Display) -> ChainError {
  ChainError::Snapshot(e.to_string())
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotHeader {
  version: u32,
}

/// Serializable projection of a [`BlockState`] (the live type carries
/// atomics and caches that do not belong in a snapshot).
#[derive(Debug, Serialize, Deserialize)]
pub struct SerializedBlockState {
  pub block_bytes: Vec<u8>,
  pub block_id: crate::primitives::BlockId,
  pub active_schedule: ProducerSchedule,
  pub pending_schedule: Option<PendingSchedule>,
  pub activated_features: Vec<Digest>,
  pub flavor: SerializedFlavor,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum SerializedFlavor {
  Legacy(LegacyState),
  Finality { policy: FinalizerPolicy, core: FinalityCore },
}

impl SerializedBlockState {
  pub fn capture(state: &BlockState) -> Self {
    Self {
      block_bytes: state.block.to_wire_bytes(),
      block_id: state.id,
      active_schedule: state.active_schedule.clone(),
      pending_schedule: state.pending_schedule.clone(),
      activated_features: state.activated_features.clone(),
      flavor: match &state.flavor {
        ConsensusFlavor::Legacy(legacy) => {
          SerializedFlavor::Legacy(legacy.clone())
        }
        ConsensusFlavor::Finality(finality) => SerializedFlavor::Finality {
          policy: (*finality.active_finalizer_policy).clone(),
          core: finality.core.clone(),
        },
      },
    }
  }

  pub fn restore(self) -> Result<BlockState, ChainError> {
    let block = SignedBlock::from_wire_bytes(&self.block_bytes)?;
    Ok(BlockState {
      id: self.block_id,
      block: Arc::new(block),
      active_schedule: self.active_schedule,
      pending_schedule: self.pending_schedule,
      activated_features: self.activated_features,
      flavor: match self.flavor {
        SerializedFlavor::Legacy(legacy) => ConsensusFlavor::Legacy(legacy),
        SerializedFlavor::Finality { policy, core } => {
          ConsensusFlavor::Finality(FinalityState {
            active_finalizer_policy: Arc::new(policy),
            core,
          })
        }
      },
      valid: AtomicBool::new(true),
      pending_qc: Mutex::new(None),
      valid_qc: Mutex::new(None),
      cached_trx_metas: Mutex::new(Vec::new()),
    })
  }
}

/// Wraps a sink and hashes every byte that passes through.
struct HashingWriter<W: Write> {
  inner: W,
  hasher: Sha2_256,
}

impl<W: Write> Write for HashingWriter<W> {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    let written = self.inner.write(buf)?;
    self.hasher.update(&buf[..written]);
    Ok(written)
  }

  fn flush(&mut self) -> std::io::Result<()> {
    self.inner.flush()
  }
}

pub struct SnapshotWriter<W: Write> {
  out: HashingWriter<W>,
}

impl<W: Write> SnapshotWriter<W> {
  pub fn new(out: W) -> Result<Self, ChainError> {
    let mut writer =
      Self { out: HashingWriter { inner: out, hasher: Sha2_256::default() } };
    writer.write_section(
      HEADER_SECTION,
      &SnapshotHeader { version: CURRENT_SNAPSHOT_VERSION },
    )?;
    Ok(writer)
  }

  pub fn write_section<T: Serialize>(
    &mut self,
    name: &str,
    rows: &T,
  ) -> Result<(), ChainError> {
    let body = bincode::serialize(rows).map_err(snapshot_err)?;
    self
      .out
      .write_all(&(name.len() as u32).to_le_bytes())
      .map_err(snapshot_err)?;
    self.out.write_all(name.as_bytes()).map_err(snapshot_err)?;
    self
      .out
      .write_all(&(body.len() as u64).to_le_bytes())
      .map_err(snapshot_err)?;
    self.out.write_all(&body).map_err(snapshot_err)?;
    Ok(())
  }

  pub fn write_block_state(
    &mut self,
    state: &SerializedBlockState,
  ) -> Result<(), ChainError> {
    self.write_section(BLOCK_STATE_SECTION, state)
  }

  pub fn write_tables(&mut self, tables: &ChainTables) -> Result<(), ChainError> {
    self.write_section(TABLES_SECTION, tables)
  }

  /// Flushes and returns the integrity hash of everything written.
  pub fn finish(mut self) -> Result<Digest, ChainError> {
    self.out.flush().map_err(snapshot_err)?;
    Ok(Digest(self.out.hasher.finalize().try_into().unwrap()))
  }
}

pub struct SnapshotReader<R: Read> {
  input: R,
  pub version: u32,
}

impl<R: Read> SnapshotReader<R> {
  pub fn new(mut input: R) -> Result<Self, ChainError> {
    let (name, body) = read_section(&mut input)?;
    if name != HEADER_SECTION {
      return Err(ChainError::Snapshot(format!(
        "expected {HEADER_SECTION} first, found {name}"
      )));
    }
    let header: SnapshotHeader =
      bincode::deserialize(&body).map_err(snapshot_err)?;
    if header.version < MIN_SUPPORTED_SNAPSHOT_VERSION
      || header.version > CURRENT_SNAPSHOT_VERSION
    {
      return Err(ChainError::Snapshot(format!(
        "unsupported snapshot version {}",
        header.version
      )));
    }
    Ok(Self { input, version: header.version })
  }

  pub fn read_section<T: DeserializeOwned>(
    &mut self,
    expected: &str,
  ) -> Result<T, ChainError> {
    let (name, body) = read_section(&mut self.input)?;
    if name != expected {
      return Err(ChainError::Snapshot(format!(
        "expected section {expected}, found {name}"
      )));
    }
    bincode::deserialize(&body).map_err(snapshot_err)
  }

  pub fn read_block_state(&mut self) -> Result<SerializedBlockState, ChainError> {
    self.read_section(BLOCK_STATE_SECTION)
  }

  /// Reads the table sections, applying per-version fixups: v2 kept
  /// the chain id in a separate genesis section, v3 and v4 carried a
  /// reduced global-properties layout.
  pub fn read_tables(&mut self) -> Result<ChainTables, ChainError> {
    if self.version == 2 {
      // v2: a genesis_state section precedes the tables and is the
      // authoritative source of the chain id
      let chain_id: Digest = self.read_section("genesis_state")?;
      let mut tables: ChainTables = self.read_section(TABLES_SECTION)?;
      tables.global.chain_id = chain_id;
      return Ok(tables);
    }
    if self.version <= 4 {
      // v3/v4: global properties predate proposed finalizer policies
      #[derive(Deserialize)]
      struct LegacyGlobal {
        chain_id: Digest,
        params: crate::state::ChainParams,
        proposed_schedule: Option<crate::state::ProposedSchedule>,
        global_action_sequence: u64,
      }
      #[derive(Deserialize)]
      struct LegacyTables {
        accounts: std::collections::BTreeMap<
          crate::primitives::AccountName,
          crate::state::AccountObject,
        >,
        contract_kv: std::collections::BTreeMap<
          (crate::primitives::AccountName, Vec<u8>),
          Vec<u8>,
        >,
        scheduled: std::collections::BTreeMap<
          (crate::primitives::TimePointSec, crate::primitives::TransactionId),
          crate::state::ScheduledTransaction,
        >,
        dedup: std::collections::BTreeMap<
          (crate::primitives::TimePointSec, crate::primitives::TransactionId),
          (),
        >,
        dedup_by_id: std::collections::BTreeMap<
          crate::primitives::TransactionId,
          crate::primitives::TimePointSec,
        >,
        usage: std::collections::BTreeMap<
          crate::primitives::AccountName,
          crate::state::AccountUsage,
        >,
        global: LegacyGlobal,
        protocol: crate::state::ProtocolState,
      }
      let legacy: LegacyTables = self.read_section(TABLES_SECTION)?;
      return Ok(ChainTables {
        accounts: legacy.accounts,
        contract_kv: legacy.contract_kv,
        scheduled: legacy.scheduled,
        dedup: legacy.dedup,
        dedup_by_id: legacy.dedup_by_id,
        usage: legacy.usage,
        global: crate::state::GlobalProperties {
          chain_id: legacy.global.chain_id,
          params: legacy.global.params,
          proposed_schedule: legacy.global.proposed_schedule,
          proposed_finalizer_policy: None,
          global_action_sequence: legacy.global.global_action_sequence,
        },
        protocol: legacy.protocol,
      });
    }
    self.read_section(TABLES_SECTION)
  }
}

fn read_section(input: &mut impl Read) -> Result<(String, Vec<u8>), ChainError> {
  let mut len_bytes = [0u8; 4];
  input.read_exact(&mut len_bytes).map_err(snapshot_err)?;
  let name_len = u32::from_le_bytes(len_bytes) as usize;
  if name_len > 256 {
    return Err(ChainError::Snapshot(format!(
      "section name of {name_len} bytes is implausible"
    )));
  }
  let mut name_bytes = vec![0u8; name_len];
  input.read_exact(&mut name_bytes).map_err(snapshot_err)?;
  let name = String::from_utf8(name_bytes).map_err(snapshot_err)?;

  let mut size_bytes = [0u8; 8];
  input.read_exact(&mut size_bytes).map_err(snapshot_err)?;
  let size = u64::from_le_bytes(size_bytes) as usize;
  let mut body = vec![0u8; size];
  input.read_exact(&mut body).map_err(snapshot_err)?;
  Ok((name, body))
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      chain::block_state::tests::single_producer_schedule,
      primitives::{BlockTimestamp, Keypair},
      state::Database,
    },
  };

  fn test_state() -> (BlockState, ChainTables) {
    let key = Keypair::from_seed([1u8; 32]);
    let state = BlockState::genesis(
      Digest::of(b"snapshot chain"),
      BlockTimestamp(0),
      single_producer_schedule("prod.a", &key),
    );
    let mut db = Database::new();
    db.modify_global(|g| g.chain_id = Digest::of(b"snapshot chain"));
    db.kv_set(
      &"prod.a".parse().unwrap(),
      b"row".to_vec(),
      b"value".to_vec(),
    )
    .unwrap();
    (state, db.tables().clone())
  }

  fn write_all(state: &BlockState, tables: &ChainTables) -> (Vec<u8>, Digest) {
    let mut buffer = Vec::new();
    let mut writer = SnapshotWriter::new(&mut buffer).unwrap();
    writer
      .write_block_state(&SerializedBlockState::capture(state))
      .unwrap();
    writer.write_tables(tables).unwrap();
    let hash = writer.finish().unwrap();
    (buffer, hash)
  }

  #[test]
  fn roundtrip_restores_state_and_tables() {
    let (state, tables) = test_state();
    let (bytes, _) = write_all(&state, &tables);

    let mut reader = SnapshotReader::new(bytes.as_slice()).unwrap();
    assert_eq!(reader.version, CURRENT_SNAPSHOT_VERSION);
    let restored = reader.read_block_state().unwrap().restore().unwrap();
    let restored_tables = reader.read_tables().unwrap();

    assert_eq!(restored.id, state.id);
    assert_eq!(restored.active_schedule, state.active_schedule);
    assert_eq!(restored_tables, tables);
  }

  #[test]
  fn integrity_hash_is_deterministic_and_content_sensitive() {
    let (state, tables) = test_state();
    let (_, h1) = write_all(&state, &tables);
    let (_, h2) = write_all(&state, &tables);
    assert_eq!(h1, h2);

    let mut other_tables = tables.clone();
    other_tables.global.global_action_sequence += 1;
    let (_, h3) = write_all(&state, &other_tables);
    assert_ne!(h1, h3);
  }

  #[test]
  fn rejects_unknown_versions_and_wrong_sections() {
    let (state, tables) = test_state();
    let (bytes, _) = write_all(&state, &tables);

    // reading sections out of order fails cleanly
    let mut reader = SnapshotReader::new(bytes.as_slice()).unwrap();
    assert!(reader.read_tables().is_err());

    // a future version is refused
    let mut buffer = Vec::new();
    {
      use std::io::Write as _;
      let name = HEADER_SECTION.as_bytes();
      let body =
        bincode::serialize(&SnapshotHeader { version: 99 }).unwrap();
      buffer.write_all(&(name.len() as u32).to_le_bytes()).unwrap();
      buffer.write_all(name).unwrap();
      buffer.write_all(&(body.len() as u64).to_le_bytes()).unwrap();
      buffer.write_all(&body).unwrap();
    }
    assert!(SnapshotReader::new(buffer.as_slice()).is_err());
  }
}
