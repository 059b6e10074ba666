//! The append-only block log.
//!
//! Irreversible blocks only. Each record is `{size: u32, bytes, id}`;
//! a companion index file holds one u64 offset per block so number
//! lookups are one seek. The head of the log always equals the last
//! irreversible block at the moment it was appended.

use {
  crate::{
    chain::block::SignedBlock,
    primitives::{BlockId, WireDecode, WireEncode, WireError},
  },
  std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
  },
  thiserror::Error,
  tracing::info,
};

#[derive(Debug, Error)]
pub enum BlockLogError {
  #[error("io: {0}")]
  Io(#[from] std::io::Error),

  #[error("wire: {0}")]
  Wire(#[from] WireError),

  #[error("block {got} does not extend the log head {head}")]
  NonSequential { head: u32, got: u32 },

  #[error("block {got} does not link to the log head id")]
  BrokenLink { got: u32 },

  #[error("corrupt index entry for block {0}")]
  CorruptIndex(u32),
}

type Result<T> = std::result::Result<T, BlockLogError>;

pub struct BlockLog {
  log: File,
  index: File,
  first_num: Option<u32>,
  head: Option<(u32, BlockId)>,
}

impl BlockLog {
  pub fn open(dir: &Path) -> Result<Self> {
    std::fs::create_dir_all(dir)?;
    let log = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(dir.join("blocks.log"))?;
    let index = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(dir.join("blocks.index"))?;

    let mut opened = Self { log, index, first_num: None, head: None };
    opened.recover()?;
    if let Some((num, _)) = opened.head {
      info!("block log resumed at block {num}");
    }
    Ok(opened)
  }

  /// Rebuilds first/head from the files. The first record stores its
  /// own number inside the block, so the log is self-describing.
  fn recover(&mut self) -> Result<()> {
    let entries = self.index.metadata()?.len() / 8;
    if entries == 0 {
      return Ok(());
    }
    let first_offset = self.read_offset(0)?;
    let (first, _) = self.read_record_at(first_offset)?;
    let first_num = first.block_num();
    let last_offset = self.read_offset(entries - 1)?;
    let (last, last_id) = self.read_record_at(last_offset)?;
    self.first_num = Some(first_num);
    self.head = Some((last.block_num(), last_id));
    Ok(())
  }

  fn read_offset(&mut self, entry: u64) -> Result<u64> {
    let mut bytes = [0u8; 8];
    self.index.seek(SeekFrom::Start(entry * 8))?;
    self.index.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
  }

  fn read_record_at(&mut self, offset: u64) -> Result<(SignedBlock, BlockId)> {
    self.log.seek(SeekFrom::Start(offset))?;
    let mut size_bytes = [0u8; 4];
    self.log.read_exact(&mut size_bytes)?;
    let size = u32::from_le_bytes(size_bytes) as usize;
    let mut block_bytes = vec![0u8; size];
    self.log.read_exact(&mut block_bytes)?;
    let mut id_bytes = [0u8; 32];
    self.log.read_exact(&mut id_bytes)?;
    let block = SignedBlock::from_wire_bytes(&block_bytes)?;
    Ok((block, BlockId(id_bytes)))
  }

  pub fn head(&self) -> Option<(u32, BlockId)> {
    self.head
  }

  pub fn first_num(&self) -> Option<u32> {
    self.first_num
  }

  /// Appends a pre-serialized block. The caller serializes blocks in
  /// a worker pool; this method only checks continuity and writes.
  pub fn append_serialized(
    &mut self,
    num: u32,
    id: BlockId,
    previous: BlockId,
    bytes: &[u8],
  ) -> Result<()> {
    match self.head {
      Some((head_num, head_id)) => {
        if num != head_num + 1 {
          return Err(BlockLogError::NonSequential { head: head_num, got: num });
        }
        if previous != head_id {
          return Err(BlockLogError::BrokenLink { got: num });
        }
      }
      None => {}
    }

    let offset = self.log.seek(SeekFrom::End(0))?;
    self.log.write_all(&(bytes.len() as u32).to_le_bytes())?;
    self.log.write_all(bytes)?;
    self.log.write_all(&id.0)?;
    self.log.flush()?;

    self.index.seek(SeekFrom::End(0))?;
    self.index.write_all(&offset.to_le_bytes())?;
    self.index.flush()?;

    self.first_num.get_or_insert(num);
    self.head = Some((num, id));
    Ok(())
  }

  pub fn append(&mut self, block: &SignedBlock, id: BlockId) -> Result<()> {
    self.append_serialized(
      block.block_num(),
      id,
      block.header.previous,
      &block.to_wire_bytes(),
    )
  }

  pub fn read_by_num(&mut self, num: u32) -> Result<Option<SignedBlock>> {
    let Some(first) = self.first_num else {
      return Ok(None);
    };
    let Some((head_num, _)) = self.head else {
      return Ok(None);
    };
    if num < first || num > head_num {
      return Ok(None);
    }
    let offset = self.read_offset((num - first) as u64)?;
    let (block, _) = self.read_record_at(offset)?;
    if block.block_num() != num {
      return Err(BlockLogError::CorruptIndex(num));
    }
    Ok(Some(block))
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      chain::block_state::{
        tests::{make_block, single_producer_schedule},
        BlockState,
        Trust,
      },
      primitives::{BlockTimestamp, Digest, Keypair},
    },
    std::sync::Arc,
  };

  fn chain_of(n: usize) -> Vec<(SignedBlock, BlockId)> {
    let key = Keypair::from_seed([1u8; 32]);
    let mut state = Arc::new(BlockState::genesis(
      Digest::of(b"log test"),
      BlockTimestamp(0),
      single_producer_schedule("prod.a", &key),
    ));
    let mut blocks = vec![(state.block.as_ref().clone(), state.id)];
    for _ in 0..n {
      let block = make_block(&state, "prod.a", &key);
      state = Arc::new(
        BlockState::next(&state, block.clone(), vec![], Trust::Full).unwrap(),
      );
      blocks.push((block, state.id));
    }
    blocks
  }

  #[test]
  fn append_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = BlockLog::open(dir.path()).unwrap();
    assert!(log.head().is_none());

    // the genesis state at index 0 never enters the log
    let blocks = chain_of(3);
    for (block, id) in &blocks[1..] {
      log.append(block, *id).unwrap();
    }

    assert_eq!(log.first_num(), Some(1));
    assert_eq!(log.head(), Some((3, blocks[3].1)));
    for (block, _) in &blocks[1..] {
      let read = log.read_by_num(block.block_num()).unwrap().unwrap();
      assert_eq!(&read, block);
    }
    assert!(log.read_by_num(17).unwrap().is_none());
    assert!(log.read_by_num(0).unwrap().is_none());
  }

  #[test]
  fn rejects_gaps_and_wrong_links() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = BlockLog::open(dir.path()).unwrap();
    let blocks = chain_of(3);

    log.append(&blocks[1].0, blocks[1].1).unwrap();
    assert!(matches!(
      log.append(&blocks[3].0, blocks[3].1),
      Err(BlockLogError::NonSequential { head: 1, got: 3 })
    ));
  }

  #[test]
  fn reopen_recovers_head() {
    let dir = tempfile::tempdir().unwrap();
    let blocks = chain_of(2);
    {
      let mut log = BlockLog::open(dir.path()).unwrap();
      for (block, id) in &blocks[1..] {
        log.append(block, *id).unwrap();
      }
    }

    let mut reopened = BlockLog::open(dir.path()).unwrap();
    assert_eq!(reopened.head(), Some((2, blocks[2].1)));
    assert_eq!(reopened.first_num(), Some(1));
    assert_eq!(
      reopened.read_by_num(1).unwrap().unwrap(),
      blocks[1].0
    );
  }
}
