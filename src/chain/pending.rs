//! The pending block and its three stages.
//!
//! A pending block moves strictly building → assembled → completed,
//! no skipping. The building stage accumulates receipts and digests;
//! assembly freezes the ordering and computes the merkle roots;
//! completion signs the header and embeds everything into a new block
//! state. At most one pending block exists at a time and it owns the
//! database undo session its transactions nested under.

use {
  super::{
    block::{BlockHeader, TransactionReceipt},
    block_state::BlockState,
    transaction::TransactionMetadata,
  },
  crate::{
    primitives::{AccountName, BlockId, BlockTimestamp, Digest},
    state::UndoSession,
  },
  std::sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
  /// We are the scheduled producer assembling a block to sign.
  Producing,
  /// Building speculatively on the head to keep the node warm.
  Speculating,
  /// Re-executing a block received from the network.
  Validating,
}

/// Restore point over the building block's four ordered lists; see
/// [`BuildingBlock::restore`].
#[derive(Debug, Clone, Copy)]
pub struct BuildingCheckpoint {
  receipts: usize,
  receipt_digests: usize,
  action_receipt_digests: usize,
  trx_metas: usize,
}

pub struct BuildingBlock {
  pub timestamp: BlockTimestamp,
  pub producer: AccountName,
  pub confirmed: u16,
  pub previous: Arc<BlockState>,
  /// Features newly activated by this block, in activation order.
  pub new_activated_features: Vec<Digest>,
  pub receipts: Vec<TransactionReceipt>,
  pub receipt_digests: Vec<Digest>,
  pub action_receipt_digests: Vec<Digest>,
  pub trx_metas: Vec<Arc<TransactionMetadata>>,
  pub block_cpu_used_us: u64,
  pub block_net_used: u64,
}

impl BuildingBlock {
  pub fn block_num(&self) -> u32 {
    self.previous.block_num() + 1
  }

  /// Marks the sizes of the four receipt-ordered lists, so a failed
  /// transaction can truncate back to a byte-identical block.
  pub fn checkpoint(&self) -> BuildingCheckpoint {
    BuildingCheckpoint {
      receipts: self.receipts.len(),
      receipt_digests: self.receipt_digests.len(),
      action_receipt_digests: self.action_receipt_digests.len(),
      trx_metas: self.trx_metas.len(),
    }
  }

  pub fn restore(&mut self, checkpoint: BuildingCheckpoint) {
    self.receipts.truncate(checkpoint.receipts);
    self.receipt_digests.truncate(checkpoint.receipt_digests);
    self
      .action_receipt_digests
      .truncate(checkpoint.action_receipt_digests);
    self.trx_metas.truncate(checkpoint.trx_metas);
  }
}

pub struct AssembledBlock {
  pub id: BlockId,
  pub header: BlockHeader,
  pub previous: Arc<BlockState>,
  pub new_activated_features: Vec<Digest>,
  pub receipts: Vec<TransactionReceipt>,
  pub trx_metas: Vec<Arc<TransactionMetadata>>,
  /// Certificate to attach as a block extension, chosen during
  /// assembly together with the header's qc claim.
  pub qc_to_attach: Option<super::finality::QuorumCertificate>,
}

pub struct CompletedBlock {
  pub state: Arc<BlockState>,
}

pub enum BlockStage {
  Building(BuildingBlock),
  Assembled(AssembledBlock),
  Completed(CompletedBlock),
}

impl BlockStage {
  pub fn name(&self) -> &'static str {
    match self {
      BlockStage::Building(_) => "building",
      BlockStage::Assembled(_) => "assembled",
      BlockStage::Completed(_) => "completed",
    }
  }
}

pub struct PendingBlock {
  pub stage: BlockStage,
  /// Undo session covering everything the block changes. Absent only
  /// in irreversible replay, where sessions are skipped.
  pub session: Option<UndoSession>,
  pub mode: BlockMode,
}

impl PendingBlock {
  pub fn block_num(&self) -> u32 {
    match &self.stage {
      BlockStage::Building(building) => building.block_num(),
      BlockStage::Assembled(assembled) => assembled.id.num(),
      BlockStage::Completed(completed) => completed.state.block_num(),
    }
  }

  pub fn timestamp(&self) -> BlockTimestamp {
    match &self.stage {
      BlockStage::Building(building) => building.timestamp,
      BlockStage::Assembled(assembled) => assembled.header.timestamp,
      BlockStage::Completed(completed) => completed.state.timestamp(),
    }
  }

  pub fn is_producing(&self) -> bool {
    self.mode == BlockMode::Producing
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      chain::{
        block::{ReceiptTrx, TransactionStatus},
        block_state::tests::single_producer_schedule,
      },
      primitives::Keypair,
    },
  };

  fn building() -> BuildingBlock {
    let key = Keypair::from_seed([1u8; 32]);
    let genesis = BlockState::genesis(
      Digest::of(b"chain"),
      BlockTimestamp(0),
      single_producer_schedule("prod.a", &key),
    );
    BuildingBlock {
      timestamp: BlockTimestamp(1),
      producer: "prod.a".parse().unwrap(),
      confirmed: 0,
      previous: Arc::new(genesis),
      new_activated_features: vec![],
      receipts: vec![],
      receipt_digests: vec![],
      action_receipt_digests: vec![],
      trx_metas: vec![],
      block_cpu_used_us: 0,
      block_net_used: 0,
    }
  }

  #[test]
  fn checkpoint_restores_all_lists() {
    let mut block = building();
    block.receipts.push(TransactionReceipt {
      status: TransactionStatus::Executed,
      cpu_usage_us: 10,
      net_usage_words: 1,
      trx: ReceiptTrx::Id(Digest::of(b"t0")),
    });
    block.receipt_digests.push(Digest::of(b"t0"));
    block.action_receipt_digests.push(Digest::of(b"a0"));

    let checkpoint = block.checkpoint();

    block.receipts.push(TransactionReceipt {
      status: TransactionStatus::Executed,
      cpu_usage_us: 20,
      net_usage_words: 1,
      trx: ReceiptTrx::Id(Digest::of(b"t1")),
    });
    block.receipt_digests.push(Digest::of(b"t1"));
    block.action_receipt_digests.push(Digest::of(b"a1"));
    block.action_receipt_digests.push(Digest::of(b"a2"));

    block.restore(checkpoint);
    assert_eq!(block.receipts.len(), 1);
    assert_eq!(block.receipt_digests.len(), 1);
    assert_eq!(block.action_receipt_digests.len(), 1);
    // invariant: receipts and their digest list stay in lockstep
    assert_eq!(block.receipts.len(), block.receipt_digests.len());
  }

  #[test]
  fn stage_names() {
    let block = building();
    assert_eq!(BlockStage::Building(block).name(), "building");
  }
}
