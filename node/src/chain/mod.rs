//! Local chain collaborator surface.

use alloy_consensus::proofs::{calculate_ommers_root, calculate_transaction_root};
use alloy_primitives::B256;
use eyre::{eyre, Result};
use parking_lot::RwLock;
use reth_ethereum_primitives::{Block, BlockBody};
use reth_primitives_traits::{Header, SealedHeader};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Event emitted for every block accepted into the local chain.
#[derive(Debug, Clone, Copy)]
pub struct ChainEvent {
    pub number: u64,
    pub hash: B256,
}

/// Chain surface consumed by the sync core.
///
/// Execution, state transition, and fork choice live behind this trait; the
/// sync core only reads the tip, verifies finalized blocks, and writes them
/// in canonical order.
pub trait Blockchain: Send + Sync + 'static {
    /// Current local tip header.
    fn header(&self) -> Header;

    /// Fetch a stored block by number. `full` includes the block body.
    fn get_block_by_number(&self, number: u64, full: bool) -> Option<Block>;

    /// Verify a finalized block before insertion.
    fn verify_finalized_block(&self, block: &Block) -> Result<()>;

    /// Insert a verified block as the new tip.
    fn write_block(&self, block: &Block) -> Result<()>;

    /// Subscribe to tip events.
    fn subscribe_events(&self) -> broadcast::Receiver<ChainEvent>;
}

const CHAIN_EVENT_BUFFER: usize = 256;

#[derive(Debug)]
struct MemoryChainInner {
    blocks: BTreeMap<u64, Block>,
    tip: SealedHeader,
}

/// In-memory canonical chain.
///
/// Keeps verified blocks in height order behind a single tip. Verification
/// enforces strict number/parent linkage and the body's derived roots; no
/// execution is performed.
#[derive(Debug)]
pub struct MemoryChain {
    inner: RwLock<MemoryChainInner>,
    events: broadcast::Sender<ChainEvent>,
}

impl MemoryChain {
    pub fn new(genesis: Header) -> Self {
        let tip = SealedHeader::seal_slow(genesis.clone());
        let mut blocks = BTreeMap::new();
        blocks.insert(
            genesis.number,
            Block {
                header: genesis,
                body: BlockBody::default(),
            },
        );
        let (events, _) = broadcast::channel(CHAIN_EVENT_BUFFER);
        Self {
            inner: RwLock::new(MemoryChainInner { blocks, tip }),
            events,
        }
    }

    /// Hash of the current tip.
    pub fn tip_hash(&self) -> B256 {
        self.inner.read().tip.hash()
    }
}

impl Blockchain for MemoryChain {
    fn header(&self) -> Header {
        self.inner.read().tip.header().clone()
    }

    fn get_block_by_number(&self, number: u64, full: bool) -> Option<Block> {
        let inner = self.inner.read();
        let block = inner.blocks.get(&number)?.clone();
        if full {
            Some(block)
        } else {
            Some(Block {
                header: block.header,
                body: BlockBody::default(),
            })
        }
    }

    fn verify_finalized_block(&self, block: &Block) -> Result<()> {
        let inner = self.inner.read();
        let expected = inner.tip.header().number + 1;
        if block.header.number != expected {
            return Err(eyre!(
                "non-contiguous block number: expected {expected}, got {}",
                block.header.number
            ));
        }
        if block.header.parent_hash != inner.tip.hash() {
            return Err(eyre!(
                "parent hash of block {} does not match the local tip",
                block.header.number
            ));
        }
        let tx_root = calculate_transaction_root(&block.body.transactions);
        if tx_root != block.header.transactions_root {
            return Err(eyre!(
                "transaction root mismatch for block {}",
                block.header.number
            ));
        }
        let ommers_hash = calculate_ommers_root(&block.body.ommers);
        if ommers_hash != block.header.ommers_hash {
            return Err(eyre!(
                "ommers hash mismatch for block {}",
                block.header.number
            ));
        }
        Ok(())
    }

    fn write_block(&self, block: &Block) -> Result<()> {
        let mut inner = self.inner.write();
        let expected = inner.tip.header().number + 1;
        if block.header.number != expected {
            return Err(eyre!(
                "write out of order: expected {expected}, got {}",
                block.header.number
            ));
        }
        let sealed = SealedHeader::seal_slow(block.header.clone());
        inner.blocks.insert(block.header.number, block.clone());
        let event = ChainEvent {
            number: sealed.header().number,
            hash: sealed.hash(),
        };
        inner.tip = sealed;
        drop(inner);
        let _ = self.events.send(event);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }
}
