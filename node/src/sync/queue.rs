//! Batched fetch queue.
//!
//! Ordered sequence of contiguous height ranges ("batches"), each running
//! independent fetches for headers, bodies, and receipts. Jobs are dispensed
//! in height order with track priority headers > receipts > bodies,
//! deliveries are checked against the hash chain and the owning header's
//! derived roots before they are accepted, and fully fetched batches are
//! released as a contiguous prefix.

use alloy_consensus::constants::{EMPTY_OMMER_ROOT_HASH, EMPTY_ROOT_HASH};
use alloy_consensus::proofs::{
    calculate_ommers_root, calculate_receipt_root, calculate_transaction_root,
};
use alloy_consensus::{ReceiptWithBloom, TxReceipt};
use alloy_primitives::B256;
use parking_lot::Mutex;
use reth_ethereum_primitives::{Block, BlockBody, Receipt};
use reth_primitives_traits::{Header, SealedHeader};
use std::collections::HashMap;
use std::fmt;

/// Maximum number of blocks a single batch may span.
pub const MAX_BATCH: u64 = 100;

/// Fetch dimension within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    Headers,
    Bodies,
    Receipts,
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Headers => write!(f, "headers"),
            Self::Bodies => write!(f, "bodies"),
            Self::Receipts => write!(f, "receipts"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackStatus {
    Waiting,
    Pending,
    Completed,
}

/// Rejected or misaddressed deliveries. The affected track keeps its prior
/// state; the caller re-dispatches the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    UnknownBatch(u32),
    TrackCompleted(Track),
    OversizedDelivery {
        track: Track,
        capacity: usize,
        got: usize,
    },
    HeadMismatch {
        expected: B256,
        got: B256,
    },
    LinkageMismatch {
        expected: B256,
        got: B256,
    },
    RootMismatch {
        track: Track,
        number: u64,
        expected: B256,
        got: B256,
    },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownBatch(id) => write!(f, "batch {id} not found"),
            Self::TrackCompleted(track) => write!(f, "{track} already completed"),
            Self::OversizedDelivery {
                track,
                capacity,
                got,
            } => write!(f, "received more {track} than expected: {got} > {capacity}"),
            Self::HeadMismatch { expected, got } => {
                write!(f, "first header parent {got} does not match head {expected}")
            }
            Self::LinkageMismatch { expected, got } => {
                write!(f, "header parent {got} does not match {expected}")
            }
            Self::RootMismatch {
                track,
                number,
                expected,
                got,
            } => write!(
                f,
                "derived {track} root {got} for block {number} does not match {expected}"
            ),
        }
    }
}

impl std::error::Error for QueueError {}

/// Work unit dispensed to a fetcher.
#[derive(Debug, Clone)]
pub struct Job {
    pub batch_id: u32,
    pub kind: JobKind,
}

#[derive(Debug, Clone)]
pub enum JobKind {
    /// Fetch `count` headers ascending from `start`.
    Headers { start: u64, count: u64 },
    /// Fetch bodies for the given headers, in order.
    Bodies { headers: Vec<SealedHeader> },
    /// Fetch receipt lists for the given headers, in order.
    Receipts { headers: Vec<SealedHeader> },
}

/// Fully fetched, validated batch released to the caller.
#[derive(Debug, Clone)]
pub struct CompletedBatch {
    /// First height of the batch range.
    pub start: u64,
    pub headers: Vec<SealedHeader>,
    pub bodies: Vec<BlockBody>,
    pub receipts: Vec<Vec<Receipt>>,
}

impl CompletedBatch {
    /// Hash of the last header in the batch.
    pub fn last_hash(&self) -> Option<B256> {
        self.headers.last().map(SealedHeader::hash)
    }

    /// Reassemble blocks by pairing body-bearing headers with the delivered
    /// bodies in order. Headers without a body get an empty one.
    pub fn into_blocks(self) -> Vec<Block> {
        let mut bodies = self.bodies.into_iter();
        self.headers
            .into_iter()
            .map(|sealed| {
                let body = if has_body(sealed.header()) {
                    bodies.next().unwrap_or_default()
                } else {
                    BlockBody::default()
                };
                Block {
                    header: sealed.header().clone(),
                    body,
                }
            })
            .collect()
    }
}

pub(crate) fn has_body(header: &Header) -> bool {
    header.transactions_root != EMPTY_ROOT_HASH || header.ommers_hash != EMPTY_OMMER_ROOT_HASH
}

pub(crate) fn has_receipts(header: &Header) -> bool {
    header.receipts_root != EMPTY_ROOT_HASH
}

/// Receipt trie root over a block's receipt list.
pub(crate) fn receipts_root(receipts: &[Receipt]) -> B256 {
    let with_bloom: Vec<ReceiptWithBloom<Receipt>> = receipts
        .iter()
        .map(|receipt| ReceiptWithBloom {
            receipt: receipt.clone(),
            logs_bloom: receipt.bloom(),
        })
        .collect();
    calculate_receipt_root(&with_bloom)
}

#[derive(Debug)]
struct Batch {
    id: u32,
    block: u64,
    prev: Option<u32>,
    next: Option<u32>,

    headers: Vec<SealedHeader>,
    headers_status: TrackStatus,

    bodies: Vec<BlockBody>,
    bodies_headers: Vec<SealedHeader>,
    bodies_status: TrackStatus,

    receipts: Vec<Vec<Receipt>>,
    receipts_headers: Vec<SealedHeader>,
    receipts_status: TrackStatus,
}

impl Batch {
    fn new(id: u32, block: u64) -> Self {
        // bodies and receipts stay completed until the headers land and tell
        // us which blocks actually carry them
        Self {
            id,
            block,
            prev: None,
            next: None,
            headers: Vec::new(),
            headers_status: TrackStatus::Waiting,
            bodies: Vec::new(),
            bodies_headers: Vec::new(),
            bodies_status: TrackStatus::Completed,
            receipts: Vec::new(),
            receipts_headers: Vec::new(),
            receipts_status: TrackStatus::Completed,
        }
    }

    fn completed(&self) -> bool {
        self.headers_status == TrackStatus::Completed
            && self.bodies_status == TrackStatus::Completed
            && self.receipts_status == TrackStatus::Completed
    }

    fn has_waiting(&self) -> bool {
        self.headers_status == TrackStatus::Waiting
            || self.bodies_status == TrackStatus::Waiting
            || self.receipts_status == TrackStatus::Waiting
    }

    fn last_header_hash(&self) -> Option<B256> {
        self.headers.last().map(SealedHeader::hash)
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    batches: HashMap<u32, Batch>,
    front: Option<u32>,
    back: Option<u32>,
    seq: u32,
    head_hash: B256,
}

impl QueueInner {
    fn next_id(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Fixed length of a batch, defined by the start of the one after it.
    fn span(&self, batch: &Batch) -> Option<u64> {
        batch
            .next
            .and_then(|next| self.batches.get(&next))
            .map(|next| next.block - batch.block)
    }

    fn insert_after(&mut self, id: u32, block: u64) {
        let new_id = self.next_id();
        let old_next = self.batches.get(&id).and_then(|batch| batch.next);
        let mut inserted = Batch::new(new_id, block);
        inserted.prev = Some(id);
        inserted.next = old_next;
        match old_next {
            Some(next_id) => {
                if let Some(next) = self.batches.get_mut(&next_id) {
                    next.prev = Some(new_id);
                }
            }
            None => self.back = Some(new_id),
        }
        if let Some(current) = self.batches.get_mut(&id) {
            current.next = Some(new_id);
        }
        self.batches.insert(new_id, inserted);
    }

    fn add_back(&mut self, block: u64) {
        match self.back {
            None => {
                // first insert initializes both ends
                let id = self.next_id();
                self.batches.insert(id, Batch::new(id, block));
                self.front = Some(id);
                self.back = Some(id);
            }
            Some(back_id) => {
                let back_block = self.batches.get(&back_id).map(|batch| batch.block);
                if back_block.is_some_and(|existing| block > existing) {
                    self.insert_after(back_id, block);
                }
            }
        }
    }

    fn dequeue(&mut self, limit: Option<u64>) -> Option<Job> {
        let mut cursor = self.front;
        let mut chosen = None;
        while let Some(id) = cursor {
            let batch = self.batches.get(&id)?;
            // batches are height-ordered, so nothing past the limit qualifies
            if limit.is_some_and(|limit| batch.block >= limit) {
                break;
            }
            if batch.has_waiting() {
                chosen = Some(id);
                break;
            }
            cursor = batch.next;
        }
        let id = chosen?;

        // fix the batch length before dispensing: the tail, or an oversized
        // span, splits at MAX_BATCH
        let (block, span) = {
            let batch = self.batches.get(&id)?;
            (batch.block, self.span(batch))
        };
        if span.is_none_or(|span| span > MAX_BATCH) {
            self.insert_after(id, block + MAX_BATCH);
        }

        let batch = self.batches.get_mut(&id)?;
        if batch.headers_status == TrackStatus::Waiting {
            batch.headers_status = TrackStatus::Pending;
            let start = batch.block + batch.headers.len() as u64;
            let count = MAX_BATCH - batch.headers.len() as u64;
            return Some(Job {
                batch_id: id,
                kind: JobKind::Headers { start, count },
            });
        }
        if batch.receipts_status == TrackStatus::Waiting {
            batch.receipts_status = TrackStatus::Pending;
            let headers = batch.receipts_headers[batch.receipts.len()..].to_vec();
            return Some(Job {
                batch_id: id,
                kind: JobKind::Receipts { headers },
            });
        }
        if batch.bodies_status == TrackStatus::Waiting {
            batch.bodies_status = TrackStatus::Pending;
            let headers = batch.bodies_headers[batch.bodies.len()..].to_vec();
            return Some(Job {
                batch_id: id,
                kind: JobKind::Bodies { headers },
            });
        }
        None
    }

    fn deliver_headers(&mut self, id: u32, headers: Vec<SealedHeader>) -> Result<(), QueueError> {
        let batch = self.batches.get(&id).ok_or(QueueError::UnknownBatch(id))?;
        if batch.headers_status == TrackStatus::Completed {
            return Err(QueueError::TrackCompleted(Track::Headers));
        }
        if headers.is_empty() {
            // peer had nothing this round; reopen the slot
            if let Some(batch) = self.batches.get_mut(&id) {
                batch.headers_status = TrackStatus::Waiting;
            }
            return Ok(());
        }

        let span = self.span(batch).unwrap_or(MAX_BATCH);
        let capacity = (span as usize).saturating_sub(batch.headers.len());
        if headers.len() > capacity {
            return Err(QueueError::OversizedDelivery {
                track: Track::Headers,
                capacity,
                got: headers.len(),
            });
        }

        // every check below runs before any state is touched, so a rejected
        // delivery leaves the batch exactly as it was
        let first_parent = headers[0].header().parent_hash;
        match batch.headers.last() {
            Some(last) => {
                if first_parent != last.hash() {
                    return Err(QueueError::LinkageMismatch {
                        expected: last.hash(),
                        got: first_parent,
                    });
                }
            }
            None => match batch.prev {
                None => {
                    if first_parent != self.head_hash {
                        return Err(QueueError::HeadMismatch {
                            expected: self.head_hash,
                            got: first_parent,
                        });
                    }
                }
                Some(prev_id) => {
                    let prev = self
                        .batches
                        .get(&prev_id)
                        .ok_or(QueueError::UnknownBatch(prev_id))?;
                    if prev.headers_status == TrackStatus::Completed {
                        if let Some(prev_hash) = prev.last_header_hash() {
                            if first_parent != prev_hash {
                                return Err(QueueError::LinkageMismatch {
                                    expected: prev_hash,
                                    got: first_parent,
                                });
                            }
                        }
                    }
                    // previous headers not in yet; the boundary is checked
                    // when they land
                }
            },
        }

        for pair in headers.windows(2) {
            if pair[1].header().parent_hash != pair[0].hash() {
                return Err(QueueError::LinkageMismatch {
                    expected: pair[0].hash(),
                    got: pair[1].header().parent_hash,
                });
            }
        }

        let filling = batch.headers.len() + headers.len() == span as usize;
        if filling {
            if let Some(next) = batch.next.and_then(|next| self.batches.get(&next)) {
                if next.headers_status == TrackStatus::Completed {
                    if let (Some(last), Some(next_first)) = (headers.last(), next.headers.first()) {
                        if next_first.header().parent_hash != last.hash() {
                            return Err(QueueError::LinkageMismatch {
                                expected: last.hash(),
                                got: next_first.header().parent_hash,
                            });
                        }
                    }
                }
            }
        }

        let Some(batch) = self.batches.get_mut(&id) else {
            return Err(QueueError::UnknownBatch(id));
        };
        batch.headers.extend(headers);
        if !filling {
            batch.headers_status = TrackStatus::Waiting;
            return Ok(());
        }

        batch.headers_status = TrackStatus::Completed;
        batch.bodies_status = TrackStatus::Completed;
        batch.receipts_status = TrackStatus::Completed;

        let bodies: Vec<SealedHeader> = batch
            .headers
            .iter()
            .filter(|sealed| has_body(sealed.header()))
            .cloned()
            .collect();
        let receipts: Vec<SealedHeader> = batch
            .headers
            .iter()
            .filter(|sealed| has_receipts(sealed.header()))
            .cloned()
            .collect();
        if !receipts.is_empty() {
            batch.receipts_status = TrackStatus::Waiting;
            batch.receipts_headers = receipts;
        }
        if !bodies.is_empty() {
            batch.bodies_status = TrackStatus::Waiting;
            batch.bodies_headers = bodies;
        }
        Ok(())
    }

    fn deliver_bodies(&mut self, id: u32, bodies: Vec<BlockBody>) -> Result<(), QueueError> {
        let batch = self.batches.get(&id).ok_or(QueueError::UnknownBatch(id))?;
        if batch.bodies_status == TrackStatus::Completed {
            return Err(QueueError::TrackCompleted(Track::Bodies));
        }
        if bodies.is_empty() {
            if let Some(batch) = self.batches.get_mut(&id) {
                batch.bodies_status = TrackStatus::Waiting;
            }
            return Ok(());
        }

        let capacity = batch.bodies_headers.len() - batch.bodies.len();
        if bodies.len() > capacity {
            return Err(QueueError::OversizedDelivery {
                track: Track::Bodies,
                capacity,
                got: bodies.len(),
            });
        }

        let offset = batch.bodies.len();
        for (idx, body) in bodies.iter().enumerate() {
            let header = batch.bodies_headers[offset + idx].header();
            let tx_root = calculate_transaction_root(&body.transactions);
            if tx_root != header.transactions_root {
                return Err(QueueError::RootMismatch {
                    track: Track::Bodies,
                    number: header.number,
                    expected: header.transactions_root,
                    got: tx_root,
                });
            }
            let ommers_hash = calculate_ommers_root(&body.ommers);
            if ommers_hash != header.ommers_hash {
                return Err(QueueError::RootMismatch {
                    track: Track::Bodies,
                    number: header.number,
                    expected: header.ommers_hash,
                    got: ommers_hash,
                });
            }
        }

        let Some(batch) = self.batches.get_mut(&id) else {
            return Err(QueueError::UnknownBatch(id));
        };
        batch.bodies.extend(bodies);
        batch.bodies_status = if batch.bodies.len() == batch.bodies_headers.len() {
            TrackStatus::Completed
        } else {
            TrackStatus::Waiting
        };
        Ok(())
    }

    fn deliver_receipts(&mut self, id: u32, receipts: Vec<Vec<Receipt>>) -> Result<(), QueueError> {
        let batch = self.batches.get(&id).ok_or(QueueError::UnknownBatch(id))?;
        if batch.receipts_status == TrackStatus::Completed {
            return Err(QueueError::TrackCompleted(Track::Receipts));
        }
        if receipts.is_empty() {
            if let Some(batch) = self.batches.get_mut(&id) {
                batch.receipts_status = TrackStatus::Waiting;
            }
            return Ok(());
        }

        let capacity = batch.receipts_headers.len() - batch.receipts.len();
        if receipts.len() > capacity {
            return Err(QueueError::OversizedDelivery {
                track: Track::Receipts,
                capacity,
                got: receipts.len(),
            });
        }

        let offset = batch.receipts.len();
        for (idx, list) in receipts.iter().enumerate() {
            let header = batch.receipts_headers[offset + idx].header();
            let root = receipts_root(list);
            if root != header.receipts_root {
                return Err(QueueError::RootMismatch {
                    track: Track::Receipts,
                    number: header.number,
                    expected: header.receipts_root,
                    got: root,
                });
            }
        }

        let Some(batch) = self.batches.get_mut(&id) else {
            return Err(QueueError::UnknownBatch(id));
        };
        batch.receipts.extend(receipts);
        batch.receipts_status = if batch.receipts.len() == batch.receipts_headers.len() {
            TrackStatus::Completed
        } else {
            TrackStatus::Waiting
        };
        Ok(())
    }

    fn fetch_completed_data(&mut self) -> Vec<CompletedBatch> {
        let mut out = Vec::new();
        let mut cursor = self.front;
        while let Some(id) = cursor {
            let Some(batch) = self.batches.get(&id) else {
                break;
            };
            if !batch.completed() {
                break;
            }
            cursor = batch.next;
            if let Some(batch) = self.batches.remove(&id) {
                out.push(CompletedBatch {
                    start: batch.block,
                    headers: batch.headers,
                    bodies: batch.bodies,
                    receipts: batch.receipts,
                });
            }
        }
        if let Some(hash) = out.last().and_then(CompletedBatch::last_hash) {
            self.head_hash = hash;
        }
        self.front = cursor;
        match self.front {
            Some(front_id) => {
                if let Some(front) = self.batches.get_mut(&front_id) {
                    front.prev = None;
                }
            }
            None => self.back = None,
        }
        out
    }

    fn num_completed_batches(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.front;
        while let Some(id) = cursor {
            let Some(batch) = self.batches.get(&id) else {
                break;
            };
            if !batch.completed() {
                break;
            }
            count += 1;
            cursor = batch.next;
        }
        count
    }
}

/// Batched fetch queue guarded by a single lock.
///
/// All structural reads and mutations go through the mutex; hold times are
/// short and no I/O happens under the lock (callers seal headers before
/// delivering).
#[derive(Debug)]
pub struct BatchQueue {
    inner: Mutex<QueueInner>,
}

impl BatchQueue {
    /// Empty queue whose `head_hash` is the tip already accepted into the
    /// local chain.
    pub fn new(head_hash: B256) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                head_hash,
                ..QueueInner::default()
            }),
        }
    }

    /// Hash the next delivered batch must chain from.
    pub fn head_hash(&self) -> B256 {
        self.inner.lock().head_hash
    }

    /// Append a batch starting at `block` past the tail. Ignored unless the
    /// start height is strictly increasing.
    pub fn add_back(&self, block: u64) {
        self.inner.lock().add_back(block);
    }

    /// Dispense the next job, or `None` when no track is waiting.
    pub fn dequeue(&self) -> Option<Job> {
        self.inner.lock().dequeue(None)
    }

    /// Like [`Self::dequeue`], restricted to batches starting below `limit`.
    pub fn dequeue_below(&self, limit: u64) -> Option<Job> {
        self.inner.lock().dequeue(Some(limit))
    }

    pub fn deliver_headers(&self, id: u32, headers: Vec<SealedHeader>) -> Result<(), QueueError> {
        self.inner.lock().deliver_headers(id, headers)
    }

    pub fn deliver_bodies(&self, id: u32, bodies: Vec<BlockBody>) -> Result<(), QueueError> {
        self.inner.lock().deliver_bodies(id, bodies)
    }

    pub fn deliver_receipts(&self, id: u32, receipts: Vec<Vec<Receipt>>) -> Result<(), QueueError> {
        self.inner.lock().deliver_receipts(id, receipts)
    }

    /// Detach and return the maximal completed prefix, advancing `head_hash`
    /// to the hash of the last returned header.
    pub fn fetch_completed_data(&self) -> Vec<CompletedBatch> {
        self.inner.lock().fetch_completed_data()
    }

    /// Number of batches the next [`Self::fetch_completed_data`] would return.
    pub fn num_completed_batches(&self) -> usize {
        self.inner.lock().num_completed_batches()
    }
}
