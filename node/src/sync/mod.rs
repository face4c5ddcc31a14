//! Block synchronization core.
//!
//! Two engines cooperate here: the batched fetch queue, which validates and
//! orders header/body/receipt deliveries from untrusted peers, and the sync
//! driver, which streams blocks from one peer at a time and fails over when
//! a peer misbehaves.

mod driver;
mod peers;
mod pipeline;
mod queue;

pub use driver::{PeerSyncOutcome, Syncer};
pub use peers::PeerMap;
pub use pipeline::BatchSync;
pub use queue::{BatchQueue, CompletedBatch, Job, JobKind, QueueError, Track, MAX_BATCH};

pub(crate) use queue::has_body;
#[cfg(test)]
pub(crate) use queue::receipts_root;

use eyre::Report;
use std::fmt;

/// Errors surfaced by the sync driver.
///
/// Per-peer failures are swallowed by the outer loops, which move on to the
/// next candidate; only cancellation propagates out of a sync run.
#[derive(Debug)]
pub enum SyncError {
    /// Stream open failure or mid-stream transport error.
    Peer(Report),
    /// Per-block inactivity window expired.
    Timeout,
    /// The chain rejected a block during verification.
    Verify(Report),
    /// The chain failed to persist a block.
    Write(Report),
    /// Shutdown was requested.
    Cancelled,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer(report) => write!(f, "peer error: {report}"),
            Self::Timeout => write!(f, "timed out waiting for a block"),
            Self::Verify(report) => write!(f, "block verification failed: {report}"),
            Self::Write(report) => write!(f, "block write failed: {report}"),
            Self::Cancelled => write!(f, "sync was cancelled"),
        }
    }
}

impl std::error::Error for SyncError {}
