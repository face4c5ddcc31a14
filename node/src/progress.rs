//! Sync progress reporting.

use crate::chain::ChainEvent;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Progress reporting surface consumed by the sync driver.
pub trait Progression: Send + Sync + 'static {
    /// Begin reporting from `starting_block`, following chain events.
    fn start_progression(&self, starting_block: u64, events: broadcast::Receiver<ChainEvent>);

    /// Record the highest block advertised by the current sync target.
    fn update_highest_progression(&self, highest_block: u64);

    /// Stop reporting. Idempotent.
    fn stop_progression(&self);
}

/// Point-in-time view of a sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressionSnapshot {
    pub starting_block: u64,
    pub current_block: u64,
    pub highest_block: u64,
}

/// Atomic progression tracker fed by chain events.
#[derive(Debug, Default)]
pub struct ProgressionTracker {
    starting: AtomicU64,
    current: Arc<AtomicU64>,
    highest: AtomicU64,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl ProgressionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProgressionSnapshot {
        ProgressionSnapshot {
            starting_block: self.starting.load(Ordering::SeqCst),
            current_block: self.current.load(Ordering::SeqCst),
            highest_block: self.highest.load(Ordering::SeqCst),
        }
    }
}

impl Progression for ProgressionTracker {
    fn start_progression(&self, starting_block: u64, mut events: broadcast::Receiver<ChainEvent>) {
        self.starting.store(starting_block, Ordering::SeqCst);
        self.current
            .store(starting_block.saturating_sub(1), Ordering::SeqCst);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop.lock() = Some(stop_tx);

        let current = Arc::clone(&self.current);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => {
                            current.fetch_max(event.number, Ordering::SeqCst);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn update_highest_progression(&self, highest_block: u64) {
        self.highest.store(highest_block, Ordering::SeqCst);
    }

    fn stop_progression(&self) {
        if let Some(stop_tx) = self.stop.lock().take() {
            let _ = stop_tx.send(true);
        }
    }
}
