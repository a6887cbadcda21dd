//! Video playback rate votes.
//!
//! Every playback surface may vote for the content rate it wants. The
//! aggregator keeps one winning vote (highest rate, ties to the lowest
//! surface id) and tells the downstream resolver whenever the winner
//! changes: first a cancel for the dethroned vote, then the new one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::registry::lock;
use crate::types::{Pid, SurfaceId};

pub const VIDEO_VOTER_NAME: &str = "VOTER_VIDEO";

/// Rate request delivered to the downstream resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub name: String,
    pub enabled: bool,
    pub min: u32,
    pub max: u32,
}

impl EventInfo {
    fn enable(rate: u32) -> Self {
        Self {
            name: VIDEO_VOTER_NAME.to_string(),
            enabled: true,
            min: rate,
            max: rate,
        }
    }

    fn cancel() -> Self {
        Self {
            name: VIDEO_VOTER_NAME.to_string(),
            enabled: false,
            min: 0,
            max: 0,
        }
    }
}

/// Downstream receiver of vote changes. Fire-and-forget.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, pid: Pid, info: EventInfo);
}

impl<F> NotificationSink for F
where
    F: Fn(Pid, EventInfo) + Send + Sync,
{
    fn notify(&self, pid: Pid, info: EventInfo) {
        self(pid, info)
    }
}

/// The vote currently asserted downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoVote {
    pub pid: Pid,
    pub rate: u32,
}

#[derive(Default)]
struct VoteTable {
    entries: BTreeMap<SurfaceId, VideoVote>,
    last_voted: Option<VideoVote>,
}

impl VoteTable {
    fn winner(&self) -> Option<VideoVote> {
        // Ascending surface order; only a strictly higher rate displaces the
        // current pick, so ties stay with the lowest surface id.
        self.entries.values().fold(None, |best, &vote| match best {
            Some(b) if b.rate >= vote.rate => Some(b),
            _ => Some(vote),
        })
    }
}

pub struct VideoRateVoteAggregator {
    table: Mutex<VoteTable>,
    outbox_tx: Sender<(Pid, EventInfo)>,
    outbox_rx: Receiver<(Pid, EventInfo)>,
    delivering: AtomicBool,
    sink: Arc<dyn NotificationSink>,
}

impl VideoRateVoteAggregator {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        let (outbox_tx, outbox_rx) = unbounded();
        Self {
            table: Mutex::new(VoteTable::default()),
            outbox_tx,
            outbox_rx,
            delivering: AtomicBool::new(false),
            sink,
        }
    }

    /// Record `rate` for `surface` (0 withdraws). Returns true when the
    /// winning vote changed.
    pub fn vote(&self, surface: SurfaceId, pid: Pid, rate: u32) -> bool {
        let changed = {
            let mut table = lock(&self.table);
            if rate == 0 {
                table.entries.remove(&surface);
            } else {
                table.entries.insert(surface, VideoVote { pid, rate });
            }

            let winner = table.winner();
            if winner == table.last_voted {
                false
            } else {
                // Queued under the lock so delivery order matches mutation order.
                if let Some(previous) = table.last_voted {
                    let _ = self.outbox_tx.send((previous.pid, EventInfo::cancel()));
                }
                if let Some(next) = winner {
                    let _ = self.outbox_tx.send((next.pid, EventInfo::enable(next.rate)));
                }
                log::debug!(
                    "[video] winning vote {:?} -> {:?} ({} surfaces)",
                    table.last_voted,
                    winner,
                    table.entries.len()
                );
                table.last_voted = winner;
                true
            }
        };

        self.deliver();
        changed
    }

    /// Withdraw whatever `surface` voted for.
    pub fn release_surface(&self, surface: SurfaceId) -> bool {
        let pid = lock(&self.table).entries.get(&surface).map(|v| v.pid);
        match pid {
            Some(pid) => self.vote(surface, pid, 0),
            None => false,
        }
    }

    /// Hand queued notifications to the sink with no lock held. Only one
    /// thread drains at a time, which keeps the sink's view ordered.
    fn deliver(&self) {
        loop {
            if self
                .delivering
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            while let Ok((pid, info)) = self.outbox_rx.try_recv() {
                self.sink.notify(pid, info);
            }
            self.delivering.store(false, Ordering::Release);

            if self.outbox_rx.is_empty() {
                return;
            }
        }
    }

    pub fn active_vote(&self) -> Option<VideoVote> {
        lock(&self.table).last_voted
    }

    pub fn vote_count(&self) -> usize {
        lock(&self.table).entries.len()
    }
}
