//! Receive-side epochs: groups of replicated writes between two barriers.
//!
//! The peer closes an epoch by sending a barrier number. We acknowledge the
//! barrier with the epoch size once every write of the epoch is complete
//! and the configured write-ordering method guarantees those writes reached
//! stable storage before any write of a later epoch.
//!
//! Epochs are kept oldest first; the last entry is the current epoch that
//! new writes join. Only the oldest epoch may finish.

use std::collections::VecDeque;

use blkrepl_storage::BlockStore;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::DiskConfig;

/// Default limit on live epochs before falling back to inline flushes.
pub const DEFAULT_MAX_EPOCHS: usize = 1024;

/// Method used to keep writes of consecutive epochs in order.
///
/// Ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteOrdering {
    /// No ordering guarantee.
    None,
    /// Wait for in-flight writes to complete.
    Drain,
    /// Drain, then flush the backing device.
    Flush,
    /// Tag the first write of each epoch as a barrier.
    Barrier,
}

impl WriteOrdering {
    /// Printable name.
    pub fn name(self) -> &'static str {
        match self {
            WriteOrdering::None => "none",
            WriteOrdering::Drain => "drain",
            WriteOrdering::Flush => "flush",
            WriteOrdering::Barrier => "barrier",
        }
    }
}

/// What happened to the epoch an event was delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinishOutcome {
    /// Still collecting or waiting.
    #[default]
    StillLive,
    /// Finished and removed.
    Destroyed,
    /// Finished; it was the current epoch and is reused in place.
    Recycled,
}

/// Identifies an epoch for the lifetime of the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpochId(u64);

/// Result of a write joining the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddedWrite {
    /// Epoch the write belongs to.
    pub epoch: EpochId,
    /// Submit the write with the barrier flag.
    pub barrier: bool,
}

/// Side effects an epoch event asks the caller to carry out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochUpdate {
    /// Outcome for the epoch the event was delivered to.
    pub outcome: FinishOutcome,
    /// Barrier acknowledgements to send, as `(barrier_nr, epoch_size)`.
    pub acks: Vec<(u32, u32)>,
    /// An epoch that needs [`EpochTracker::run_scheduled_flush`].
    pub schedule_flush: Option<EpochId>,
}

impl EpochUpdate {
    fn merge(&mut self, other: EpochUpdate) {
        self.acks.extend(other.acks);
        if other.schedule_flush.is_some() {
            self.schedule_flush = other.schedule_flush;
        }
    }
}

const EV_PUT: u8 = 1;
const EV_GOT_BARRIER_NR: u8 = 2;
const EV_BARRIER_DONE: u8 = 4;
const EV_BECAME_LAST: u8 = 8;
const EV_CLEANUP: u8 = 0x80;

#[derive(Debug, Clone)]
struct Epoch {
    id: EpochId,
    barrier_nr: u32,
    size: u32,
    active: u32,
    have_barrier_nr: bool,
    contains_barrier: bool,
    barrier_issued: bool,
    barrier_done: bool,
    finishing: bool,
}

impl Epoch {
    fn new(id: EpochId) -> Self {
        Self {
            id,
            barrier_nr: 0,
            size: 0,
            active: 0,
            have_barrier_nr: false,
            contains_barrier: false,
            barrier_issued: false,
            barrier_done: false,
            finishing: false,
        }
    }

    fn reset(&mut self) {
        *self = Epoch {
            active: self.active,
            ..Epoch::new(self.id)
        };
    }
}

#[derive(Debug)]
struct EpochList {
    epochs: VecDeque<Epoch>,
    next_id: u64,
    write_ordering: WriteOrdering,
    reissue_warned: bool,
}

impl EpochList {
    fn position(&self, id: EpochId) -> Option<usize> {
        self.epochs.iter().position(|e| e.id == id)
    }

    fn current_id(&self) -> EpochId {
        // the list is never empty
        self.epochs.back().map(|e| e.id).unwrap_or(EpochId(0))
    }

    fn push_new(&mut self) {
        let id = EpochId(self.next_id);
        self.next_id += 1;
        self.epochs.push_back(Epoch::new(id));
    }

    fn may_finish(&mut self, id: EpochId, mut ev: u8) -> EpochUpdate {
        let mut update = EpochUpdate::default();
        let mut id = id;
        let ordering = self.write_ordering;

        loop {
            let Some(idx) = self.position(id) else { break };
            let is_current = idx + 1 == self.epochs.len();
            let epoch = &mut self.epochs[idx];
            let mut next = None;
            let mut finish = false;

            match ev & !EV_CLEANUP {
                EV_PUT => epoch.active = epoch.active.saturating_sub(1),
                EV_GOT_BARRIER_NR => {
                    epoch.have_barrier_nr = true;
                    if epoch.contains_barrier
                        && epoch.size == 1
                        && ordering != WriteOrdering::Barrier
                        && is_current
                    {
                        epoch.contains_barrier = false;
                    }
                }
                EV_BARRIER_DONE => epoch.barrier_done = true,
                _ => {}
            }

            debug!(
                nr = epoch.barrier_nr,
                size = epoch.size,
                active = epoch.active,
                ev,
                "epoch event"
            );

            if epoch.size != 0
                && epoch.active == 0
                && epoch.have_barrier_nr
                && idx == 0
                && !epoch.finishing
            {
                if epoch.barrier_done
                    || ordering == WriteOrdering::None
                    || (epoch.size == 1 && epoch.contains_barrier)
                    || ev & EV_CLEANUP != 0
                {
                    finish = true;
                    epoch.finishing = true;
                } else if !epoch.barrier_issued && ordering == WriteOrdering::Barrier {
                    epoch.active += 1;
                    update.schedule_flush = Some(epoch.id);
                }
            }

            if finish {
                if ev & EV_CLEANUP == 0 {
                    update.acks.push((epoch.barrier_nr, epoch.size));
                }
                if !is_current {
                    next = self.epochs.get(idx + 1).map(|e| e.id);
                    let gone = self.epochs.remove(idx);
                    if let Some(gone) = gone {
                        debug!(nr = gone.barrier_nr, size = gone.size, "freeing epoch");
                    }
                    ev = EV_BECAME_LAST | (ev & EV_CLEANUP);
                    if update.outcome == FinishOutcome::StillLive {
                        update.outcome = FinishOutcome::Destroyed;
                    }
                } else {
                    epoch.reset();
                    if update.outcome == FinishOutcome::StillLive {
                        update.outcome = FinishOutcome::Recycled;
                    }
                }
            }

            match next {
                Some(n) => id = n,
                None => break,
            }
        }
        update
    }
}

/// Tracks receive-side epochs of one device.
#[derive(Debug)]
pub struct EpochTracker {
    inner: Mutex<EpochList>,
    max_epochs: usize,
}

impl Default for EpochTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EPOCHS)
    }
}

impl EpochTracker {
    /// Create a tracker allowing at most `max_epochs` live epochs.
    pub fn new(max_epochs: usize) -> Self {
        let mut list = EpochList {
            epochs: VecDeque::new(),
            next_id: 0,
            write_ordering: WriteOrdering::Barrier,
            reissue_warned: false,
        };
        list.push_new();
        Self {
            inner: Mutex::new(list),
            max_epochs: max_epochs.max(1),
        }
    }

    /// The epoch new writes join.
    pub fn current(&self) -> EpochId {
        self.inner.lock().current_id()
    }

    /// Number of live epochs, the current one included.
    pub fn len(&self) -> usize {
        self.inner.lock().epochs.len()
    }

    /// Always false; the current epoch exists at all times.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Size and active count of an epoch, if it is still live.
    pub fn epoch_counts(&self, id: EpochId) -> Option<(u32, u32)> {
        let inner = self.inner.lock();
        inner
            .position(id)
            .map(|idx| (inner.epochs[idx].size, inner.epochs[idx].active))
    }

    /// Method currently used to keep epochs in order.
    pub fn write_ordering(&self) -> WriteOrdering {
        self.inner.lock().write_ordering
    }

    /// Lower the write-ordering method to at most `wo`, skipping methods the
    /// disk configuration rules out. Never raises it.
    pub fn bump_write_ordering(&self, wo: WriteOrdering, disk: &DiskConfig) -> WriteOrdering {
        let mut inner = self.inner.lock();
        let pwo = inner.write_ordering;
        let mut wo = pwo.min(wo);
        if wo == WriteOrdering::Barrier && disk.no_disk_barrier {
            wo = WriteOrdering::Flush;
        }
        if wo == WriteOrdering::Flush && disk.no_disk_flush {
            wo = WriteOrdering::Drain;
        }
        if wo == WriteOrdering::Drain && disk.no_disk_drain {
            wo = WriteOrdering::None;
        }
        inner.write_ordering = wo;
        if pwo != wo || wo == WriteOrdering::Barrier {
            info!("Method to ensure write ordering: {}", wo.name());
        }
        wo
    }

    /// Reset to the strongest method the disk allows, e.g. after attaching.
    pub fn reset_write_ordering(&self, disk: &DiskConfig) -> WriteOrdering {
        self.inner.lock().write_ordering = WriteOrdering::Barrier;
        self.bump_write_ordering(WriteOrdering::Barrier, disk)
    }

    /// A replicated write joins the current epoch.
    ///
    /// With barrier ordering the first write of an epoch is submitted as a
    /// barrier, unless the previous epoch was a lone barrier write.
    pub fn note_write_added(&self) -> AddedWrite {
        let mut inner = self.inner.lock();
        let ordering = inner.write_ordering;
        let len = inner.epochs.len();
        let mut barrier = false;

        let first_in_epoch = match inner.epochs.back_mut() {
            Some(cur) => {
                cur.size += 1;
                cur.active += 1;
                cur.size == 1
            }
            None => false,
        };

        if ordering == WriteOrdering::Barrier && first_in_epoch {
            if len == 1 {
                barrier = true;
            } else {
                let prev = &mut inner.epochs[len - 2];
                if prev.size > 1 || !prev.contains_barrier {
                    prev.barrier_issued = true;
                    barrier = true;
                }
            }
            if barrier {
                if let Some(cur) = inner.epochs.back_mut() {
                    cur.contains_barrier = true;
                }
            }
        }

        AddedWrite {
            epoch: inner.current_id(),
            barrier,
        }
    }

    /// A write of epoch `id` completed locally.
    ///
    /// A completed barrier write also completes the previous epoch's barrier.
    pub fn note_write_completed(&self, id: EpochId, was_barrier: bool) -> EpochUpdate {
        let mut inner = self.inner.lock();
        let mut update = EpochUpdate::default();
        if was_barrier {
            if let Some(idx) = inner.position(id) {
                if idx > 0 {
                    let prev = inner.epochs[idx - 1].id;
                    update.merge(inner.may_finish(prev, EV_BARRIER_DONE));
                }
            }
        }
        let put = inner.may_finish(id, EV_PUT);
        update.outcome = put.outcome;
        update.merge(put);
        update
    }

    /// The downstream flush or drain for epoch `id` completed.
    pub fn note_flush_completed(&self, id: EpochId) -> EpochUpdate {
        self.inner.lock().may_finish(id, EV_BARRIER_DONE)
    }

    /// The peer closed the current epoch with barrier `nr`.
    pub fn note_barrier_marker_seen(&self, nr: u32) -> EpochUpdate {
        let mut inner = self.inner.lock();
        let cur = inner.current_id();
        if let Some(epoch) = inner.epochs.back_mut() {
            epoch.barrier_nr = nr;
        }
        inner.may_finish(cur, EV_GOT_BARRIER_NR)
    }

    /// Handle a Barrier packet: close the current epoch with `nr`, make its
    /// writes stable per the write-ordering method and open a new epoch.
    ///
    /// All writes of the epoch have been submitted synchronously by the time
    /// the barrier is processed, so draining needs no waiting.
    pub fn begin_epoch_on_barrier(
        &self,
        nr: u32,
        store: &dyn BlockStore,
        disk: &DiskConfig,
    ) -> EpochUpdate {
        let cur = self.current();
        let mut update = self.note_barrier_marker_seen(nr);

        match self.write_ordering() {
            WriteOrdering::None | WriteOrdering::Barrier => {
                if update.outcome == FinishOutcome::Recycled {
                    return update;
                }
            }
            WriteOrdering::Flush | WriteOrdering::Drain => {
                {
                    let mut inner = self.inner.lock();
                    if let Some(idx) = inner.position(cur) {
                        inner.epochs[idx].barrier_issued = true;
                    }
                }
                let flushed = self.flush_after_epoch(cur, store, disk);
                let outcome = flushed.outcome;
                update.merge(flushed);
                if outcome == FinishOutcome::Recycled {
                    update.outcome = outcome;
                    return update;
                }
            }
        }

        let mut inner = self.inner.lock();
        if inner.epochs.len() >= self.max_epochs {
            warn!("Allocation of an epoch failed, slowing down");
            let issue_flush = match inner.epochs.back_mut() {
                Some(e) => !std::mem::replace(&mut e.barrier_issued, true),
                None => false,
            };
            drop(inner);
            if issue_flush {
                let flushed = self.flush_after_epoch(cur, store, disk);
                update.outcome = flushed.outcome;
                update.merge(flushed);
            }
            return update;
        }

        let current_has_writes = inner.epochs.back().map(|e| e.size != 0).unwrap_or(false);
        if current_has_writes {
            inner.push_new();
            debug!(nr_epochs = inner.epochs.len(), "allocated epoch");
        }
        update
    }

    fn flush_after_epoch(&self, id: EpochId, store: &dyn BlockStore, disk: &DiskConfig) -> EpochUpdate {
        if self.write_ordering() >= WriteOrdering::Flush {
            if let Err(e) = store.flush() {
                error!(error = %e, "local disk flush failed");
                self.bump_write_ordering(WriteOrdering::Drain, disk);
            }
        }
        self.note_flush_completed(id)
    }

    /// Carry out a flush requested through [`EpochUpdate::schedule_flush`].
    pub fn run_scheduled_flush(
        &self,
        id: EpochId,
        store: &dyn BlockStore,
        disk: &DiskConfig,
        connected: bool,
    ) -> EpochUpdate {
        let issue = {
            let mut inner = self.inner.lock();
            match inner.position(id) {
                Some(idx) => !std::mem::replace(&mut inner.epochs[idx].barrier_issued, true),
                None => false,
            }
        };
        let mut update = EpochUpdate::default();
        if issue {
            update.merge(self.flush_after_epoch(id, store, disk));
        }
        let ev = if connected { EV_PUT } else { EV_PUT | EV_CLEANUP };
        let put = self.inner.lock().may_finish(id, ev);
        update.outcome = put.outcome;
        update.merge(put);
        update
    }

    /// The backing device rejected a barrier write of epoch `id`.
    ///
    /// Demotes write ordering to flush; the caller resubmits the write
    /// without the barrier flag.
    pub fn note_barrier_unsupported(&self, id: EpochId, disk: &DiskConfig) {
        {
            let mut inner = self.inner.lock();
            let has_previous = inner.position(id).map(|idx| idx > 0).unwrap_or(false);
            if has_previous && !inner.reissue_warned {
                inner.reissue_warned = true;
                warn!("Write ordering was not enforced (one time event)");
            }
        }
        self.bump_write_ordering(WriteOrdering::Flush, disk);
    }

    /// Finish every epoch without acknowledging it, after the connection
    /// was lost, and start over with an empty current epoch.
    pub fn cleanup(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut finished = 0;
        while let Some(front) = inner.epochs.front().map(|e| e.id) {
            let before = inner.epochs.len();
            let update = inner.may_finish(front, EV_BECAME_LAST | EV_CLEANUP);
            finished += before - inner.epochs.len();
            if update.outcome == FinishOutcome::Recycled {
                finished += 1;
            }
            if update.outcome != FinishOutcome::Destroyed {
                break;
            }
        }
        // writes that never saw their barrier are dropped with the epoch
        let keep = inner.epochs.pop_back();
        inner.epochs.clear();
        match keep {
            Some(mut e) => {
                e.active = 0;
                e.reset();
                inner.epochs.push_back(e);
            }
            None => inner.push_new(),
        }
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blkrepl_storage::MemStore;

    fn tracker(wo: WriteOrdering) -> EpochTracker {
        let t = EpochTracker::default();
        t.inner.lock().write_ordering = wo;
        t
    }

    #[test]
    fn test_no_ordering_single_write_recycles() {
        let t = tracker(WriteOrdering::None);
        let w = t.note_write_added();
        assert!(!w.barrier);
        assert_eq!(t.note_write_completed(w.epoch, false).outcome, FinishOutcome::StillLive);

        let upd = t.note_barrier_marker_seen(7);
        assert_eq!(upd.outcome, FinishOutcome::Recycled);
        assert_eq!(upd.acks, vec![(7, 1)]);
        assert_eq!(t.len(), 1);
        assert_eq!(t.epoch_counts(w.epoch), Some((0, 0)));
    }

    #[test]
    fn test_older_epoch_destroyed_when_last_write_completes() {
        let t = tracker(WriteOrdering::None);
        let store = MemStore::new(64);
        let disk = DiskConfig::default();
        let w = t.note_write_added();

        let upd = t.begin_epoch_on_barrier(5, &store, &disk);
        assert_eq!(upd.outcome, FinishOutcome::StillLive);
        assert!(upd.acks.is_empty());
        assert_eq!(t.len(), 2);
        assert_ne!(t.current(), w.epoch);

        let upd = t.note_write_completed(w.epoch, false);
        assert_eq!(upd.outcome, FinishOutcome::Destroyed);
        assert_eq!(upd.acks, vec![(5, 1)]);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_empty_epoch_never_finishes() {
        let t = tracker(WriteOrdering::None);
        let upd = t.note_barrier_marker_seen(3);
        assert_eq!(upd.outcome, FinishOutcome::StillLive);
        assert!(upd.acks.is_empty());
    }

    #[test]
    fn test_barrier_mode_first_write_is_barrier() {
        let t = tracker(WriteOrdering::Barrier);
        let store = MemStore::new(64);
        let disk = DiskConfig::default();

        let w = t.note_write_added();
        assert!(w.barrier);
        let w2 = t.note_write_added();
        assert!(!w2.barrier);
        t.note_write_completed(w.epoch, true);
        t.note_write_completed(w2.epoch, false);

        // two writes, barrier not yet confirmed by the next epoch
        let upd = t.begin_epoch_on_barrier(10, &store, &disk);
        assert!(upd.acks.is_empty());
        assert_eq!(upd.schedule_flush, Some(w.epoch));

        let upd = t.run_scheduled_flush(w.epoch, &store, &disk, true);
        assert_eq!(upd.acks, vec![(10, 2)]);
        assert_eq!(upd.outcome, FinishOutcome::Destroyed);
        assert_eq!(store.stats().flushes, 1);
    }

    #[test]
    fn test_barrier_write_in_next_epoch_finishes_previous() {
        let t = tracker(WriteOrdering::Barrier);
        let store = MemStore::new(64);
        let disk = DiskConfig::default();

        let a = t.note_write_added();
        let b = t.note_write_added();
        t.note_write_completed(a.epoch, true);
        t.note_write_completed(b.epoch, false);
        let upd = t.begin_epoch_on_barrier(1, &store, &disk);
        let first = a.epoch;
        assert_eq!(upd.schedule_flush, Some(first));

        // the barrier write of the next epoch arrives before the flush runs
        let c = t.note_write_added();
        assert!(c.barrier);
        let upd = t.note_write_completed(c.epoch, true);
        assert!(upd.acks.is_empty());

        // the scheduled flush is no longer needed, only its reference drops
        let upd = t.run_scheduled_flush(first, &store, &disk, true);
        assert_eq!(upd.acks, vec![(1, 2)]);
        assert_eq!(t.len(), 1);
        assert_eq!(store.stats().flushes, 0);
    }

    #[test]
    fn test_flush_mode_acks_after_flush() {
        let t = tracker(WriteOrdering::Flush);
        let store = MemStore::new(64);
        let disk = DiskConfig::default();
        let w = t.note_write_added();
        assert!(!w.barrier);
        t.note_write_completed(w.epoch, false);

        let upd = t.begin_epoch_on_barrier(9, &store, &disk);
        assert_eq!(upd.outcome, FinishOutcome::Recycled);
        assert_eq!(upd.acks, vec![(9, 1)]);
        assert_eq!(store.stats().flushes, 1);
    }

    #[test]
    fn test_flush_failure_demotes_to_drain() {
        let t = tracker(WriteOrdering::Flush);
        let store = MemStore::new(64).without_flush();
        let disk = DiskConfig::default();
        let w = t.note_write_added();
        t.note_write_completed(w.epoch, false);

        let upd = t.begin_epoch_on_barrier(2, &store, &disk);
        assert_eq!(upd.acks, vec![(2, 1)]);
        assert_eq!(t.write_ordering(), WriteOrdering::Drain);
    }

    #[test]
    fn test_bump_respects_disk_config() {
        let t = EpochTracker::default();
        let disk = DiskConfig {
            no_disk_barrier: true,
            no_disk_flush: true,
            ..DiskConfig::default()
        };
        assert_eq!(t.bump_write_ordering(WriteOrdering::Barrier, &disk), WriteOrdering::Drain);
        // never promotes
        assert_eq!(
            t.bump_write_ordering(WriteOrdering::Barrier, &DiskConfig::default()),
            WriteOrdering::Drain
        );
        assert_eq!(t.reset_write_ordering(&DiskConfig::default()), WriteOrdering::Barrier);
    }

    #[test]
    fn test_barrier_unsupported_demotes_to_flush() {
        let t = tracker(WriteOrdering::Barrier);
        let w = t.note_write_added();
        t.note_barrier_unsupported(w.epoch, &DiskConfig::default());
        assert_eq!(t.write_ordering(), WriteOrdering::Flush);
        let next = t.note_write_added();
        assert!(!next.barrier);
    }

    #[test]
    fn test_allocation_limit_flushes_inline() {
        let t = EpochTracker::new(1);
        t.inner.lock().write_ordering = WriteOrdering::Flush;
        let store = MemStore::new(64);
        let disk = DiskConfig::default();
        let w = t.note_write_added();
        // write still active: the epoch can not finish
        let upd = t.begin_epoch_on_barrier(4, &store, &disk);
        assert_eq!(upd.outcome, FinishOutcome::StillLive);
        assert_eq!(t.len(), 1);
        assert_eq!(store.stats().flushes, 1);
        let upd = t.note_write_completed(w.epoch, false);
        assert_eq!(upd.acks, vec![(4, 1)]);
    }

    #[test]
    fn test_cleanup_finishes_without_acks() {
        let t = tracker(WriteOrdering::None);
        let store = MemStore::new(64);
        let disk = DiskConfig::default();
        let a = t.note_write_added();
        t.begin_epoch_on_barrier(1, &store, &disk);
        let b = t.note_write_added();
        assert_ne!(a.epoch, b.epoch);
        assert_eq!(t.len(), 2);

        t.cleanup();
        assert_eq!(t.len(), 1);
        assert_eq!(t.epoch_counts(t.current()), Some((0, 0)));
    }
}
