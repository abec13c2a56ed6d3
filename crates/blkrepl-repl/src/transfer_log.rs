//! Send-side transfer log.
//!
//! Every write replicated to the peer is recorded under the barrier that
//! was open when it was sent. The peer acknowledges barriers in the order
//! they were sent, stating how many writes it saw in the epoch; only then
//! may the entries be forgotten. On connection loss the writes the peer
//! has not confirmed as written are reported so the caller can mark them
//! out of sync.

use std::collections::VecDeque;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{ReplError, ReplResult};

/// Barrier number the log starts with.
pub const INITIAL_BARRIER_NR: u32 = 4711;

/// How a replicated write ended from the application's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The peer acknowledged the write.
    Replicated,
    /// The write only reached the local disk; its range is out of sync.
    LocalOnly,
}

/// Acknowledgement received for a logged write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAck {
    /// The peer received the data (protocol B).
    Received,
    /// The peer wrote the data (protocol C).
    Written,
    /// The peer failed to write the data.
    Failed,
}

#[derive(Debug)]
struct LoggedWrite {
    id: u64,
    sector: u64,
    size: u32,
    written: bool,
    done: Option<oneshot::Sender<WriteOutcome>>,
}

impl LoggedWrite {
    /// Someone still waits for the peer's answer.
    fn is_waiting(&self) -> bool {
        self.done.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    fn complete(&mut self, outcome: WriteOutcome) {
        if let Some(tx) = self.done.take() {
            // the submitter may have given up waiting
            let _ = tx.send(outcome);
        }
    }
}

#[derive(Debug)]
struct TlBarrier {
    nr: u32,
    n_req: u32,
    requests: Vec<LoggedWrite>,
}

impl TlBarrier {
    fn new(nr: u32) -> Self {
        Self {
            nr,
            n_req: 0,
            requests: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct TlInner {
    barriers: VecDeque<TlBarrier>,
    out_of_sequence: Vec<LoggedWrite>,
}

impl TlInner {
    fn newest(&mut self) -> &mut TlBarrier {
        if self.barriers.is_empty() {
            self.barriers.push_back(TlBarrier::new(INITIAL_BARRIER_NR));
        }
        let last = self.barriers.len() - 1;
        &mut self.barriers[last]
    }

    fn find(&mut self, id: u64) -> Option<&mut LoggedWrite> {
        self.barriers
            .iter_mut()
            .flat_map(|b| b.requests.iter_mut())
            .chain(self.out_of_sequence.iter_mut())
            .find(|w| w.id == id)
    }
}

fn next_nr(nr: u32) -> u32 {
    match nr.wrapping_add(1) {
        0 => 1,
        n => n,
    }
}

/// Ordered log of replicated writes grouped by barrier.
#[derive(Debug)]
pub struct TransferLog {
    inner: Mutex<TlInner>,
}

impl Default for TransferLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferLog {
    /// Create a log with one open barrier.
    pub fn new() -> Self {
        let mut barriers = VecDeque::new();
        barriers.push_back(TlBarrier::new(INITIAL_BARRIER_NR));
        Self {
            inner: Mutex::new(TlInner {
                barriers,
                out_of_sequence: Vec::new(),
            }),
        }
    }

    /// Number of the barrier new writes are logged under.
    pub fn current_barrier(&self) -> u32 {
        self.inner.lock().newest().nr
    }

    /// Writes logged under the open barrier.
    pub fn current_count(&self) -> u32 {
        self.inner.lock().newest().n_req
    }

    /// Barriers not yet acknowledged, the open one included.
    pub fn barrier_count(&self) -> usize {
        self.inner.lock().barriers.len()
    }

    /// Writes still in the log.
    pub fn pending_requests(&self) -> usize {
        let inner = self.inner.lock();
        inner.barriers.iter().map(|b| b.requests.len()).sum::<usize>() + inner.out_of_sequence.len()
    }

    /// Log a write under the open barrier.
    ///
    /// The receiver resolves once the peer acknowledged the write or the
    /// connection was lost.
    pub fn append_request(&self, id: u64, sector: u64, size: u32) -> (u32, oneshot::Receiver<WriteOutcome>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        let b = inner.newest();
        b.n_req += 1;
        b.requests.push(LoggedWrite {
            id,
            sector,
            size,
            written: false,
            done: Some(tx),
        });
        (b.nr, rx)
    }

    /// Close the open barrier and open the next one.
    ///
    /// Returns the number of the closed barrier, to be sent to the peer, or
    /// `None` when no write was logged under it.
    pub fn add_barrier(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        let newest = inner.newest();
        if newest.n_req == 0 {
            return None;
        }
        let closed = newest.nr;
        inner.barriers.push_back(TlBarrier::new(next_nr(closed)));
        debug!(barrier = closed, "barrier closed");
        Some(closed)
    }

    /// Record an acknowledgement for write `id`.
    ///
    /// Returns the range of a failed write so the caller can mark it out
    /// of sync.
    pub fn ack_request(&self, id: u64, ack: PeerAck) -> Option<(u64, u32)> {
        let mut inner = self.inner.lock();
        let w = inner.find(id)?;
        match ack {
            PeerAck::Received => {
                w.complete(WriteOutcome::Replicated);
                None
            }
            PeerAck::Written => {
                w.written = true;
                w.complete(WriteOutcome::Replicated);
                None
            }
            PeerAck::Failed => {
                w.complete(WriteOutcome::LocalOnly);
                Some((w.sector, w.size))
            }
        }
    }

    /// Handle a barrier acknowledgement.
    ///
    /// `barrier_nr` must be the oldest barrier and `set_size` the number
    /// of writes logged under it. A mismatch is a peer protocol violation;
    /// the caller forces the connection into `ProtocolError`.
    pub fn release_barrier(&self, barrier_nr: u32, set_size: u32) -> ReplResult<()> {
        let mut inner = self.inner.lock();
        let Some(oldest) = inner.barriers.front() else {
            let msg = format!("BAD! BarrierAck #{barrier_nr} received, but no epoch in tl!?");
            error!("{msg}");
            return Err(ReplError::protocol(msg));
        };
        if oldest.nr != barrier_nr {
            let msg = format!(
                "BAD! BarrierAck #{barrier_nr} received, expected #{}!",
                oldest.nr
            );
            error!("{msg}");
            return Err(ReplError::protocol(msg));
        }
        if oldest.n_req != set_size {
            let msg = format!(
                "BAD! BarrierAck #{barrier_nr} received with n_req={set_size}, expected n_req={}!",
                oldest.n_req
            );
            error!("{msg}");
            return Err(ReplError::protocol(msg));
        }

        if inner.barriers.len() == 1 {
            inner.barriers.push_back(TlBarrier::new(next_nr(barrier_nr)));
        }
        if let Some(b) = inner.barriers.pop_front() {
            // an ack that overtook the write acks keeps the write findable
            let waiting = b.requests.into_iter().filter(LoggedWrite::is_waiting);
            inner.out_of_sequence.extend(waiting);
        }
        inner.out_of_sequence.retain(LoggedWrite::is_waiting);
        debug!(barrier = barrier_nr, set_size, "barrier released");
        Ok(())
    }

    /// Fail every logged write after the connection was lost.
    ///
    /// Writes the peer did not confirm as written are returned as
    /// `(sector, size)` ranges to be marked out of sync. The log restarts
    /// with a single barrier at a random number.
    pub fn clear_all(&self) -> Vec<(u64, u32)> {
        let mut inner = self.inner.lock();
        let mut out_of_sync = Vec::new();
        let barriers = std::mem::take(&mut inner.barriers);
        let oos = std::mem::take(&mut inner.out_of_sequence);
        for mut w in barriers.into_iter().flat_map(|b| b.requests).chain(oos) {
            if w.written {
                w.complete(WriteOutcome::Replicated);
            } else {
                w.complete(WriteOutcome::LocalOnly);
                out_of_sync.push((w.sector, w.size));
            }
        }
        let initial = match rand::thread_rng().gen::<u32>() {
            0 => 1,
            n => n,
        };
        inner.barriers.push_back(TlBarrier::new(initial));
        out_of_sync
    }
}
