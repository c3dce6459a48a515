//! Fixed table of worker slots
//!
//! A slot is a stable position in the pool whose worker handle is swapped
//! out on restart. Its [`SlotState`] lives in a watch channel, so the state
//! doubles as the readiness signal callers wait on while a restart runs.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::worker::Worker;

/// Lifecycle of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Holds a worker that accepts jobs
    Ready,
    /// A replacement is being provisioned; not selectable
    Restarting,
    /// No usable worker: never provisioned or the last restart failed
    Degraded,
}

/// Point-in-time view of one slot
#[derive(Debug, Clone, Serialize)]
pub struct SlotStats {
    pub index: usize,
    pub worker_id: Option<String>,
    pub state: SlotState,
    pub alive: bool,
    pub in_flight: usize,
    /// Workers installed after the first
    pub restarts: u64,
    pub jobs_completed: u64,
}

pub struct WorkerSlot<W: Worker> {
    index: usize,
    handle: RwLock<Option<Arc<W>>>,
    state: watch::Sender<SlotState>,
    in_flight: watch::Sender<usize>,
    generation: AtomicU64,
    started: AtomicU64,
    jobs_completed: AtomicU64,
}

impl<W: Worker> WorkerSlot<W> {
    pub fn new(index: usize) -> Self {
        let (state, _) = watch::channel(SlotState::Degraded);
        let (in_flight, _) = watch::channel(0);
        Self {
            index,
            handle: RwLock::new(None),
            state,
            in_flight,
            generation: AtomicU64::new(0),
            started: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SlotState {
        *self.state.borrow()
    }

    pub fn handle(&self) -> Option<Arc<W>> {
        self.handle.read().clone()
    }

    /// Whether `worker` is the handle this slot currently holds
    pub fn holds(&self, worker: &Arc<W>) -> bool {
        self.handle
            .read()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, worker))
    }

    /// In `Ready` state; the worker may still have died since
    pub fn is_selectable(&self) -> bool {
        self.state() == SlotState::Ready
    }

    /// Selectable and backed by a live worker
    pub fn is_available(&self) -> bool {
        self.is_selectable()
            && self
                .handle
                .read()
                .as_ref()
                .is_some_and(|worker| worker.is_alive())
    }

    /// Enter `Restarting`. Returns `None` if a restart is already running;
    /// the caller should wait for that one instead of starting another.
    pub fn begin_restart(&self) -> Option<RestartGuard<'_, W>> {
        let started = self.state.send_if_modified(|state| {
            if *state == SlotState::Restarting {
                false
            } else {
                *state = SlotState::Restarting;
                true
            }
        });
        started.then(|| RestartGuard {
            slot: self,
            finished: false,
        })
    }

    /// Remove the current handle. Requests already holding it keep it alive.
    pub fn take_handle(&self) -> Option<Arc<W>> {
        self.handle.write().take()
    }

    /// Id for the next worker provisioned into this slot
    pub fn next_worker_id(&self) -> String {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        format!("worker-{}-{}", self.index, generation)
    }

    /// Wait until the slot leaves `Restarting`, for at most `timeout`.
    /// Returns whether the slot ended up `Ready`.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut state = self.state.subscribe();
        let settled = tokio::time::timeout(timeout, async {
            let _ = state
                .wait_for(|state| *state != SlotState::Restarting)
                .await;
        })
        .await;
        settled.is_ok() && self.is_selectable()
    }

    pub fn begin_request(&self) -> InFlightGuard<'_, W> {
        self.in_flight.send_modify(|count| *count += 1);
        InFlightGuard { slot: self }
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait for every request routed through this slot to settle
    pub async fn wait_idle(&self) {
        let mut in_flight = self.in_flight.subscribe();
        let _ = in_flight.wait_for(|count| *count == 0).await;
    }

    pub fn record_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SlotStats {
        let handle = self.handle();
        SlotStats {
            index: self.index,
            worker_id: handle.as_ref().map(|worker| worker.id().to_string()),
            state: self.state(),
            alive: handle.as_ref().is_some_and(|worker| worker.is_alive()),
            in_flight: self.in_flight(),
            restarts: self.started.load(Ordering::Relaxed).saturating_sub(1),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive right to replace a slot's worker.
///
/// Dropping the guard without finishing leaves the slot `Degraded`, so a
/// cancelled or panicking restart never wedges the slot in `Restarting`.
pub struct RestartGuard<'a, W: Worker> {
    slot: &'a WorkerSlot<W>,
    finished: bool,
}

impl<W: Worker> RestartGuard<'_, W> {
    /// Install the replacement and reopen the slot
    pub fn complete(mut self, worker: W) {
        *self.slot.handle.write() = Some(Arc::new(worker));
        self.slot.started.fetch_add(1, Ordering::Relaxed);
        self.finished = true;
        self.slot.state.send_replace(SlotState::Ready);
    }

    /// Leave the current worker in place and reopen the slot
    pub fn release(mut self) {
        self.finished = true;
        self.slot.state.send_replace(SlotState::Ready);
    }

    /// Give up; the slot stays unselectable until the next restart
    pub fn fail(mut self) {
        self.finished = true;
        self.slot.state.send_replace(SlotState::Degraded);
    }
}

impl<W: Worker> Drop for RestartGuard<'_, W> {
    fn drop(&mut self) {
        if !self.finished {
            self.slot.state.send_replace(SlotState::Degraded);
        }
    }
}

/// Counts a request against its slot until dropped
pub struct InFlightGuard<'a, W: Worker> {
    slot: &'a WorkerSlot<W>,
}

impl<W: Worker> Drop for InFlightGuard<'_, W> {
    fn drop(&mut self) {
        self.slot
            .in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// The pool's slots, fixed in number for the pool's lifetime
pub struct SlotTable<W: Worker> {
    slots: Vec<Arc<WorkerSlot<W>>>,
}

impl<W: Worker> SlotTable<W> {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|index| Arc::new(WorkerSlot::new(index))).collect(),
        }
    }

    /// Slot at `index`, which must be below [`len`](Self::len)
    pub fn get(&self, index: usize) -> &Arc<WorkerSlot<W>> {
        &self.slots[index]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<WorkerSlot<W>>> {
        self.slots.iter()
    }
}
