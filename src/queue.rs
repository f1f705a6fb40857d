//! Requests waiting for a tag, kept in C-LOOK order.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::scsi::{Srb, SrbFlags};

bitflags! {
    /// Independent reasons for the wait queue not to dispatch.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FreezeReason: u32 {
        /// Error recovery has the port stopped.
        const PAUSED = 1 << 0;
        /// A request failed; held until the class driver releases the queue.
        const SRB_ERROR = 1 << 1;
        /// The device has not been started yet.
        const NOT_STARTED = 1 << 2;
        /// Locked by the class driver.
        const LOCKED = 1 << 3;
        /// The device or channel is gone.
        const REMOVED = 1 << 4;
        /// A caller is draining the device.
        const DRAIN = 1 << 5;
    }
}

impl FreezeReason {
    /// Reasons that requests with `flags` are allowed to pass.
    pub fn bypassed_by(flags: SrbFlags) -> Self {
        let mut bypass = Self::empty();
        if flags.contains(SrbFlags::BYPASS_FROZEN_QUEUE) {
            bypass |= Self::SRB_ERROR;
        }
        if flags.contains(SrbFlags::BYPASS_LOCKED_QUEUE) {
            bypass |= Self::LOCKED;
        }
        bypass
    }
}

static NEXT_IRP_ID: AtomicU64 = AtomicU64::new(1);

/// An asynchronous I/O request carrying one SRB.
pub struct Irp {
    id: u64,
    srb: Mutex<Option<Srb>>,
    cancel_routine: AtomicBool,
    cancel: AtomicBool,
    done: AtomicBool,
}

impl Irp {
    pub fn new(srb: Srb) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_IRP_ID.fetch_add(1, Ordering::Relaxed),
            srb: Mutex::new(Some(srb)),
            cancel_routine: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            done: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Takes the completed SRB. `None` while the request is in flight.
    pub fn take_result(&self) -> Option<Srb> {
        if !self.is_complete() {
            return None;
        }
        self.srb.lock().take()
    }

    pub(crate) fn take_srb(&self) -> Option<Srb> {
        self.srb.lock().take()
    }

    /// Hands the SRB back to a request that goes back to the wait queue.
    pub(crate) fn restore_srb(&self, srb: Srb) {
        *self.srb.lock() = Some(srb);
    }

    pub(crate) fn sort_key_and_flags(&self) -> (u64, SrbFlags) {
        self.srb
            .lock()
            .as_ref()
            .map_or((0, SrbFlags::empty()), |srb| (srb.sort_key, srb.flags))
    }

    pub(crate) fn complete(&self, srb: Srb) {
        *self.srb.lock() = Some(srb);
        let twice = self.done.swap(true, Ordering::AcqRel);
        debug_assert!(!twice, "IRP {} completed twice", self.id);
    }

    /// Installs the cancel routine. Returns `false` when the request was
    /// cancelled before that and the caller got the routine back, which
    /// makes the caller responsible for completing it.
    pub(crate) fn set_cancel_routine(&self) -> bool {
        self.cancel_routine.store(true, Ordering::Release);
        !(self.cancel.load(Ordering::Acquire) && self.clear_cancel_routine())
    }

    /// Removes the cancel routine. Whoever gets `true` owns the request;
    /// `false` means the cancel side already took it.
    pub(crate) fn clear_cancel_routine(&self) -> bool {
        self.cancel_routine.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }
}

pub(crate) struct QueueEntry {
    pub sort_key: u64,
    pub flags: SrbFlags,
    pub irp: Arc<Irp>,
}

impl QueueEntry {
    pub fn new(irp: Arc<Irp>) -> Self {
        let (sort_key, flags) = irp.sort_key_and_flags();
        Self {
            sort_key,
            flags,
            irp,
        }
    }
}

/// Ascending list of waiting requests with a sweep cursor.
#[derive(Default)]
pub(crate) struct WaitQueue {
    entries: Vec<QueueEntry>,
    cursor: u64,
}

impl WaitQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts before the first entry with a greater key; equal keys stay
    /// in arrival order.
    pub fn insert(&mut self, entry: QueueEntry) {
        let pos = self
            .entries
            .iter()
            .position(|e| e.sort_key > entry.sort_key)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }

    /// Next entry at or after the cursor, wrapping to the lowest key once
    /// the sweep reaches the end.
    pub fn pop_next(&mut self, eligible: impl Fn(&QueueEntry) -> bool) -> Option<QueueEntry> {
        let cursor = self.cursor;
        let pos = self
            .entries
            .iter()
            .position(|e| e.sort_key >= cursor && eligible(e))
            .or_else(|| self.entries.iter().position(&eligible))?;
        let entry = self.entries.remove(pos);
        self.cursor = entry.sort_key;
        Some(entry)
    }

    pub fn remove(&mut self, irp_id: u64) -> Option<QueueEntry> {
        let pos = self.entries.iter().position(|e| e.irp.id() == irp_id)?;
        Some(self.entries.remove(pos))
    }

    pub fn drain(&mut self) -> Vec<QueueEntry> {
        core::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: u64) -> QueueEntry {
        let mut srb = Srb::new(crate::scsi::SrbFunction::ExecuteScsi);
        srb.sort_key = key;
        QueueEntry::new(Irp::new(srb))
    }

    fn drain_keys(queue: &mut WaitQueue) -> Vec<u64> {
        core::iter::from_fn(|| queue.pop_next(|_| true))
            .map(|e| e.sort_key)
            .collect()
    }

    #[test]
    fn increasing_keys_drain_in_order() {
        let mut queue = WaitQueue::default();
        for key in [10, 20, 30, 40] {
            queue.insert(entry(key));
        }
        assert_eq!(drain_keys(&mut queue), [10, 20, 30, 40]);
    }

    #[test]
    fn reverse_insertion_drains_ascending() {
        let mut queue = WaitQueue::default();
        for key in [40, 30, 20, 10] {
            queue.insert(entry(key));
        }
        assert_eq!(drain_keys(&mut queue), [10, 20, 30, 40]);
    }

    #[test]
    fn sweep_continues_from_cursor_then_wraps() {
        let mut queue = WaitQueue::default();
        for key in [100, 200, 300] {
            queue.insert(entry(key));
        }
        assert_eq!(queue.pop_next(|_| true).unwrap().sort_key, 100);
        assert_eq!(queue.pop_next(|_| true).unwrap().sort_key, 200);
        // Arrives behind the head while the sweep is moving up.
        queue.insert(entry(50));
        queue.insert(entry(250));
        assert_eq!(drain_keys(&mut queue), [250, 300, 50]);
    }

    #[test]
    fn equal_keys_are_fifo_and_removal_by_id() {
        let mut queue = WaitQueue::default();
        let first = entry(5);
        let first_id = first.irp.id();
        let second = entry(5);
        let second_id = second.irp.id();
        queue.insert(first);
        queue.insert(second);
        queue.insert(entry(1));
        assert!(queue.remove(first_id).is_some());
        assert!(queue.remove(first_id).is_none());
        assert_eq!(queue.pop_next(|_| true).unwrap().sort_key, 1);
        assert_eq!(queue.pop_next(|_| true).unwrap().irp.id(), second_id);
        assert!(queue.is_empty());
    }

    #[test]
    fn ineligible_entries_are_skipped() {
        let mut queue = WaitQueue::default();
        queue.insert(entry(1));
        queue.insert(entry(2));
        let picked = queue.pop_next(|e| e.sort_key == 2).unwrap();
        assert_eq!(picked.sort_key, 2);
        assert_eq!(queue.len(), 1);
        assert!(queue.pop_next(|e| e.sort_key == 2).is_none());
    }

    #[test]
    fn cancel_routine_ownership_is_exclusive() {
        let irp = Irp::new(Srb::new(crate::scsi::SrbFunction::ExecuteScsi));
        assert!(irp.set_cancel_routine());
        irp.request_cancel();
        assert!(irp.clear_cancel_routine());
        assert!(!irp.clear_cancel_routine());

        // Cancelled before the routine was installed.
        let early = Irp::new(Srb::new(crate::scsi::SrbFunction::ExecuteScsi));
        early.request_cancel();
        assert!(!early.set_cancel_routine());
        assert!(!early.clear_cancel_routine());
    }
}
