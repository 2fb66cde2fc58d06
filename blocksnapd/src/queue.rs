//! Work queues shared between the interposer and the per-device workers.
//!
//! Both queues are unbounded FIFOs guarded by a mutex with a paired condvar.
//! Enqueue wakes one waiter. The COW worker dequeues through
//! [`BioQueue::dequeue_delay_read`], which lets a queued write that overlaps
//! the front read overtake it, so a snapshot read never observes sectors
//! whose preserved contents have not reached the COW file yet.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::bio::Bio;

pub struct BioQueue {
    bios: Mutex<VecDeque<Bio>>,
    event: Condvar,
}

fn bios_overlap(a: &Bio, b: &Bio) -> bool {
    a.sector.max(b.sector) <= a.end_sector().min(b.end_sector())
}

impl BioQueue {
    pub fn new() -> Self {
        Self {
            bios: Mutex::new(VecDeque::new()),
            event: Condvar::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bios.lock().unwrap().is_empty()
    }

    pub fn enqueue(&self, bio: Bio) {
        self.bios.lock().unwrap().push_back(bio);
        self.event.notify_one();
    }

    pub fn dequeue(&self) -> Option<Bio> {
        self.bios.lock().unwrap().pop_front()
    }

    /// Dequeue for the COW worker: if the front entry is a read that
    /// overlaps a write queued behind it, hand out that write first and
    /// leave the read in the write's position.
    pub fn dequeue_delay_read(&self) -> Option<Bio> {
        let mut bios = self.bios.lock().unwrap();
        let bio = bios.pop_front()?;
        if !bio.is_write() {
            if let Some(idx) = bios
                .iter()
                .position(|queued| queued.is_write() && bios_overlap(&bio, queued))
            {
                let write = bios.remove(idx).unwrap();
                bios.insert(idx, bio);
                return Some(write);
            }
        }
        Some(bio)
    }

    /// Park until the queue has work or `should_stop` reports true.
    pub fn wait(&self, should_stop: impl Fn() -> bool) {
        let mut bios = self.bios.lock().unwrap();
        while bios.is_empty() && !should_stop() {
            bios = self.event.wait(bios).unwrap();
        }
    }

    /// Wake every waiter. Callers flip their stop flag first; taking the
    /// queue lock here closes the window between the flag check and the
    /// condvar wait.
    pub fn wake_all(&self) {
        let _bios = self.bios.lock().unwrap();
        self.event.notify_all();
    }
}

/// A run of changed sectors recorded in incremental mode, relative to the
/// start of the tracked device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectorSet {
    pub sect: u64,
    pub len: u64,
}

pub struct SsetQueue {
    ssets: Mutex<VecDeque<SectorSet>>,
    event: Condvar,
}

impl SsetQueue {
    pub fn new() -> Self {
        Self {
            ssets: Mutex::new(VecDeque::new()),
            event: Condvar::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ssets.lock().unwrap().is_empty()
    }

    pub fn enqueue(&self, sset: SectorSet) {
        self.ssets.lock().unwrap().push_back(sset);
        self.event.notify_one();
    }

    pub fn dequeue(&self) -> Option<SectorSet> {
        self.ssets.lock().unwrap().pop_front()
    }

    pub fn wait(&self, should_stop: impl Fn() -> bool) {
        let mut ssets = self.ssets.lock().unwrap();
        while ssets.is_empty() && !should_stop() {
            ssets = self.event.wait(ssets).unwrap();
        }
    }

    pub fn wake_all(&self) {
        let _ssets = self.ssets.lock().unwrap();
        self.event.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let queue = BioQueue::new();
        queue.enqueue(Bio::write(0, vec![0u8; 512]));
        queue.enqueue(Bio::write(8, vec![0u8; 512]));
        assert_eq!(queue.dequeue().unwrap().sector, 0);
        assert_eq!(queue.dequeue().unwrap().sector, 8);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn overlapping_write_overtakes_read() {
        let queue = BioQueue::new();
        queue.enqueue(Bio::read(0, 4096));
        queue.enqueue(Bio::write(4, vec![0u8; 4096]));

        let first = queue.dequeue_delay_read().unwrap();
        assert!(first.is_write());
        let second = queue.dequeue_delay_read().unwrap();
        assert!(!second.is_write());
        assert!(queue.dequeue_delay_read().is_none());
    }

    #[test]
    fn non_overlapping_write_does_not_overtake() {
        let queue = BioQueue::new();
        queue.enqueue(Bio::read(0, 4096));
        queue.enqueue(Bio::write(64, vec![0u8; 4096]));

        let first = queue.dequeue_delay_read().unwrap();
        assert!(!first.is_write());
        assert_eq!(first.sector, 0);
    }

    #[test]
    fn delayed_read_keeps_queue_position() {
        let queue = BioQueue::new();
        queue.enqueue(Bio::read(0, 4096));
        queue.enqueue(Bio::write(100, vec![0u8; 512]));
        queue.enqueue(Bio::write(2, vec![0u8; 4096]));
        queue.enqueue(Bio::write(200, vec![0u8; 512]));

        // The read swaps with the first overlapping write, not the head.
        let first = queue.dequeue_delay_read().unwrap();
        assert_eq!(first.sector, 2);
        let second = queue.dequeue_delay_read().unwrap();
        assert_eq!(second.sector, 100);
        let third = queue.dequeue_delay_read().unwrap();
        assert_eq!(third.sector, 0);
        let fourth = queue.dequeue_delay_read().unwrap();
        assert_eq!(fourth.sector, 200);
    }
}
