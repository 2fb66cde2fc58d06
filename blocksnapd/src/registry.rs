//! Process-wide tracer registry.
//!
//! A fixed table of slots indexed by minor number. The interposer's
//! find-by-device scan walks the populated minor range under short read
//! locks and re-checks the UNVERIFIED bit after lookup, tolerating
//! concurrent slot mutation. Structural changes serialize on the control
//! mutex and recalculate the populated range, which keeps the hot-path
//! scan bounded.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::bdev::BdevId;
use crate::config::EngineConfig;
use crate::tracer::Tracer;

pub struct Registry {
    slots: Box<[RwLock<Option<Arc<Tracer>>>]>,
    lowest_minor: AtomicU32,
    highest_minor: AtomicU32,
    control: Mutex<()>,
    config: EngineConfig,
}

impl Registry {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let max = config.max_snap_devices;
        let slots = (0..max).map(|_| RwLock::new(None)).collect();
        Arc::new(Self {
            slots,
            lowest_minor: AtomicU32::new(max - 1),
            highest_minor: AtomicU32::new(0),
            control: Mutex::new(()),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn max_devices(&self) -> u32 {
        self.slots.len() as u32
    }

    /// The global control mutex. Every control operation and mount-driven
    /// transition runs with this held.
    pub fn lock_control(&self) -> MutexGuard<'_, ()> {
        self.control.lock().unwrap()
    }

    pub fn get(&self, minor: u32) -> Option<Arc<Tracer>> {
        self.slots
            .get(minor as usize)?
            .read()
            .unwrap()
            .as_ref()
            .cloned()
    }

    pub fn insert(&self, minor: u32, tracer: Arc<Tracer>) {
        *self.slots[minor as usize].write().unwrap() = Some(tracer);
        self.minor_range_include(minor);
    }

    /// Clear the slot only if it still holds `tracer`; transitions replace
    /// slots in place and the retired generation must not evict its heir.
    pub fn remove_if_same(&self, minor: u32, tracer: &Tracer) {
        {
            let mut slot = self.slots[minor as usize].write().unwrap();
            match slot.as_ref() {
                Some(current) if std::ptr::eq(Arc::as_ptr(current), tracer) => *slot = None,
                _ => return,
            }
        }
        self.minor_range_recalculate();
    }

    fn minor_range_include(&self, minor: u32) {
        if minor < self.lowest_minor.load(Ordering::Acquire) {
            self.lowest_minor.store(minor, Ordering::Release);
        }
        if minor > self.highest_minor.load(Ordering::Acquire) {
            self.highest_minor.store(minor, Ordering::Release);
        }
    }

    fn minor_range_recalculate(&self) {
        let mut lowest = self.max_devices() - 1;
        let mut highest = 0;
        for minor in 0..self.max_devices() {
            if self.slots[minor as usize].read().unwrap().is_some() {
                if minor < lowest {
                    lowest = minor;
                }
                if minor > highest {
                    highest = minor;
                }
            }
        }
        self.lowest_minor.store(lowest, Ordering::Release);
        self.highest_minor.store(highest, Ordering::Release);
    }

    /// Interposer lookup: the tracer whose base device matches, skipping
    /// unverified entries. The bit is re-checked on the tracer returned by
    /// the slot read since a transition may have raced the scan.
    pub fn find_by_bdev(&self, id: BdevId) -> Option<Arc<Tracer>> {
        let lowest = self.lowest_minor.load(Ordering::Acquire);
        let highest = self.highest_minor.load(Ordering::Acquire);
        for minor in lowest..=highest.min(self.max_devices() - 1) {
            let Some(tracer) = self.slots[minor as usize].read().unwrap().as_ref().cloned()
            else {
                continue;
            };
            if tracer.is_unverified() {
                continue;
            }
            if tracer.bdev_id() == Some(id) {
                if tracer.is_unverified() {
                    return None;
                }
                return Some(tracer);
            }
        }
        None
    }

    pub fn bdev_already_traced(&self, id: BdevId) -> bool {
        self.find_by_bdev(id).is_some()
    }

    /// Smallest unused minor, scanning the whole table.
    pub fn free_minor(&self) -> Option<u32> {
        (0..self.max_devices()).find(|m| self.slots[*m as usize].read().unwrap().is_none())
    }

    /// Snapshot of every registered tracer, lowest minor first.
    pub fn tracers(&self) -> Vec<Arc<Tracer>> {
        (0..self.max_devices())
            .filter_map(|m| self.slots[m as usize].read().unwrap().as_ref().cloned())
            .collect()
    }

    /// Registered tracers within the populated minor range, for the
    /// mount-event scans.
    pub fn tracers_in_range(&self) -> Vec<Arc<Tracer>> {
        let lowest = self.lowest_minor.load(Ordering::Acquire);
        let highest = self.highest_minor.load(Ordering::Acquire);
        (lowest..=highest.min(self.max_devices() - 1))
            .filter_map(|m| self.slots[m as usize].read().unwrap().as_ref().cloned())
            .collect()
    }
}
