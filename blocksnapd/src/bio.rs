//! Block request records.
//!
//! A [`Bio`] is the unit of traffic on the base device's submit path and on
//! the per-device work queues. It deliberately mirrors the shape of a block
//! layer request: a starting sector, a list of payload segments, a
//! pass-through marker and an optional completion the submitter can wait on.
//! Segments carry the inode of the file whose cache they came from, which is
//! how writes against the COW file itself are recognized and skipped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::queue::BioQueue;

pub const SECTOR_SIZE: u64 = 512;
pub const SECTORS_PER_BLOCK: u64 = crate::cow::COW_BLOCK_SIZE / SECTOR_SIZE;

/// Upper bound on read clones created for one traced write.
pub const MAX_CLONES_PER_BIO: usize = 10;

/// Largest span a single read clone may cover (256 block-sized pages).
pub const MAX_CLONE_BYTES: u64 = 256 * crate::cow::COW_BLOCK_SIZE;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BioKind {
    Read,
    Write,
    Discard,
}

pub struct BioSegment {
    pub buf: Vec<u8>,
    /// Inode backing this segment's memory, when it originates from a
    /// file's page cache. `None` for anonymous buffers.
    pub owner_inode: Option<u64>,
}

impl BioSegment {
    pub fn anon(buf: Vec<u8>) -> Self {
        Self {
            buf,
            owner_inode: None,
        }
    }

    pub fn owned_by(buf: Vec<u8>, inode: u64) -> Self {
        Self {
            buf,
            owner_inode: Some(inode),
        }
    }
}

pub struct Bio {
    pub kind: BioKind,
    pub sector: u64,
    pub segments: Vec<BioSegment>,
    /// Set by the dispatch worker on requests that were already traced;
    /// the interposer strips it and forwards to the original submit path.
    pub passthrough: bool,
    pub completion: Option<Arc<BioCompletion>>,
    /// Present on read clones only: the record tying the clone to its held
    /// original write. The COW worker drops the reference once the clone's
    /// capture has been accounted for.
    pub tracking: Option<Arc<TrackingParams>>,
}

impl Bio {
    pub fn read(sector: u64, len: usize) -> Self {
        Self {
            kind: BioKind::Read,
            sector,
            segments: vec![BioSegment::anon(vec![0u8; len])],
            passthrough: false,
            completion: None,
            tracking: None,
        }
    }

    pub fn write(sector: u64, data: Vec<u8>) -> Self {
        Self {
            kind: BioKind::Write,
            sector,
            segments: vec![BioSegment::anon(data)],
            passthrough: false,
            completion: None,
            tracking: None,
        }
    }

    /// Zero-fill write. Materialized as an anonymous zeroed payload so the
    /// tracing paths treat it like any other write.
    pub fn write_zeroes(sector: u64, len: usize) -> Self {
        Self::write(sector, vec![0u8; len])
    }

    pub fn discard(sector: u64) -> Self {
        Self {
            kind: BioKind::Discard,
            sector,
            segments: Vec::new(),
            passthrough: false,
            completion: None,
            tracking: None,
        }
    }

    pub fn with_completion(mut self, completion: Arc<BioCompletion>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn size(&self) -> u64 {
        self.segments.iter().map(|s| s.buf.len() as u64).sum()
    }

    pub fn sectors(&self) -> u64 {
        self.size() / SECTOR_SIZE
    }

    pub fn end_sector(&self) -> u64 {
        self.sector + self.sectors()
    }

    pub fn is_write(&self) -> bool {
        matches!(self.kind, BioKind::Write)
    }

    /// Deliver the finished request to whoever is waiting on it.
    pub fn finish(mut self, error: i32) {
        if let Some(completion) = self.completion.take() {
            completion.complete(error, Some(self));
        }
    }
}

impl Drop for Bio {
    fn drop(&mut self) {
        // A request dropped on an error path must not strand its waiter.
        if let Some(completion) = self.completion.take() {
            completion.complete(libc::EIO, None);
        }
    }
}

/// Completion slot for a submitted request. The submitter waits; whoever
/// finishes the request hands back the errno and the request itself so read
/// payloads survive the round trip.
pub struct BioCompletion {
    slot: Mutex<Option<(i32, Option<Bio>)>>,
    done: Condvar,
}

impl BioCompletion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            done: Condvar::new(),
        })
    }

    pub fn complete(&self, error: i32, bio: Option<Bio>) {
        let mut slot = self.slot.lock().unwrap();
        *slot = Some((error, bio));
        self.done.notify_all();
    }

    pub fn wait(&self) -> (i32, Option<Bio>) {
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = self.done.wait(slot).unwrap();
        }
    }
}

/// Ties a traced write to its read clones. The original request is held here
/// until every clone has completed and been queued for COW processing; the
/// last reference released hands the original to the dispatch queue.
pub struct TrackingParams {
    orig: Mutex<Option<Bio>>,
    refs: AtomicUsize,
    dispatch: Arc<BioQueue>,
}

impl TrackingParams {
    pub fn new(orig: Bio, dispatch: Arc<BioQueue>) -> Arc<Self> {
        Arc::new(Self {
            orig: Mutex::new(Some(orig)),
            refs: AtomicUsize::new(1),
            dispatch,
        })
    }

    pub fn get(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn put(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(orig) = self.orig.lock().unwrap().take() {
                self.dispatch.enqueue(orig);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_returns_payload() {
        let completion = BioCompletion::new();
        let bio = Bio::read(0, 4096).with_completion(Arc::clone(&completion));
        bio.finish(0);
        let (err, done) = completion.wait();
        assert_eq!(err, 0);
        assert_eq!(done.unwrap().size(), 4096);
    }

    #[test]
    fn dropped_bio_fails_its_waiter() {
        let completion = BioCompletion::new();
        let bio = Bio::read(0, 4096).with_completion(Arc::clone(&completion));
        drop(bio);
        let (err, done) = completion.wait();
        assert_eq!(err, libc::EIO);
        assert!(done.is_none());
    }

    #[test]
    fn tracking_params_release_original_exactly_once() {
        let dispatch = Arc::new(BioQueue::new());
        let tp = TrackingParams::new(Bio::write(8, vec![0u8; 4096]), Arc::clone(&dispatch));

        // Two clones in flight on top of the initial reference.
        tp.get();
        tp.get();

        tp.put();
        assert!(dispatch.dequeue().is_none());
        tp.put();
        assert!(dispatch.dequeue().is_none());

        tp.put();
        let orig = dispatch.dequeue().expect("original released on last put");
        assert_eq!(orig.sector, 8);
        assert!(dispatch.dequeue().is_none());
    }
}
