//! The virtual read-only snapshot device.
//!
//! Presents the point-in-time view of a tracked device as `<prefix><minor>`.
//! The device holds no reference to its tracer; it stores only the minor
//! and resolves the current controller through the registry on every
//! request, tolerating a slot that changed hands or went away.

use std::io;
use std::sync::{Arc, Weak};

use crate::bio::{Bio, BioCompletion, SECTOR_SIZE};
use crate::errno::errno;
use crate::registry::Registry;
use crate::tracer::Tracer;

pub struct SnapshotDevice {
    registry: Weak<Registry>,
    minor: u32,
    name: String,
    sectors: u64,
}

/// Open-handle guard; the tracer counts these to refuse destructive
/// operations while a consumer holds the device.
pub struct SnapshotHandle {
    registry: Weak<Registry>,
    minor: u32,
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        if let Some(tracer) = self.registry.upgrade().and_then(|r| r.get(self.minor)) {
            tracer.close_ref();
        }
    }
}

impl SnapshotDevice {
    pub(crate) fn new(registry: Weak<Registry>, minor: u32, name: String, sectors: u64) -> Self {
        Self {
            registry,
            minor,
            name,
            sectors,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Size reported to consumers, in sectors.
    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    fn tracer(&self) -> io::Result<Arc<Tracer>> {
        self.registry
            .upgrade()
            .and_then(|r| r.get(self.minor))
            .ok_or_else(|| errno(libc::ENODEV))
    }

    pub fn open(&self) -> io::Result<SnapshotHandle> {
        let tracer = self.tracer()?;
        tracer.open_ref();
        Ok(SnapshotHandle {
            registry: self.registry.clone(),
            minor: self.minor,
        })
    }

    /// Read `len` bytes starting at `sector` out of the snapshot view. The
    /// request is handed to the COW worker and reconstructed from the live
    /// device and the COW file.
    pub fn read(&self, sector: u64, len: usize) -> io::Result<Vec<u8>> {
        let tracer = self.tracer()?;

        if tracer.read_fail_state() != 0 {
            return Err(errno(libc::EIO));
        }
        if !tracer.is_active() || !tracer.is_snapshot() {
            return Err(errno(libc::EBUSY));
        }
        if len % SECTOR_SIZE as usize != 0
            || sector + (len as u64 / SECTOR_SIZE) > self.sectors
        {
            return Err(errno(libc::EINVAL));
        }

        let completion = BioCompletion::new();
        tracer.queue_snapshot_read(Bio::read(sector, len).with_completion(Arc::clone(&completion)));

        let (error, bio) = completion.wait();
        if error != 0 {
            return Err(errno(error));
        }
        let mut bio = bio.ok_or_else(|| errno(libc::EIO))?;
        let mut data = Vec::with_capacity(len);
        for seg in &mut bio.segments {
            data.append(&mut seg.buf);
        }
        Ok(data)
    }

    /// The snapshot view is immutable; all writes are refused.
    pub fn write(&self, _sector: u64, _data: &[u8]) -> io::Result<()> {
        Err(errno(libc::EOPNOTSUPP))
    }
}
