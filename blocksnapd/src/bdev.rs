//! Base block device access and the submit-path hook.
//!
//! A [`BlockDevice`] wraps the file (device node or backing image) the
//! engine tracks. All traffic enters through [`BlockDevice::submit`], which
//! routes requests to the currently installed submit function. Installing a
//! tracing hook captures the previous function, exactly like replacing a
//! queue's make-request function: the hook decides per request whether to
//! trace or to forward to the captured original.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{debug, warn};

use crate::bio::{Bio, BioKind, SECTOR_SIZE};
use crate::errno::{code_of, errno};

pub type SubmitFn = Arc<dyn Fn(Bio) -> io::Result<()> + Send + Sync>;

/// Identity of a device: `(st_dev, st_ino)` of the backing file. Two opens
/// of the same path compare equal, which is what the interposer's
/// find-tracer scan keys on.
pub type BdevId = (u64, u64);

#[derive(Debug)]
struct BdevInner {
    file: File,
    path: PathBuf,
    id: BdevId,
    sectors: u64,
}

pub struct BlockDevice {
    inner: Arc<BdevInner>,
    submit_fn: RwLock<SubmitFn>,
}

impl std::fmt::Debug for BlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDevice")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

fn raw_submit(inner: &Arc<BdevInner>, mut bio: Bio) -> io::Result<()> {
    let result = (|| {
        let mut offset = bio.sector * SECTOR_SIZE;
        match bio.kind {
            BioKind::Read => {
                for seg in &mut bio.segments {
                    inner.file.read_exact_at(&mut seg.buf, offset)?;
                    offset += seg.buf.len() as u64;
                }
            }
            BioKind::Write => {
                for seg in &bio.segments {
                    inner.file.write_all_at(&seg.buf, offset)?;
                    offset += seg.buf.len() as u64;
                }
            }
            BioKind::Discard => {}
        }
        Ok(())
    })();

    match &result {
        Ok(()) => bio.finish(0),
        Err(err) => bio.finish(code_of(err)),
    }
    result
}

impl BlockDevice {
    /// Open the device backing file. `writable` asks for write access;
    /// a read-only target then fails with `EACCES`.
    pub fn open(path: &Path, writable: bool) -> io::Result<Arc<Self>> {
        let file = match OpenOptions::new().read(true).write(writable).open(path) {
            Ok(file) => file,
            Err(err) if writable && err.kind() == io::ErrorKind::PermissionDenied => {
                return Err(errno(libc::EACCES));
            }
            Err(err) => return Err(err),
        };

        let meta = file.metadata()?;
        let bytes = if meta.len() > 0 {
            meta.len()
        } else {
            // Device nodes report zero length; ask the fd for its extent.
            let end = unsafe { libc::lseek(file.as_raw_fd(), 0, libc::SEEK_END) };
            if end < 0 {
                return Err(io::Error::last_os_error());
            }
            end as u64
        };

        let inner = Arc::new(BdevInner {
            id: (meta.dev(), meta.ino()),
            path: path.to_path_buf(),
            sectors: bytes / SECTOR_SIZE,
            file,
        });

        let default = Self::default_submit(&inner);
        Ok(Arc::new(Self {
            inner,
            submit_fn: RwLock::new(default),
        }))
    }

    fn default_submit(inner: &Arc<BdevInner>) -> SubmitFn {
        let inner = Arc::clone(inner);
        Arc::new(move |bio| raw_submit(&inner, bio))
    }

    pub fn id(&self) -> BdevId {
        self.inner.id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn sectors(&self) -> u64 {
        self.inner.sectors
    }

    /// Submit a request through the currently installed submit function.
    pub fn submit(&self, bio: Bio) -> io::Result<()> {
        let submit = Arc::clone(&*self.submit_fn.read().unwrap());
        submit(bio)
    }

    /// Synchronous sector read, bypassing the hook. Used by the COW worker
    /// when reconstructing snapshot reads from the live device.
    pub fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> io::Result<()> {
        self.inner.file.read_exact_at(buf, sector * SECTOR_SIZE)
    }

    pub fn write_sectors(&self, sector: u64, buf: &[u8]) -> io::Result<()> {
        self.inner.file.write_all_at(buf, sector * SECTOR_SIZE)
    }

    /// Replace the submit function, returning the previous one. The device
    /// is quiesced first: data is flushed and the write half of the hook
    /// lock waits out in-flight submissions before the swap, the userspace
    /// analogue of freezing the filesystem around a hook transition. The
    /// flush failure path only logs: leaving the device without a working
    /// submit path would be worse than a missed sync.
    pub fn install_submit_fn(&self, submit: SubmitFn) -> SubmitFn {
        if let Err(err) = self.inner.file.sync_all() {
            warn!(
                "quiesce sync of '{}' failed before hook swap: {err}",
                self.inner.path.display()
            );
        }
        let mut slot = self.submit_fn.write().unwrap();
        debug!("swapping submit function for '{}'", self.inner.path.display());
        std::mem::replace(&mut *slot, submit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn image(bytes: usize) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.img");
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0u8; bytes]).unwrap();
        (dir, path)
    }

    #[test]
    fn readonly_target_rejects_write_open() {
        if unsafe { libc::geteuid() } == 0 {
            // Root bypasses permission bits; nothing to observe.
            return;
        }
        let (_dir, path) = image(4096);
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&path, perms).unwrap();

        let err = BlockDevice::open(&path, true).unwrap_err();
        assert_eq!(code_of(&err), libc::EACCES);
        assert!(BlockDevice::open(&path, false).is_ok());
    }

    #[test]
    fn submit_roundtrip_through_default_fn() {
        let (_dir, path) = image(8192);
        let dev = BlockDevice::open(&path, true).unwrap();
        assert_eq!(dev.sectors(), 16);

        dev.submit(Bio::write(8, vec![0xabu8; 4096])).unwrap();

        let completion = crate::bio::BioCompletion::new();
        dev.submit(Bio::read(8, 4096).with_completion(Arc::clone(&completion)))
            .unwrap();
        let (err, bio) = completion.wait();
        assert_eq!(err, 0);
        assert!(bio.unwrap().segments[0].buf.iter().all(|b| *b == 0xab));
    }

    #[test]
    fn hook_sees_traffic_and_original_still_works() {
        let (_dir, path) = image(8192);
        let dev = BlockDevice::open(&path, true).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_hook = Arc::clone(&seen);
        let orig_slot: Arc<Mutex<Option<SubmitFn>>> = Arc::new(Mutex::new(None));
        let orig_for_hook = Arc::clone(&orig_slot);
        let hook: SubmitFn = Arc::new(move |bio| {
            seen_in_hook.fetch_add(1, Ordering::SeqCst);
            let orig = Arc::clone(orig_for_hook.lock().unwrap().as_ref().unwrap());
            orig(bio)
        });
        let orig = dev.install_submit_fn(hook);
        *orig_slot.lock().unwrap() = Some(Arc::clone(&orig));

        dev.submit(Bio::write(0, vec![1u8; 512])).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // Uninstall restores pass-through behavior.
        dev.install_submit_fn(orig);
        dev.submit(Bio::write(0, vec![2u8; 512])).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
