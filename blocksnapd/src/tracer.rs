//! Per-device tracing controller.
//!
//! A [`Tracer`] owns everything attached to one tracked device: the base
//! device handle, the COW manager, the work queues and their workers, and
//! the state bits driving the lifecycle (active snapshot, active
//! incremental, dormant, unverified, plus the orthogonal fail overlay).
//!
//! Writes reach [`Tracer::snap_trace`] / [`Tracer::inc_trace`] through the
//! submit hook installed on the base device; both run on the submitter's
//! context and never block. In snapshot mode the write is held while
//! block-aligned read clones are queued for the COW worker, which captures
//! the original contents and turns each clone into a preservation write;
//! the original is released to the dispatch worker once the last clone
//! completes. In incremental mode only the changed sector ranges are
//! recorded and the write passes through immediately.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;

use log::{debug, error, warn};

use crate::bdev::{BdevId, BlockDevice, SubmitFn};
use crate::bio::{
    Bio, BioKind, MAX_CLONES_PER_BIO, MAX_CLONE_BYTES, SECTORS_PER_BLOCK, SECTOR_SIZE,
    TrackingParams,
};
use crate::config::EngineConfig;
use crate::cow::{CowManager, COW_BLOCK_SIZE, COW_SECTION_SIZE, COW_UUID_SIZE};
use crate::errno::{code_of, errno};
use crate::queue::{BioQueue, SectorSet, SsetQueue};
use crate::registry::Registry;
use crate::snapdev::SnapshotDevice;

pub const SNAPSHOT: u32 = 1 << 0;
pub const ACTIVE: u32 = 1 << 1;
pub const UNVERIFIED: u32 = 1 << 2;

#[derive(PartialEq, Eq, Clone, Copy)]
enum ReadMode {
    CowFile,
    BaseDevice,
    Mixed,
}

/// COW identity reported through the control surface.
#[derive(Clone, Copy)]
pub struct CowSummary {
    pub seqid: u64,
    pub uuid: [u8; COW_UUID_SIZE],
    pub version: u64,
    pub nr_changed_blocks: u64,
    pub file_max: u64,
}

#[derive(Default)]
struct Workers {
    cow: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
}

pub struct Tracer {
    minor: u32,
    state: AtomicU32,
    fail_code: AtomicI32,
    /// Open handles on the snapshot device; non-zero blocks destroy.
    refs: AtomicI64,
    size: AtomicU64,
    sect_off: AtomicU64,
    base: RwLock<Option<Arc<BlockDevice>>>,
    bdev_path: Mutex<PathBuf>,
    /// COW file path relative to its mountpoint.
    cow_path: Mutex<PathBuf>,
    /// Mountpoint the COW file was opened under, while verified.
    cow_mount: Mutex<Option<PathBuf>>,
    cow: Mutex<Option<CowManager>>,
    cow_inode: AtomicU64,
    falloc_size_mb: AtomicU64,
    cache_size: AtomicU64,
    cow_queue: Arc<BioQueue>,
    orig_queue: Arc<BioQueue>,
    sset_queue: Arc<SsetQueue>,
    stop_cow: AtomicBool,
    stop_dispatch: AtomicBool,
    submitted_cnt: AtomicU64,
    received_cnt: AtomicU64,
    orig_submit: Mutex<Option<SubmitFn>>,
    workers: Mutex<Workers>,
    snapdev: Mutex<Option<Arc<SnapshotDevice>>>,
}

fn round_down(x: u64, chunk: u64) -> u64 {
    x / chunk * chunk
}

fn round_up(x: u64, chunk: u64) -> u64 {
    x.div_ceil(chunk) * chunk
}

/// Best effort: workers run at the most favoured priority we are allowed.
fn boost_priority() {
    let _ = unsafe { libc::nice(-20) };
}

impl Tracer {
    pub fn new(minor: u32) -> Arc<Self> {
        Arc::new(Self {
            minor,
            state: AtomicU32::new(0),
            fail_code: AtomicI32::new(0),
            refs: AtomicI64::new(0),
            size: AtomicU64::new(0),
            sect_off: AtomicU64::new(0),
            base: RwLock::new(None),
            bdev_path: Mutex::new(PathBuf::new()),
            cow_path: Mutex::new(PathBuf::new()),
            cow_mount: Mutex::new(None),
            cow: Mutex::new(None),
            cow_inode: AtomicU64::new(0),
            falloc_size_mb: AtomicU64::new(0),
            cache_size: AtomicU64::new(0),
            cow_queue: Arc::new(BioQueue::new()),
            orig_queue: Arc::new(BioQueue::new()),
            sset_queue: Arc::new(SsetQueue::new()),
            stop_cow: AtomicBool::new(false),
            stop_dispatch: AtomicBool::new(false),
            submitted_cnt: AtomicU64::new(0),
            received_cnt: AtomicU64::new(0),
            orig_submit: Mutex::new(None),
            workers: Mutex::new(Workers::default()),
            snapdev: Mutex::new(None),
        })
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn state_bits(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    fn set_state(&self, bits: u32) {
        self.state.store(bits, Ordering::Release);
    }

    fn set_state_bit(&self, bit: u32) {
        self.state.fetch_or(bit, Ordering::AcqRel);
    }

    fn clear_state_bit(&self, bit: u32) {
        self.state.fetch_and(!bit, Ordering::AcqRel);
    }

    pub fn is_snapshot(&self) -> bool {
        self.state_bits() & SNAPSHOT != 0
    }

    pub fn is_active(&self) -> bool {
        self.state_bits() & ACTIVE != 0
    }

    pub fn is_unverified(&self) -> bool {
        self.state_bits() & UNVERIFIED != 0
    }

    pub fn read_fail_state(&self) -> i32 {
        self.fail_code.load(Ordering::SeqCst)
    }

    /// Latch the first non-zero error; later errors are kept out.
    pub fn set_fail_state(&self, error: i32) {
        if self
            .fail_code
            .compare_exchange(0, error, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            error!("tracer {} entering fail state: errno {error}", self.minor);
        }
    }

    pub fn open_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn close_ref(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn refs(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn size_sectors(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn sect_off(&self) -> u64 {
        self.sect_off.load(Ordering::Acquire)
    }

    pub fn cache_size(&self) -> u64 {
        self.cache_size.load(Ordering::Acquire)
    }

    pub fn base_device(&self) -> Option<Arc<BlockDevice>> {
        self.base.read().unwrap().clone()
    }

    pub fn bdev_id(&self) -> Option<BdevId> {
        self.base.read().unwrap().as_ref().map(|b| b.id())
    }

    pub fn bdev_path(&self) -> PathBuf {
        self.bdev_path.lock().unwrap().clone()
    }

    pub fn cow_path_rel(&self) -> PathBuf {
        self.cow_path.lock().unwrap().clone()
    }

    pub fn cow_mount(&self) -> Option<PathBuf> {
        self.cow_mount.lock().unwrap().clone()
    }

    pub fn snapshot_device(&self) -> Option<Arc<SnapshotDevice>> {
        self.snapdev.lock().unwrap().clone()
    }

    pub fn cow_summary(&self) -> Option<CowSummary> {
        self.cow.lock().unwrap().as_ref().map(|cow| CowSummary {
            seqid: cow.seqid(),
            uuid: cow.uuid(),
            version: cow.version(),
            nr_changed_blocks: cow.nr_changed_blocks(),
            file_max: cow.file_max(),
        })
    }

    pub(crate) fn queue_snapshot_read(&self, bio: Bio) {
        self.cow_queue.enqueue(bio);
    }

    /*
     * Interposer path.
     */

    fn should_trace(&self, bio: &Bio) -> bool {
        let off = self.sect_off();
        bio.is_write()
            && bio.size() > 0
            && self.read_fail_state() == 0
            && bio.sector >= off
            && bio.sector < off + self.size_sectors()
    }

    fn bio_needs_cow(&self, bio: &Bio) -> bool {
        let cow_inode = self.cow_inode.load(Ordering::Acquire);
        bio.segments
            .iter()
            .any(|seg| seg.owner_inode != Some(cow_inode))
    }

    /// Active-snapshot write: hold the original and queue one read clone
    /// per block-aligned span of the covered range. This runs on the
    /// submitter's context and must not block, so the clones only carry
    /// fresh buffers here; the COW worker performs the actual captures.
    /// The tracking record releases the original to the dispatch worker
    /// once every clone has been accounted for.
    pub(crate) fn snap_trace(self: &Arc<Self>, bio: Bio, orig: &SubmitFn) -> io::Result<()> {
        // Writes fully backed by the COW file itself would deadlock on
        // their own preservation; forward them untouched.
        if !self.bio_needs_cow(&bio) {
            return orig(bio);
        }

        let off = self.sect_off();
        let start_sect = round_down(bio.sector - off, SECTORS_PER_BLOCK) + off;
        let end_sect = round_up(bio.end_sector() - off, SECTORS_PER_BLOCK) + off;

        let tp = TrackingParams::new(bio, Arc::clone(&self.orig_queue));

        let mut cursor = start_sect;
        let mut clones = 0usize;
        let result = loop {
            if cursor >= end_sect {
                break Ok(());
            }
            if clones >= MAX_CLONES_PER_BIO {
                break Err(errno(libc::EFAULT));
            }
            let sectors = (end_sect - cursor).min(MAX_CLONE_BYTES / SECTOR_SIZE);

            let mut clone = Bio::read(cursor - off, (sectors * SECTOR_SIZE) as usize);
            tp.get();
            clone.tracking = Some(Arc::clone(&tp));
            self.submitted_cnt.fetch_add(1, Ordering::SeqCst);
            self.cow_queue.enqueue(clone);

            cursor += sectors;
            clones += 1;
        };

        if let Err(err) = result {
            error!("error tracing write for snapshot: {err}");
            self.set_fail_state(code_of(&err));
        }

        tp.put();
        Ok(())
    }

    /// Completion of a read clone, run by the COW worker: capture the
    /// original bytes from the base device (the held write has not been
    /// dispatched yet) and requeue the clone as a preservation write. On
    /// error the tracer fails and the clone's buffer is dropped.
    fn on_clone_read(&self, mut bio: Bio) {
        let result = match self.base_device() {
            Some(base) => {
                let off = self.sect_off();
                let mut sector = bio.sector + off;
                let mut read = Ok(());
                for seg in &mut bio.segments {
                    if let Err(err) = base.read_sectors(sector, &mut seg.buf) {
                        read = Err(err);
                        break;
                    }
                    sector += seg.buf.len() as u64 / SECTOR_SIZE;
                }
                read
            }
            None => Err(errno(libc::EFAULT)),
        };

        match result {
            Ok(()) => {
                bio.kind = BioKind::Write;
                self.cow_queue.enqueue(bio);
            }
            Err(err) => {
                error!("error reading from base device for copy on write: {err}");
                self.set_fail_state(code_of(&err));
            }
        }
    }

    /// Active-incremental write: record the changed ranges and forward the
    /// original immediately. Runs of segments backed by the COW file are
    /// skipped so self-writes never show up as changed blocks.
    pub(crate) fn inc_trace(&self, bio: Bio, orig: &SubmitFn) -> io::Result<()> {
        let cow_inode = self.cow_inode.load(Ordering::Acquire);
        let off = self.sect_off();

        let mut cursor = bio.sector;
        let mut run_start: Option<u64> = None;
        for seg in &bio.segments {
            if seg.owner_inode != Some(cow_inode) {
                run_start.get_or_insert(cursor);
            } else if let Some(start) = run_start.take() {
                if cursor > start {
                    self.sset_queue.enqueue(SectorSet {
                        sect: start - off,
                        len: cursor - start,
                    });
                }
            }
            cursor += seg.buf.len() as u64 / SECTOR_SIZE;
        }
        if let Some(start) = run_start {
            if cursor > start {
                self.sset_queue.enqueue(SectorSet {
                    sect: start - off,
                    len: cursor - start,
                });
            }
        }

        orig(bio)
    }

    /*
     * COW worker: snapshot reads and clone-write preservation.
     */

    fn snap_handle_write_bio(&self, bio: &Bio) -> io::Result<()> {
        let mut guard = self.cow.lock().unwrap();
        let cow = guard.as_mut().ok_or_else(|| errno(libc::EIO))?;

        let mut block = bio.sector / SECTORS_PER_BLOCK;
        for seg in &bio.segments {
            for chunk in seg.buf.chunks(COW_BLOCK_SIZE as usize) {
                cow.write_block_if_new(block, chunk)?;
                block += 1;
            }
        }
        Ok(())
    }

    fn snap_read_bio_get_mode(&self, cow: &mut CowManager, bio: &Bio) -> io::Result<ReadMode> {
        let start_byte = bio.sector * SECTOR_SIZE;
        let end_byte = start_byte + bio.size();
        let first_block = start_byte / COW_BLOCK_SIZE;
        let last_block = end_byte.div_ceil(COW_BLOCK_SIZE);

        let mut mode = None;
        for block in first_block..last_block {
            let mapped = cow.read_mapping(block)? != 0;
            match mode {
                None => {
                    mode = Some(if mapped {
                        ReadMode::CowFile
                    } else {
                        ReadMode::BaseDevice
                    })
                }
                Some(ReadMode::CowFile) if !mapped => return Ok(ReadMode::Mixed),
                Some(ReadMode::BaseDevice) if mapped => return Ok(ReadMode::Mixed),
                _ => {}
            }
        }
        Ok(mode.unwrap_or(ReadMode::BaseDevice))
    }

    /// Reconstruct the point-in-time view for one read: pull the live data
    /// once if any block is unmapped, then patch in every preserved block.
    fn snap_handle_read_bio(&self, bio: &mut Bio) -> io::Result<()> {
        let mut guard = self.cow.lock().unwrap();
        let cow = guard.as_mut().ok_or_else(|| errno(libc::EIO))?;

        let mode = self.snap_read_bio_get_mode(cow, bio)?;

        if mode != ReadMode::CowFile {
            let base = self.base_device().ok_or_else(|| errno(libc::EIO))?;
            let off = self.sect_off();
            let mut sector = bio.sector + off;
            for seg in &mut bio.segments {
                base.read_sectors(sector, &mut seg.buf)?;
                sector += seg.buf.len() as u64 / SECTOR_SIZE;
            }
        }

        if mode != ReadMode::BaseDevice {
            let mut cur_sect = bio.sector;
            for seg in &mut bio.segments {
                let mut seg_off = 0usize;
                while seg_off < seg.buf.len() {
                    let cur_byte = cur_sect * SECTOR_SIZE;
                    let cur_block = cur_byte / COW_BLOCK_SIZE;
                    let block_off = cur_byte % COW_BLOCK_SIZE;
                    let bytes = ((COW_BLOCK_SIZE - block_off) as usize)
                        .min(seg.buf.len() - seg_off);

                    let mapping = cow.read_mapping(cur_block)?;
                    if mapping != 0 {
                        cow.read_data(&mut seg.buf[seg_off..seg_off + bytes], mapping, block_off)?;
                    }

                    cur_sect += bytes as u64 / SECTOR_SIZE;
                    seg_off += bytes;
                }
            }
        }

        Ok(())
    }

    fn inc_handle_sset(&self, sset: &SectorSet) -> io::Result<()> {
        let mut guard = self.cow.lock().unwrap();
        let cow = guard.as_mut().ok_or_else(|| errno(libc::EIO))?;

        let start_block = sset.sect / SECTORS_PER_BLOCK;
        let end_block = (sset.sect + sset.len).div_ceil(SECTORS_PER_BLOCK);
        for block in start_block..end_block {
            cow.write_filler_mapping(block)?;
        }
        Ok(())
    }

    /// Release COW resources after the fail overlay latched; remaining queue
    /// entries drain with `EIO`.
    fn release_cow_on_failure(&self) {
        debug!("error detected in worker, cleaning up cow");
        if let Some(cow) = self.cow.lock().unwrap().take() {
            cow.free();
        }
    }

    fn cow_worker(self: Arc<Self>) {
        boost_priority();
        let queue = Arc::clone(&self.cow_queue);
        let mut is_failed = false;

        loop {
            queue.wait(|| self.stop_cow.load(Ordering::Acquire));

            if !is_failed && self.read_fail_state() != 0 {
                is_failed = true;
                self.release_cow_on_failure();
            }

            let Some(mut bio) = queue.dequeue_delay_read() else {
                if self.stop_cow.load(Ordering::Acquire)
                    && self.submitted_cnt.load(Ordering::SeqCst)
                        == self.received_cnt.load(Ordering::SeqCst)
                {
                    break;
                }
                continue;
            };

            if let Some(tp) = bio.tracking.take() {
                // Read clone. In the fail state the capture is pointless;
                // the reference still drops so the held original write is
                // released to the dispatch worker either way.
                if !is_failed {
                    self.on_clone_read(bio);
                }
                self.received_cnt.fetch_add(1, Ordering::SeqCst);
                tp.put();
                continue;
            }

            if bio.is_write() {
                if is_failed {
                    continue;
                }
                if let Err(err) = self.snap_handle_write_bio(&bio) {
                    error!("error handling write bio in cow worker: {err}");
                    self.set_fail_state(code_of(&err));
                }
            } else {
                if is_failed {
                    bio.finish(libc::EIO);
                    continue;
                }
                match self.snap_handle_read_bio(&mut bio) {
                    Ok(()) => bio.finish(0),
                    Err(err) => {
                        error!("error handling read bio in cow worker: {err}");
                        self.set_fail_state(code_of(&err));
                        bio.finish(libc::EIO);
                    }
                }
            }
        }
    }

    fn sset_worker(self: Arc<Self>) {
        boost_priority();
        let queue = Arc::clone(&self.sset_queue);
        let mut is_failed = false;

        loop {
            queue.wait(|| self.stop_cow.load(Ordering::Acquire));

            if !is_failed && self.read_fail_state() != 0 {
                is_failed = true;
                self.release_cow_on_failure();
            }

            let Some(sset) = queue.dequeue() else {
                if self.stop_cow.load(Ordering::Acquire) {
                    break;
                }
                continue;
            };

            if is_failed {
                continue;
            }
            if let Err(err) = self.inc_handle_sset(&sset) {
                error!("error handling sector set in worker: {err}");
                self.set_fail_state(code_of(&err));
            }
        }
    }

    /// Re-submits original writes after their clones completed. The
    /// pass-through marker tells the interposer to forward them unchanged.
    fn dispatch_worker(self: Arc<Self>) {
        boost_priority();
        let queue = Arc::clone(&self.orig_queue);

        loop {
            queue.wait(|| self.stop_dispatch.load(Ordering::Acquire));

            let Some(mut bio) = queue.dequeue() else {
                if self.stop_dispatch.load(Ordering::Acquire) {
                    break;
                }
                continue;
            };

            bio.passthrough = true;
            match self.base_device() {
                Some(base) => {
                    if let Err(err) = base.submit(bio) {
                        error!("error dispatching original write: {err}");
                    }
                }
                None => error!("dispatch worker has no base device"),
            }
        }
    }

    /*
     * Component setup / teardown.
     */

    fn setup_base_dev(&self, registry: &Registry, bdev_path: &Path) -> io::Result<()> {
        debug!("opening base block device '{}'", bdev_path.display());
        let base = BlockDevice::open(bdev_path, true)?;

        if registry.bdev_already_traced(base.id()) {
            error!("block device is already being traced");
            return Err(errno(libc::EINVAL));
        }

        let abs = std::fs::canonicalize(bdev_path)?;
        self.size.store(base.sectors(), Ordering::Release);
        self.sect_off.store(0, Ordering::Release);
        *self.bdev_path.lock().unwrap() = abs;
        *self.base.write().unwrap() = Some(base);
        Ok(())
    }

    fn copy_base_dev(&self, from: &Tracer) {
        self.size.store(from.size_sectors(), Ordering::Release);
        self.sect_off.store(from.sect_off(), Ordering::Release);
        *self.bdev_path.lock().unwrap() = from.bdev_path();
        *self.base.write().unwrap() = from.base_device();
    }

    fn stat_cow_inode(&self, cow_path: &Path) -> io::Result<()> {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(cow_path)?;
        self.cow_inode.store(meta.ino(), Ordering::Release);
        Ok(())
    }

    fn setup_cow_new(
        &self,
        config: &EngineConfig,
        cow_path: &Path,
        fallocated_space_mb: u64,
        cache_size: u64,
        uuid: Option<[u8; COW_UUID_SIZE]>,
        seqid: u64,
    ) -> io::Result<()> {
        let cache = if cache_size == 0 {
            config.cow_max_memory_default
        } else {
            cache_size
        };
        self.cache_size.store(cache, Ordering::Release);

        let size_bytes = self.size_sectors() * SECTOR_SIZE;
        let file_max = if fallocated_space_mb == 0 {
            size_bytes * config.cow_fallocate_percentage / 100
        } else {
            fallocated_space_mb * 1024 * 1024
        };
        self.falloc_size_mb
            .store(file_max / (1024 * 1024), Ordering::Release);

        let blocks = self.size_sectors() / SECTORS_PER_BLOCK;
        let cow = CowManager::init(
            cow_path,
            blocks,
            COW_SECTION_SIZE,
            cache,
            file_max,
            uuid,
            seqid,
        )?;
        *self.cow.lock().unwrap() = Some(cow);
        self.stat_cow_inode(cow_path)
    }

    fn setup_cow_reload(
        &self,
        config: &EngineConfig,
        cow_path: &Path,
        cache_size: u64,
        index_only: bool,
    ) -> io::Result<()> {
        let cache = if cache_size == 0 {
            config.cow_max_memory_default
        } else {
            cache_size
        };
        self.cache_size.store(cache, Ordering::Release);

        let blocks = self.size_sectors() / SECTORS_PER_BLOCK;
        let cow = CowManager::reload(cow_path, blocks, COW_SECTION_SIZE, cache, index_only)?;
        self.falloc_size_mb
            .store(cow.file_max() / (1024 * 1024), Ordering::Release);
        *self.cow.lock().unwrap() = Some(cow);
        self.stat_cow_inode(cow_path)
    }

    fn set_cow_location(&self, rel_path: &Path, mount_point: &Path) {
        *self.cow_path.lock().unwrap() = rel_path.to_path_buf();
        *self.cow_mount.lock().unwrap() = Some(mount_point.to_path_buf());
    }

    fn setup_snap_device(self: &Arc<Self>, registry: &Arc<Registry>) -> io::Result<()> {
        let name = format!("{}{}", registry.config().device_prefix, self.minor);
        debug!("creating snapshot device '{name}'");
        let snapdev = SnapshotDevice::new(
            Arc::downgrade(registry),
            self.minor,
            name,
            self.size_sectors(),
        );
        *self.snapdev.lock().unwrap() = Some(Arc::new(snapdev));

        self.submitted_cnt.store(0, Ordering::SeqCst);
        self.received_cnt.store(0, Ordering::SeqCst);
        self.stop_dispatch.store(false, Ordering::Release);

        let worker = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("blocksnap_mrf{}", self.minor))
            .spawn(move || worker.dispatch_worker())?;
        self.workers.lock().unwrap().dispatch = Some(handle);
        Ok(())
    }

    fn destroy_snap_device(&self) {
        let handle = self.workers.lock().unwrap().dispatch.take();
        if let Some(handle) = handle {
            debug!("stopping dispatch worker for minor {}", self.minor);
            self.stop_dispatch.store(true, Ordering::Release);
            self.orig_queue.wake_all();
            let _ = handle.join();
            self.stop_dispatch.store(false, Ordering::Release);
        }
        *self.snapdev.lock().unwrap() = None;
    }

    fn spawn_cow_worker(self: &Arc<Self>, is_snap: bool) -> io::Result<()> {
        self.stop_cow.store(false, Ordering::Release);
        let worker = Arc::clone(self);
        let handle = if is_snap {
            std::thread::Builder::new()
                .name(format!("blocksnap_cow{}", self.minor))
                .spawn(move || worker.cow_worker())?
        } else {
            std::thread::Builder::new()
                .name(format!("blocksnap_inc{}", self.minor))
                .spawn(move || worker.sset_worker())?
        };
        self.workers.lock().unwrap().cow = Some(handle);
        Ok(())
    }

    fn stop_cow_worker(&self) {
        let handle = self.workers.lock().unwrap().cow.take();
        if let Some(handle) = handle {
            debug!("stopping cow worker for minor {}", self.minor);
            self.stop_cow.store(true, Ordering::Release);
            self.cow_queue.wake_all();
            self.sset_queue.wake_all();
            let _ = handle.join();
            self.stop_cow.store(false, Ordering::Release);
        }
    }

    /// Install the tracing hook on the base device and publish this tracer
    /// in the registry. The hook captures the original submit function.
    fn setup_tracing(self: &Arc<Self>, registry: &Arc<Registry>) -> io::Result<()> {
        let base = self.base_device().ok_or_else(|| errno(libc::EFAULT))?;
        registry.insert(self.minor, Arc::clone(self));

        let hook = make_tracing_hook(Arc::downgrade(registry), &base);
        let orig = base.install_submit_fn(hook);
        *self.orig_submit.lock().unwrap() = Some(orig);
        Ok(())
    }

    /// Take over tracing from a predecessor on the same base device: the
    /// hook stays installed, the registry slot changes hands and the saved
    /// original submit function is inherited.
    fn adopt_tracing(self: &Arc<Self>, registry: &Arc<Registry>, orig: SubmitFn) {
        *self.orig_submit.lock().unwrap() = Some(orig);
        registry.insert(self.minor, Arc::clone(self));
    }

    fn take_orig_submit(&self) -> Option<SubmitFn> {
        self.orig_submit.lock().unwrap().take()
    }

    fn clone_orig_submit(&self) -> Option<SubmitFn> {
        self.orig_submit.lock().unwrap().clone()
    }

    fn destroy_tracing(&self, registry: &Registry) {
        if let Some(orig) = self.take_orig_submit() {
            if let Some(base) = self.base_device() {
                debug!("restoring original submit function for minor {}", self.minor);
                base.install_submit_fn(orig);
            }
        }
        registry.remove_if_same(self.minor, self);
    }

    /*
     * Lifecycle entry points. All run under the registry's control mutex.
     */

    /// Absent → Active-Snap.
    #[allow(clippy::too_many_arguments)]
    pub fn setup_active_snap(
        registry: &Arc<Registry>,
        minor: u32,
        bdev_path: &Path,
        cow_path: &Path,
        cow_rel_path: &Path,
        mount_point: &Path,
        fallocated_space_mb: u64,
        cache_size: u64,
    ) -> io::Result<Arc<Tracer>> {
        let dev = Tracer::new(minor);
        dev.set_state(SNAPSHOT | ACTIVE);

        let result = (|| {
            dev.setup_base_dev(registry, bdev_path)?;
            dev.setup_cow_new(
                registry.config(),
                cow_path,
                fallocated_space_mb,
                cache_size,
                None,
                1,
            )?;
            dev.set_cow_location(cow_rel_path, mount_point);
            dev.setup_snap_device(registry)?;
            dev.spawn_cow_worker(true)?;
            dev.setup_tracing(registry)
        })();

        match result {
            Ok(()) => Ok(dev),
            Err(err) => {
                error!("error setting up tracer as active snapshot: {err}");
                dev.destroy(registry);
                Err(err)
            }
        }
    }

    /// Absent → Unverified-Snap / Unverified-Inc.
    pub fn setup_unverified(
        registry: &Arc<Registry>,
        minor: u32,
        bdev_path: &Path,
        cow_rel_path: &Path,
        cache_size: u64,
        is_snap: bool,
    ) -> Arc<Tracer> {
        let dev = Tracer::new(minor);
        dev.set_state(if is_snap { SNAPSHOT | UNVERIFIED } else { UNVERIFIED });
        dev.cache_size.store(cache_size, Ordering::Release);
        *dev.bdev_path.lock().unwrap() = bdev_path.to_path_buf();
        *dev.cow_path.lock().unwrap() = cow_rel_path.to_path_buf();
        registry.insert(minor, Arc::clone(&dev));
        dev
    }

    /// Any → Absent. Stops workers, removes the hook and unlinks the COW
    /// file; setup failures unwind through here as well.
    pub fn destroy(self: &Arc<Self>, registry: &Registry) {
        debug!("destroying tracer minor {}", self.minor);
        self.destroy_tracing(registry);
        self.stop_cow_worker();
        self.destroy_snap_device();
        if let Some(cow) = self.cow.lock().unwrap().take() {
            cow.free();
        }
        self.cow_inode.store(0, Ordering::Release);
        *self.cow_mount.lock().unwrap() = None;
        *self.base.write().unwrap() = None;
    }

    /// Active-Snap → Active-Inc: same COW chain, preserved data dropped.
    pub fn active_snap_to_inc(
        registry: &Arc<Registry>,
        old_dev: &Arc<Tracer>,
    ) -> io::Result<Arc<Tracer>> {
        let dev = Tracer::new(old_dev.minor);
        dev.set_state(ACTIVE);
        dev.copy_base_dev(old_dev);
        *dev.cow_path.lock().unwrap() = old_dev.cow_path_rel();
        *dev.cow_mount.lock().unwrap() = old_dev.cow_mount();
        dev.cache_size
            .store(old_dev.cache_size(), Ordering::Release);
        dev.falloc_size_mb
            .store(old_dev.falloc_size_mb.load(Ordering::Acquire), Ordering::Release);

        let orig = old_dev
            .clone_orig_submit()
            .ok_or_else(|| errno(libc::EFAULT))?;
        dev.adopt_tracing(registry, orig);

        // The old worker must be fully drained before the manager changes
        // hands; from here on the new tracer owns the COW state.
        old_dev.stop_cow_worker();
        *dev.cow.lock().unwrap() = old_dev.cow.lock().unwrap().take();
        dev.cow_inode.store(
            old_dev.cow_inode.load(Ordering::Acquire),
            Ordering::Release,
        );

        let ret = old_dev.read_fail_state();
        if ret != 0 {
            error!("errors occurred during cleanup of snapshot worker, failing incremental");
            dev.set_fail_state(ret);
            dev.spawn_cow_worker(false)?;
            old_dev.destroy_snap_device();
            return Err(errno(ret));
        }

        dev.spawn_cow_worker(false)?;

        let truncate = match dev.cow.lock().unwrap().as_mut() {
            Some(cow) => cow.truncate_to_index(),
            None => Err(errno(libc::EFAULT)),
        };
        if let Err(err) = truncate {
            warn!("cow file truncation failed, incremental will use more disk space than needed: {err}");
        }

        old_dev.destroy_snap_device();
        Ok(dev)
    }

    /// Active-Inc → Active-Snap: next generation of the chain, fresh COW
    /// file, snapshot device and workers.
    pub fn active_inc_to_snap(
        registry: &Arc<Registry>,
        old_dev: &Arc<Tracer>,
        cow_path: &Path,
        cow_rel_path: &Path,
        mount_point: &Path,
        fallocated_space_mb: u64,
    ) -> io::Result<Arc<Tracer>> {
        let dev = Tracer::new(old_dev.minor);
        dev.set_state(SNAPSHOT | ACTIVE);
        dev.copy_base_dev(old_dev);

        let falloc = if fallocated_space_mb != 0 {
            fallocated_space_mb
        } else {
            old_dev.falloc_size_mb.load(Ordering::Acquire)
        };

        let (uuid, seqid) = {
            let guard = old_dev.cow.lock().unwrap();
            let cow = guard.as_ref().ok_or_else(|| errno(libc::EINVAL))?;
            (cow.uuid(), cow.seqid() + 1)
        };

        let result = (|| {
            dev.setup_cow_new(
                registry.config(),
                cow_path,
                falloc,
                old_dev.cache_size(),
                Some(uuid),
                seqid,
            )?;
            dev.set_cow_location(cow_rel_path, mount_point);
            dev.setup_snap_device(registry)?;
            dev.spawn_cow_worker(true)
        })();

        if let Err(err) = result {
            error!("error transitioning tracer to snapshot mode: {err}");
            dev.stop_cow_worker();
            dev.destroy_snap_device();
            if let Some(cow) = dev.cow.lock().unwrap().take() {
                cow.free();
            }
            return Err(err);
        }

        let orig = old_dev
            .clone_orig_submit()
            .ok_or_else(|| errno(libc::EFAULT))?;
        dev.adopt_tracing(registry, orig);

        old_dev.stop_cow_worker();
        if let Some(cow) = old_dev.cow.lock().unwrap().take() {
            if let Err(err) = cow.sync_and_free() {
                warn!("error closing previous incremental cow file: {err}");
            }
        }

        Ok(dev)
    }

    /// Active-* → Dormant, on unmount of the base device's filesystem.
    pub fn active_to_dormant(&self) {
        self.stop_cow_worker();

        let result = match self.cow.lock().unwrap().as_mut() {
            Some(cow) => cow.sync_and_close(),
            None => Err(errno(libc::EFAULT)),
        };
        match result {
            Ok(()) => {
                *self.cow_mount.lock().unwrap() = None;
                self.clear_state_bit(ACTIVE);
            }
            Err(err) => {
                error!("error transitioning tracer to dormant state: {err}");
                self.set_fail_state(code_of(&err));
            }
        }
    }

    /// Dormant → Active-*, on remount. The COW file reappears under the
    /// new mountpoint.
    pub fn dormant_to_active(
        self: &Arc<Self>,
        mount_point: &Path,
    ) -> io::Result<()> {
        let result = (|| {
            let rel = self.cow_path_rel();
            let cow_full = join_mount_path(mount_point, &rel);
            match self.cow.lock().unwrap().as_mut() {
                Some(cow) => cow.reopen(&cow_full)?,
                None => return Err(errno(libc::EFAULT)),
            }
            self.stat_cow_inode(&cow_full)?;
            self.spawn_cow_worker(self.is_snapshot())?;
            *self.cow_mount.lock().unwrap() = Some(mount_point.to_path_buf());
            self.set_state_bit(ACTIVE);
            self.clear_state_bit(UNVERIFIED);
            Ok(())
        })();

        if let Err(ref err) = result {
            error!("error transitioning tracer to active state: {err}");
            self.set_fail_state(code_of(err));
        }
        result
    }

    /// Unverified-* → Active-*, once the base device's filesystem shows up
    /// mounted writable. On failure the tracer reverts to unverified with
    /// the fail code latched.
    pub fn unverified_to_active(
        self: &Arc<Self>,
        registry: &Arc<Registry>,
        mount_point: &Path,
    ) -> io::Result<()> {
        let is_snap = self.is_snapshot();
        let bdev_path = self.bdev_path();
        let rel_path = self.cow_path_rel();
        let cache_size = self.cache_size();

        self.destroy_tracing(registry);
        self.set_state_bit(ACTIVE);
        self.clear_state_bit(UNVERIFIED);

        let result = (|| {
            self.setup_base_dev(registry, &bdev_path)?;
            let cow_full = join_mount_path(mount_point, &rel_path);
            self.setup_cow_reload(registry.config(), &cow_full, cache_size, !is_snap)?;
            self.set_cow_location(&rel_path, mount_point);
            if is_snap {
                self.setup_snap_device(registry)?;
            }
            self.spawn_cow_worker(is_snap)?;
            self.setup_tracing(registry)
        })();

        if let Err(ref err) = result {
            error!("error activating unverified tracer: {err}");
            let code = code_of(err);
            self.destroy(registry);
            self.set_state(if is_snap { SNAPSHOT | UNVERIFIED } else { UNVERIFIED });
            self.cache_size.store(cache_size, Ordering::Release);
            *self.bdev_path.lock().unwrap() = bdev_path;
            *self.cow_path.lock().unwrap() = rel_path;
            registry.insert(self.minor, Arc::clone(self));
            self.set_fail_state(code);
        }
        result
    }

    /// Live cache-size adjustment.
    pub fn reconfigure(&self, config: &EngineConfig, cache_size: u64) {
        self.cache_size.store(cache_size, Ordering::Release);
        let effective = if cache_size == 0 {
            config.cow_max_memory_default
        } else {
            cache_size
        };
        if self.is_active() {
            if let Some(cow) = self.cow.lock().unwrap().as_mut() {
                cow.modify_cache_size(effective);
            }
        }
    }
}

pub fn join_mount_path(mount_point: &Path, rel: &Path) -> PathBuf {
    let rel = rel.strip_prefix("/").unwrap_or(rel);
    mount_point.join(rel)
}

/// The interposer installed on a base device's submit path. Pass-through
/// requests are stripped and forwarded; everything else is matched against
/// the registry and traced according to the owning tracer's state.
fn make_tracing_hook(registry: Weak<Registry>, base: &Arc<BlockDevice>) -> SubmitFn {
    let id = base.id();
    Arc::new(move |mut bio: Bio| {
        let Some(registry) = registry.upgrade() else {
            return Err(errno(libc::EFAULT));
        };
        let Some(dev) = registry.find_by_bdev(id) else {
            return Err(errno(libc::EFAULT));
        };
        let Some(orig) = dev.orig_submit.lock().unwrap().clone() else {
            error!("error finding original submit function");
            return Err(errno(libc::EFAULT));
        };

        if bio.passthrough {
            bio.passthrough = false;
            return orig(bio);
        }

        if dev.should_trace(&bio) {
            if dev.state_bits() & (SNAPSHOT | ACTIVE) == SNAPSHOT | ACTIVE {
                return dev.snap_trace(bio, &orig);
            }
            if dev.is_active() {
                return dev.inc_trace(bio, &orig);
            }
        }

        orig(bio)
    })
}
