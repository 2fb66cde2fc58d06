//! COW file management: the block-addressed mapping store and its data area.
//!
//! File layout: a 4096-byte header, then `total_sects` packed index
//! sections of `sect_size` 64-bit mapping entries, then block-aligned data
//! written densely in append order. A mapping of 0 means untouched, 1 is the
//! reserved filler recorded by incremental tracking, and anything else is
//! the index of the data block holding the preserved contents.
//!
//! The in-memory section cache is bounded: once more sections are resident
//! than the configured cache allows, an eviction pass flushes and frees the
//! sections whose usage falls below an approximated median.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use log::{debug, error, warn};

use crate::errno::errno;

pub const COW_BLOCK_LOG_SIZE: u32 = 12;
pub const COW_BLOCK_SIZE: u64 = 1 << COW_BLOCK_LOG_SIZE;
pub const COW_HEADER_SIZE: u64 = 4096;
pub const COW_MAGIC: u32 = 4776;
pub const COW_SECTION_SIZE: u64 = 4096;
pub const COW_UUID_SIZE: usize = 16;

pub const COW_CLEAN: u32 = 1 << 0;
pub const COW_INDEX_ONLY: u32 = 1 << 1;
/// In-memory allocation detail in the original format; never persisted as
/// meaningful state and masked out when a file is opened.
pub const COW_VMALLOC_UPPER: u32 = 1 << 2;

pub const COW_VERSION_0: u64 = 0;
pub const COW_VERSION_CHANGED_BLOCKS: u64 = 1;

/// Reserved mapping value for "changed but not preserved".
pub const COW_FILLER_MAPPING: u64 = 1;

const HEADER_ENCODED_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CowHeader {
    pub magic: u32,
    pub flags: u32,
    pub fpos: u64,
    pub fsize: u64,
    pub seqid: u64,
    pub uuid: [u8; COW_UUID_SIZE],
    pub version: u64,
    pub nr_changed_blocks: u64,
}

impl CowHeader {
    pub fn encode(&self) -> [u8; HEADER_ENCODED_LEN] {
        let mut out = [0u8; HEADER_ENCODED_LEN];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.flags);
        buf.put_u64_le(self.fpos);
        buf.put_u64_le(self.fsize);
        buf.put_u64_le(self.seqid);
        buf.put_slice(&self.uuid);
        buf.put_u64_le(self.version);
        buf.put_u64_le(self.nr_changed_blocks);
        out
    }

    pub fn decode(mut buf: &[u8]) -> CowHeader {
        let magic = buf.get_u32_le();
        let flags = buf.get_u32_le();
        let fpos = buf.get_u64_le();
        let fsize = buf.get_u64_le();
        let seqid = buf.get_u64_le();
        let mut uuid = [0u8; COW_UUID_SIZE];
        buf.copy_to_slice(&mut uuid);
        let version = buf.get_u64_le();
        let nr_changed_blocks = buf.get_u64_le();
        CowHeader {
            magic,
            flags,
            fpos,
            fsize,
            seqid,
            uuid,
            version,
            nr_changed_blocks,
        }
    }
}

#[derive(Debug)]
struct CowSection {
    /// Set once the section has ever held mappings, in memory or on file.
    has_data: bool,
    /// Access counter feeding the eviction heuristic.
    usage: u64,
    /// Mappings not yet flushed to the index region.
    dirty: bool,
    mappings: Option<Box<[u64]>>,
}

#[derive(Debug)]
pub struct CowManager {
    file: Option<File>,
    path: PathBuf,
    flags: u32,
    /// Next free data block index, in blocks from the start of the file.
    curr_pos: u64,
    data_offset: u64,
    file_max: u64,
    seqid: u64,
    version: u64,
    nr_changed_blocks: u64,
    uuid: [u8; COW_UUID_SIZE],
    sect_size: u64,
    allocated_sects: u64,
    total_sects: u64,
    allowed_sects: u64,
    sects: Vec<CowSection>,
}

fn calculate_allowed_sects(cache_size: u64, total_sects: u64, sect_size: u64) -> u64 {
    let meta = total_sects * std::mem::size_of::<CowSection>() as u64;
    if cache_size <= meta {
        0
    } else {
        (cache_size - meta) / (sect_size * 8)
    }
}

/// End of the index region, rounded up so the data region stays
/// block-aligned.
fn calculate_data_offset(total_sects: u64, sect_size: u64) -> u64 {
    (COW_HEADER_SIZE + total_sects * sect_size * 8).div_ceil(COW_BLOCK_SIZE) * COW_BLOCK_SIZE
}

fn open_cow_file(path: &Path, create: bool) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(create)
        .open(path)?;
    if !file.metadata()?.is_file() {
        return Err(errno(libc::EINVAL));
    }
    Ok(file)
}

/// Preallocate `length` bytes, falling back to writing zeros on filesystems
/// without fallocate support.
fn file_allocate(file: &File, path: &Path, offset: u64, length: u64) -> io::Result<()> {
    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            0,
            offset as libc::off_t,
            length as libc::off_t,
        )
    };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EOPNOTSUPP) {
        return Err(err);
    }
    warn!(
        "fallocate is not supported for '{}', falling back on writing zeros",
        path.display()
    );

    let zeros = vec![0u8; COW_BLOCK_SIZE as usize];
    let mut pos = offset;
    let end = offset + length;
    while pos < end {
        let n = (end - pos).min(COW_BLOCK_SIZE) as usize;
        file.write_all_at(&zeros[..n], pos)?;
        pos += n as u64;
    }
    Ok(())
}

impl CowManager {
    /// Create a fresh COW file and manager for a new chain (or, when `uuid`
    /// is supplied, the next generation of an existing chain).
    pub fn init(
        path: &Path,
        elements: u64,
        sect_size: u64,
        cache_size: u64,
        file_max: u64,
        uuid: Option<[u8; COW_UUID_SIZE]>,
        seqid: u64,
    ) -> io::Result<CowManager> {
        debug!("creating cow file '{}', seqid = {seqid}", path.display());
        let file = open_cow_file(path, true)?;

        let total_sects = elements.div_ceil(sect_size);
        let mut cm = CowManager {
            file: Some(file),
            path: path.to_path_buf(),
            flags: 0,
            data_offset: calculate_data_offset(total_sects, sect_size),
            curr_pos: 0,
            file_max,
            seqid,
            version: COW_VERSION_CHANGED_BLOCKS,
            nr_changed_blocks: 0,
            uuid: uuid.unwrap_or_else(|| uuid::Uuid::new_v4().into_bytes()),
            sect_size,
            allocated_sects: 0,
            total_sects,
            allowed_sects: calculate_allowed_sects(cache_size, total_sects, sect_size),
            sects: Vec::new(),
        };
        cm.curr_pos = cm.data_offset / COW_BLOCK_SIZE;
        cm.sects = (0..total_sects)
            .map(|_| CowSection {
                has_data: false,
                usage: 0,
                dirty: false,
                mappings: None,
            })
            .collect();

        let result = (|| {
            debug!("allocating cow file ({file_max} bytes)");
            file_allocate(cm.file.as_ref().unwrap(), &cm.path, 0, file_max)?;
            cm.write_header(false)
        })();

        if let Err(err) = result {
            error!("error initializing cow manager: {err}");
            // A partial COW file must not survive a failed setup.
            cm.unlink_file();
            return Err(err);
        }

        Ok(cm)
    }

    /// Open an existing COW file after a reboot or reload. All sections are
    /// assumed to be populated on disk and none start resident.
    pub fn reload(
        path: &Path,
        elements: u64,
        sect_size: u64,
        cache_size: u64,
        index_only: bool,
    ) -> io::Result<CowManager> {
        debug!("reloading cow file '{}'", path.display());
        let file = open_cow_file(path, false)?;

        let total_sects = elements.div_ceil(sect_size);
        let mut cm = CowManager {
            file: Some(file),
            path: path.to_path_buf(),
            flags: 0,
            data_offset: calculate_data_offset(total_sects, sect_size),
            curr_pos: 0,
            file_max: 0,
            seqid: 0,
            version: COW_VERSION_0,
            nr_changed_blocks: 0,
            uuid: [0u8; COW_UUID_SIZE],
            sect_size,
            allocated_sects: 0,
            total_sects,
            allowed_sects: calculate_allowed_sects(cache_size, total_sects, sect_size),
            sects: Vec::new(),
        };

        cm.open_header(index_only, true)?;

        cm.sects = (0..total_sects)
            .map(|_| CowSection {
                has_data: true,
                usage: 0,
                dirty: false,
                mappings: None,
            })
            .collect();

        Ok(cm)
    }

    /// Reopen the backing file of a dormant manager; metadata was kept.
    pub fn reopen(&mut self, path: &Path) -> io::Result<()> {
        debug!("reopening cow file '{}'", path.display());
        let file = open_cow_file(path, false)?;
        self.file = Some(file);
        self.path = path.to_path_buf();

        let index_only = self.flags & COW_INDEX_ONLY != 0;
        if let Err(err) = self.open_header(index_only, false) {
            self.file = None;
            return Err(err);
        }
        Ok(())
    }

    fn file(&self) -> io::Result<&File> {
        self.file.as_ref().ok_or_else(|| errno(libc::EBADF))
    }

    fn write_header(&mut self, is_clean: bool) -> io::Result<()> {
        if is_clean {
            self.flags |= COW_CLEAN;
        } else {
            self.flags &= !COW_CLEAN;
        }

        let header = CowHeader {
            magic: COW_MAGIC,
            flags: self.flags,
            fpos: self.curr_pos,
            fsize: self.file_max,
            seqid: self.seqid,
            uuid: self.uuid,
            version: self.version,
            nr_changed_blocks: self.nr_changed_blocks,
        };
        self.file()?.write_all_at(&header.encode(), 0)
    }

    /// Read and validate the header, then immediately rewrite it dirty so a
    /// crash between now and the next clean close is detectable.
    fn open_header(&mut self, index_only: bool, reset_vmalloc: bool) -> io::Result<()> {
        let mut buf = [0u8; HEADER_ENCODED_LEN];
        self.file()?.read_exact_at(&mut buf, 0)?;
        let header = CowHeader::decode(&buf);

        if header.magic != COW_MAGIC {
            error!("bad magic number found in cow file: {}", header.magic);
            return Err(errno(libc::EINVAL));
        }
        if header.flags & COW_CLEAN == 0 {
            error!("cow file not left in clean state: {}", header.flags);
            return Err(errno(libc::EINVAL));
        }
        if (header.flags & COW_INDEX_ONLY != 0) != index_only {
            error!(
                "cow file not left in {} state: {}",
                if index_only { "index only" } else { "data tracking" },
                header.flags
            );
            return Err(errno(libc::EINVAL));
        }

        debug!(
            "cow header opened with file pos = {}, seqid = {}",
            header.fpos, header.seqid
        );

        self.flags = if reset_vmalloc {
            header.flags & !COW_VMALLOC_UPPER
        } else {
            header.flags
        };
        self.curr_pos = header.fpos;
        self.file_max = header.fsize;
        self.seqid = header.seqid;
        self.uuid = header.uuid;
        self.version = header.version;
        self.nr_changed_blocks = header.nr_changed_blocks;

        self.write_header(false)
    }

    fn section_file_offset(&self, sect_idx: u64) -> u64 {
        COW_HEADER_SIZE + sect_idx * self.sect_size * 8
    }

    fn alloc_section(&mut self, sect_idx: u64) {
        let sect = &mut self.sects[sect_idx as usize];
        sect.mappings = Some(vec![0u64; self.sect_size as usize].into_boxed_slice());
        sect.has_data = true;
        sect.dirty = false;
        self.allocated_sects += 1;
    }

    fn load_section(&mut self, sect_idx: u64) -> io::Result<()> {
        let mut raw = vec![0u8; (self.sect_size * 8) as usize];
        self.file()?
            .read_exact_at(&mut raw, self.section_file_offset(sect_idx))?;

        let mappings: Box<[u64]> = raw
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();

        let sect = &mut self.sects[sect_idx as usize];
        sect.mappings = Some(mappings);
        sect.has_data = true;
        sect.dirty = false;
        self.allocated_sects += 1;
        Ok(())
    }

    fn write_section(&self, sect_idx: u64) -> io::Result<()> {
        let Some(mappings) = self.sects[sect_idx as usize].mappings.as_ref() else {
            return Ok(());
        };
        let mut raw = Vec::with_capacity(mappings.len() * 8);
        for m in mappings.iter() {
            raw.extend_from_slice(&m.to_le_bytes());
        }
        self.file()?.write_all_at(&raw, self.section_file_offset(sect_idx))
    }

    fn free_section(&mut self, sect_idx: u64) {
        self.sects[sect_idx as usize].mappings = None;
        self.sects[sect_idx as usize].dirty = false;
        self.allocated_sects -= 1;
    }

    /// Flush and free resident sections. With `thresh == 0` every resident
    /// section goes; otherwise only sections at or below the usage
    /// threshold are dropped, and only until the cache is half empty.
    fn sync_and_free_sections(&mut self, thresh: u64) -> io::Result<()> {
        for i in 0..self.total_sects {
            if thresh != 0 && self.allocated_sects <= self.allowed_sects / 2 {
                break;
            }
            if self.sects[i as usize].mappings.is_some()
                && (thresh == 0 || self.sects[i as usize].usage <= thresh)
            {
                if self.sects[i as usize].dirty {
                    self.write_section(i)?;
                }
                self.free_section(i);
            }
        }
        for sect in &mut self.sects {
            sect.usage = 0;
        }
        Ok(())
    }

    /// Evict toward the configured bound by approximating the median of the
    /// per-section usage counters with a binary refinement, then freeing
    /// everything at or below it.
    fn cleanup_mappings(&mut self) -> io::Result<()> {
        let mut thresh = self.sects.iter().map(|s| s.usage).max().unwrap_or(0) / 2;
        let mut granularity = thresh;
        while granularity > 0 {
            granularity >>= 1;
            let mut less = 0u64;
            let mut greater = 0u64;
            for sect in &self.sects {
                if sect.usage <= thresh {
                    less += 1;
                } else {
                    greater += 1;
                }
            }
            if greater > less {
                thresh += granularity;
            } else if greater < less {
                thresh -= granularity;
            } else {
                break;
            }
        }

        self.sync_and_free_sections(thresh)
    }

    fn section_for(&self, pos: u64) -> (u64, usize) {
        (pos / self.sect_size, (pos % self.sect_size) as usize)
    }

    fn ensure_resident(&mut self, sect_idx: u64) -> io::Result<bool> {
        if self.sects[sect_idx as usize].mappings.is_some() {
            return Ok(true);
        }
        if !self.sects[sect_idx as usize].has_data {
            return Ok(false);
        }
        self.load_section(sect_idx)?;
        Ok(true)
    }

    pub fn read_mapping(&mut self, pos: u64) -> io::Result<u64> {
        let (sect_idx, sect_pos) = self.section_for(pos);
        self.sects[sect_idx as usize].usage += 1;

        if !self.ensure_resident(sect_idx)? {
            return Ok(0);
        }
        let value = self.sects[sect_idx as usize].mappings.as_ref().unwrap()[sect_pos];

        if self.allocated_sects > self.allowed_sects {
            self.cleanup_mappings()?;
        }
        Ok(value)
    }

    fn write_mapping(&mut self, pos: u64, val: u64) -> io::Result<()> {
        let (sect_idx, sect_pos) = self.section_for(pos);
        self.sects[sect_idx as usize].usage += 1;

        if !self.ensure_resident(sect_idx)? {
            self.alloc_section(sect_idx);
        }

        let sect = &mut self.sects[sect_idx as usize];
        let mappings = sect.mappings.as_mut().unwrap();
        if self.version >= COW_VERSION_CHANGED_BLOCKS && val != 0 && mappings[sect_pos] == 0 {
            self.nr_changed_blocks += 1;
        }
        mappings[sect_pos] = val;
        sect.dirty = true;

        if self.allocated_sects > self.allowed_sects {
            self.cleanup_mappings()?;
        }
        Ok(())
    }

    /// Record an incremental-mode change without preserving data.
    pub fn write_filler_mapping(&mut self, pos: u64) -> io::Result<()> {
        self.write_mapping(pos, COW_FILLER_MAPPING)
    }

    fn write_data(&mut self, buf: &[u8]) -> io::Result<()> {
        let curr_byte = self.curr_pos * COW_BLOCK_SIZE;
        if curr_byte >= self.file_max {
            error!(
                "cow file '{}' max size exceeded ({curr_byte}/{})",
                self.path.display(),
                self.file_max
            );
            return Err(errno(libc::EFBIG));
        }
        self.file()?.write_all_at(buf, curr_byte)?;
        self.curr_pos += 1;
        Ok(())
    }

    /// Preserve one block's original contents, unless a previous write for
    /// the same logical block already did. First write wins; both steps
    /// happen under the caller's lock on the manager.
    pub fn write_block_if_new(&mut self, block: u64, buf: &[u8]) -> io::Result<()> {
        if self.read_mapping(block)? != 0 {
            return Ok(());
        }
        self.write_mapping(block, self.curr_pos)?;
        self.write_data(buf)
    }

    /// Read preserved data out of the COW file's data region.
    pub fn read_data(
        &self,
        buf: &mut [u8],
        block_pos: u64,
        block_off: u64,
    ) -> io::Result<()> {
        if block_off >= COW_BLOCK_SIZE {
            return Err(errno(libc::EINVAL));
        }
        self.file()?
            .read_exact_at(buf, block_pos * COW_BLOCK_SIZE + block_off)
    }

    /// Drop the data region on transition to incremental tracking.
    pub fn truncate_to_index(&mut self) -> io::Result<()> {
        self.flags |= COW_INDEX_ONLY;
        self.file()?.set_len(self.data_offset)
    }

    pub fn modify_cache_size(&mut self, cache_size: u64) {
        self.allowed_sects = calculate_allowed_sects(cache_size, self.total_sects, self.sect_size);
    }

    /// Flush everything and close the file handle, keeping the in-memory
    /// metadata so a dormant tracer can reopen later.
    pub fn sync_and_close(&mut self) -> io::Result<()> {
        let result = (|| {
            self.sync_and_free_sections(0)?;
            self.write_header(true)
        })();

        match result {
            Ok(()) => {
                self.file = None;
                Ok(())
            }
            Err(err) => {
                error!("error while syncing and closing cow manager: {err}");
                self.unlink_file();
                Err(err)
            }
        }
    }

    /// Flush, mark clean and release everything; the file stays on disk.
    pub fn sync_and_free(mut self) -> io::Result<()> {
        self.sync_and_close()
    }

    /// Failure path: release memory and remove the COW file.
    pub fn free(mut self) {
        self.unlink_file();
    }

    fn unlink_file(&mut self) {
        self.file = None;
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("error unlinking cow file '{}': {err}", self.path.display());
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn uuid(&self) -> [u8; COW_UUID_SIZE] {
        self.uuid
    }

    pub fn seqid(&self) -> u64 {
        self.seqid
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn nr_changed_blocks(&self) -> u64 {
        self.nr_changed_blocks
    }

    pub fn file_max(&self) -> u64 {
        self.file_max
    }

    pub fn curr_pos(&self) -> u64 {
        self.curr_pos
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn index_only(&self) -> bool {
        self.flags & COW_INDEX_ONLY != 0
    }

    #[cfg(test)]
    pub fn set_file_max(&mut self, file_max: u64) {
        self.file_max = file_max;
    }

    #[cfg(test)]
    fn allocated_sects(&self) -> u64 {
        self.allocated_sects
    }

    #[cfg(test)]
    fn allowed_sects(&self) -> u64 {
        self.allowed_sects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cow_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("image.cow")
    }

    #[test]
    fn header_roundtrip() {
        let header = CowHeader {
            magic: COW_MAGIC,
            flags: COW_CLEAN | COW_INDEX_ONLY,
            fpos: 1234,
            fsize: 1 << 30,
            seqid: 7,
            uuid: *b"0123456789abcdef",
            version: COW_VERSION_CHANGED_BLOCKS,
            nr_changed_blocks: 42,
        };
        assert_eq!(CowHeader::decode(&header.encode()), header);
    }

    #[test]
    fn mapping_roundtrip_under_eviction_pressure() {
        let dir = tempfile::tempdir().unwrap();
        // 64 mappings per section, tiny cache: constant eviction churn.
        let mut cm = CowManager::init(&cow_path(&dir), 1024, 64, 1, 1 << 20, None, 1).unwrap();

        for block in 0..1024u64 {
            cm.write_mapping(block, block + 100).unwrap();
        }
        for block in (0..1024u64).rev() {
            assert_eq!(cm.read_mapping(block).unwrap(), block + 100);
        }
    }

    #[test]
    fn cache_stays_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let sect_size = 64u64;
        let total_sects = 16u64;
        let meta = total_sects * std::mem::size_of::<CowSection>() as u64;
        // Room for four resident sections.
        let cache = meta + 4 * sect_size * 8;
        let mut cm = CowManager::init(
            &cow_path(&dir),
            total_sects * sect_size,
            sect_size,
            cache,
            1 << 20,
            None,
            1,
        )
        .unwrap();
        assert_eq!(cm.allowed_sects(), 4);

        for block in 0..(total_sects * sect_size) {
            cm.write_mapping(block, block + 2).unwrap();
            assert!(cm.allocated_sects() <= cm.allowed_sects() + 1);
        }
    }

    #[test]
    fn first_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut cm =
            CowManager::init(&cow_path(&dir), 64, COW_SECTION_SIZE, 1 << 20, 1 << 24, None, 1)
                .unwrap();
        let first_data_block = cm.data_offset() / COW_BLOCK_SIZE;

        cm.write_block_if_new(3, &[b'A'; COW_BLOCK_SIZE as usize]).unwrap();
        assert_eq!(cm.curr_pos(), first_data_block + 1);

        cm.write_block_if_new(3, &[b'B'; COW_BLOCK_SIZE as usize]).unwrap();
        assert_eq!(cm.curr_pos(), first_data_block + 1, "repeat write must not allocate");

        let mapping = cm.read_mapping(3).unwrap();
        assert_eq!(mapping, first_data_block);
        let mut buf = [0u8; COW_BLOCK_SIZE as usize];
        cm.read_data(&mut buf, mapping, 0).unwrap();
        assert!(buf.iter().all(|b| *b == b'A'));
        assert_eq!(cm.nr_changed_blocks(), 1);
    }

    #[test]
    fn data_write_hits_file_max() {
        let dir = tempfile::tempdir().unwrap();
        let file_max = COW_HEADER_SIZE + COW_SECTION_SIZE * 8 + 2 * COW_BLOCK_SIZE;
        let mut cm =
            CowManager::init(&cow_path(&dir), 64, COW_SECTION_SIZE, 1 << 20, file_max, None, 1)
                .unwrap();
        assert_eq!(cm.file_max(), cm.data_offset() + 2 * COW_BLOCK_SIZE);

        let buf = [0u8; COW_BLOCK_SIZE as usize];
        cm.write_block_if_new(0, &buf).unwrap();
        cm.write_block_if_new(1, &buf).unwrap();
        let err = cm.write_block_if_new(2, &buf).unwrap_err();
        assert_eq!(crate::errno::code_of(&err), libc::EFBIG);
    }

    #[test]
    fn reload_requires_clean_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = cow_path(&dir);
        {
            let _cm =
                CowManager::init(&path, 64, COW_SECTION_SIZE, 1 << 20, 1 << 24, None, 1).unwrap();
            // Dropped while dirty.
        }
        let err = CowManager::reload(&path, 64, COW_SECTION_SIZE, 1 << 20, false).unwrap_err();
        assert_eq!(crate::errno::code_of(&err), libc::EINVAL);
    }

    #[test]
    fn reload_roundtrips_mappings_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = cow_path(&dir);
        let uuid;
        {
            let mut cm =
                CowManager::init(&path, 256, 64, 1 << 20, 1 << 24, None, 3).unwrap();
            uuid = cm.uuid();
            cm.write_block_if_new(9, &[0x5a; COW_BLOCK_SIZE as usize]).unwrap();
            cm.sync_and_free().unwrap();
        }
        assert!(path.exists());

        let mut cm = CowManager::reload(&path, 256, 64, 1 << 20, false).unwrap();
        assert_eq!(cm.uuid(), uuid);
        assert_eq!(cm.seqid(), 3);
        assert_eq!(cm.nr_changed_blocks(), 1);
        let mapping = cm.read_mapping(9).unwrap();
        assert_ne!(mapping, 0);
        let mut buf = [0u8; COW_BLOCK_SIZE as usize];
        cm.read_data(&mut buf, mapping, 0).unwrap();
        assert!(buf.iter().all(|b| *b == 0x5a));
        assert_eq!(cm.read_mapping(10).unwrap(), 0);
    }

    #[test]
    fn index_only_state_must_match_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = cow_path(&dir);
        {
            let mut cm =
                CowManager::init(&path, 64, COW_SECTION_SIZE, 1 << 20, 1 << 24, None, 1).unwrap();
            cm.truncate_to_index().unwrap();
            cm.sync_and_free().unwrap();
        }
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            COW_HEADER_SIZE + COW_SECTION_SIZE * 8
        );

        let err = CowManager::reload(&path, 64, COW_SECTION_SIZE, 1 << 20, false).unwrap_err();
        assert_eq!(crate::errno::code_of(&err), libc::EINVAL);
        assert!(CowManager::reload(&path, 64, COW_SECTION_SIZE, 1 << 20, true).is_ok());
    }

    #[test]
    fn failed_init_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = cow_path(&dir);
        let cm = CowManager::init(&path, 64, COW_SECTION_SIZE, 1 << 20, 1 << 24, None, 1).unwrap();
        cm.free();
        assert!(!path.exists());
    }

    #[test]
    fn dormant_reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = cow_path(&dir);
        let mut cm = CowManager::init(&path, 256, 64, 1 << 20, 1 << 24, None, 5).unwrap();
        cm.write_block_if_new(17, &[0x17; COW_BLOCK_SIZE as usize]).unwrap();
        cm.sync_and_close().unwrap();

        cm.reopen(&path).unwrap();
        assert_eq!(cm.seqid(), 5);
        let mapping = cm.read_mapping(17).unwrap();
        assert_ne!(mapping, 0);
        let mut buf = [0u8; COW_BLOCK_SIZE as usize];
        cm.read_data(&mut buf, mapping, 0).unwrap();
        assert!(buf.iter().all(|b| *b == 0x17));
    }
}
