//! Mount-driven automatic transitions.
//!
//! The engine consumes mount and unmount notifications for filesystem
//! paths: unmounting (or remounting read-only) the filesystem holding a
//! tracer's COW file parks the tracer dormant, and a writable mount of a
//! tracked device wakes dormant and unverified tracers back up. The daemon
//! feeds these events from a watcher thread that diffs the kernel mount
//! table on an interval; the handlers themselves only consume decoded
//! events plus a snapshot of the table.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, warn};

use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Mount,
    Umount,
    RemountRo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEvent {
    pub path: PathBuf,
    pub kind: MountKind,
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Source device of the mount, e.g. `/dev/sda1`.
    pub source: PathBuf,
    pub mount_point: PathBuf,
    pub writable: bool,
}

/// A point-in-time view of the mount table.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn new(entries: Vec<MountEntry>) -> Self {
        Self { entries }
    }

    pub fn current() -> io::Result<Self> {
        let process = procfs::process::Process::myself()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let mounts = process
            .mountinfo()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let entries = mounts
            .0
            .into_iter()
            .filter_map(|mi| {
                let source = mi.mount_source?;
                if !source.starts_with('/') {
                    return None;
                }
                Some(MountEntry {
                    source: PathBuf::from(source),
                    writable: mi.mount_options.contains_key("rw"),
                    mount_point: mi.mount_point,
                })
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn entry_at(&self, mount_point: &Path) -> Option<&MountEntry> {
        self.entries.iter().find(|e| e.mount_point == mount_point)
    }

    pub fn mount_of_source(&self, source: &Path) -> Option<&MountEntry> {
        self.entries.iter().find(|e| paths_match(&e.source, source))
    }

    pub fn source_mounted_writable(&self, source: &Path) -> bool {
        self.mount_of_source(source).is_some_and(|e| e.writable)
    }
}

/// Compare device paths, resolving symlinks when possible so that
/// `/dev/disk/by-uuid/...` style paths still match.
fn paths_match(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => false,
    }
}

/// Apply one mount event to the engine. `table` is the mount table as it
/// stands after the event. Runs under the global control mutex.
pub fn handle_mount_event(registry: &Arc<Registry>, table: &MountTable, event: &MountEvent) {
    let _guard = registry.lock_control();
    match event.kind {
        MountKind::Mount if event.writable => handle_mounted_writable(registry, table, &event.path),
        // New read-only mounts do not affect tracing.
        MountKind::Mount => {}
        MountKind::Umount | MountKind::RemountRo => {
            handle_unmounted(registry, table, &event.path)
        }
    }
}

fn handle_unmounted(registry: &Arc<Registry>, table: &MountTable, path: &Path) {
    for dev in registry.tracers_in_range() {
        if !dev.is_active() || dev.read_fail_state() != 0 {
            continue;
        }
        if dev.cow_mount().as_deref() != Some(path) {
            continue;
        }

        debug!("block device umount detected for device {}", dev.minor());
        dev.active_to_dormant();

        // Verify the unmount actually detached the filesystem.
        let bdev_path = dev.bdev_path();
        if !bdev_path.exists() {
            debug!("base device gone, moving to error state");
            dev.set_fail_state(libc::ENODEV);
        } else if table.source_mounted_writable(&bdev_path) {
            error!(
                "device still mounted after umounting cow file's file-system, entering error state"
            );
            dev.set_fail_state(libc::EIO);
        }
        return;
    }
}

fn handle_mounted_writable(registry: &Arc<Registry>, table: &MountTable, mount_point: &Path) {
    let Some(entry) = table.entry_at(mount_point) else {
        return;
    };

    for dev in registry.tracers_in_range() {
        if dev.is_active() || dev.read_fail_state() != 0 {
            continue;
        }
        if !paths_match(&dev.bdev_path(), &entry.source) {
            continue;
        }

        if dev.is_unverified() {
            debug!("block device mount detected for unverified device {}", dev.minor());
            let _ = dev.unverified_to_active(registry, mount_point);
        } else {
            debug!("block device mount detected for dormant device {}", dev.minor());
            let _ = dev.dormant_to_active(mount_point);
        }
        return;
    }
}

/// Differences between two mount-table snapshots, as engine events.
pub fn diff_tables(prev: &MountTable, now: &MountTable) -> Vec<MountEvent> {
    let mut events = Vec::new();

    for old in &prev.entries {
        match now.entry_at(&old.mount_point) {
            None => events.push(MountEvent {
                path: old.mount_point.clone(),
                kind: MountKind::Umount,
                writable: false,
            }),
            Some(new) if old.writable && !new.writable => events.push(MountEvent {
                path: old.mount_point.clone(),
                kind: MountKind::RemountRo,
                writable: false,
            }),
            Some(_) => {}
        }
    }

    for new in &now.entries {
        if prev.entry_at(&new.mount_point).is_none() {
            events.push(MountEvent {
                path: new.mount_point.clone(),
                kind: MountKind::Mount,
                writable: new.writable,
            });
        }
    }

    events
}

/// Polls the mount table and feeds the diff into the transition handlers.
pub struct MountWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MountWatcher {
    pub fn spawn(registry: Arc<Registry>, poll_interval: Duration) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("blocksnap_mounts".to_string())
            .spawn(move || watch_loop(registry, poll_interval, flag))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn watch_loop(registry: Arc<Registry>, poll_interval: Duration, stop: Arc<AtomicBool>) {
    let mut prev = match MountTable::current() {
        Ok(table) => table,
        Err(err) => {
            warn!("mount watcher could not read the mount table: {err}");
            MountTable::default()
        }
    };

    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(poll_interval);
        if stop.load(Ordering::Acquire) {
            break;
        }

        let now = match MountTable::current() {
            Ok(table) => table,
            Err(err) => {
                warn!("mount watcher could not read the mount table: {err}");
                continue;
            }
        };

        for event in diff_tables(&prev, &now) {
            debug!("mount event: {:?} {}", event.kind, event.path.display());
            handle_mount_event(&registry, &now, &event);
        }
        prev = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::tracer::Tracer;
    use std::fs::File;
    use std::io::Write;

    fn table(entries: &[(&Path, &Path, bool)]) -> MountTable {
        MountTable::new(
            entries
                .iter()
                .map(|(source, mount_point, writable)| MountEntry {
                    source: source.to_path_buf(),
                    mount_point: mount_point.to_path_buf(),
                    writable: *writable,
                })
                .collect(),
        )
    }

    #[test]
    fn diff_detects_mount_umount_and_remount_ro() {
        let a = Path::new("/dev/sda1");
        let b = Path::new("/dev/sdb1");
        let prev = table(&[(a, Path::new("/mnt/a"), true), (b, Path::new("/mnt/b"), true)]);
        let now = table(&[(b, Path::new("/mnt/b"), false), (a, Path::new("/mnt/c"), true)]);

        let events = diff_tables(&prev, &now);
        assert!(events.contains(&MountEvent {
            path: PathBuf::from("/mnt/a"),
            kind: MountKind::Umount,
            writable: false,
        }));
        assert!(events.contains(&MountEvent {
            path: PathBuf::from("/mnt/b"),
            kind: MountKind::RemountRo,
            writable: false,
        }));
        assert!(events.contains(&MountEvent {
            path: PathBuf::from("/mnt/c"),
            kind: MountKind::Mount,
            writable: true,
        }));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn umount_parks_tracer_and_mount_wakes_it() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.img");
        let mut f = File::create(&base_path).unwrap();
        f.write_all(&vec![b'A'; 8 * 4096]).unwrap();
        drop(f);

        let registry = Registry::new(EngineConfig::default());
        let dev = Tracer::setup_active_snap(
            &registry,
            0,
            &base_path,
            &dir.path().join("cow.snap"),
            Path::new("/cow.snap"),
            dir.path(),
            64,
            0,
        )
        .unwrap();
        assert!(dev.is_active());

        // Unmount of the filesystem holding the COW file: tracer parks.
        let after_umount = table(&[]);
        handle_mount_event(
            &registry,
            &after_umount,
            &MountEvent {
                path: dir.path().to_path_buf(),
                kind: MountKind::Umount,
                writable: false,
            },
        );
        assert!(!dev.is_active());
        assert_eq!(dev.read_fail_state(), 0);

        // The device shows up mounted writable again: tracer wakes.
        let canonical_base = std::fs::canonicalize(&base_path).unwrap();
        let after_mount = table(&[(canonical_base.as_path(), dir.path(), true)]);
        handle_mount_event(
            &registry,
            &after_mount,
            &MountEvent {
                path: dir.path().to_path_buf(),
                kind: MountKind::Mount,
                writable: true,
            },
        );
        assert!(dev.is_active());
        assert_eq!(dev.read_fail_state(), 0);

        dev.destroy(&registry);
    }

    #[test]
    fn failed_unmount_moves_tracer_to_error_state() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.img");
        let mut f = File::create(&base_path).unwrap();
        f.write_all(&vec![b'A'; 8 * 4096]).unwrap();
        drop(f);

        let registry = Registry::new(EngineConfig::default());
        let dev = Tracer::setup_active_snap(
            &registry,
            0,
            &base_path,
            &dir.path().join("cow.snap"),
            Path::new("/cow.snap"),
            dir.path(),
            64,
            0,
        )
        .unwrap();

        // The table still shows the base mounted writable after the event.
        let canonical_base = std::fs::canonicalize(&base_path).unwrap();
        let still_mounted = table(&[(canonical_base.as_path(), dir.path(), true)]);
        handle_mount_event(
            &registry,
            &still_mounted,
            &MountEvent {
                path: dir.path().to_path_buf(),
                kind: MountKind::Umount,
                writable: false,
            },
        );
        assert!(!dev.is_active());
        assert_eq!(dev.read_fail_state(), libc::EIO);

        dev.destroy(&registry);
    }
}
