//! Control surface: decoded request records and their dispatch.
//!
//! The transport is someone else's problem; this module receives already
//! decoded records, validates them against the registry and the mount
//! table, and drives the matching tracer transition. Everything runs under
//! the global control mutex.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errno::errno;
use crate::mount::MountTable;
use crate::registry::Registry;
use crate::tracer::Tracer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupParams {
    pub minor: u32,
    /// Path of the block device to snapshot.
    pub bdev: String,
    /// Path of the COW file to create.
    pub cow: String,
    /// Space allocated to the COW file, in megabytes. 0 sizes it from the
    /// configured percentage of the device.
    #[serde(default)]
    pub fallocated_space: u64,
    /// Maximum section-cache size in bytes. 0 uses the configured default.
    #[serde(default)]
    pub cache_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadParams {
    pub minor: u32,
    pub bdev: String,
    /// COW file path relative to the mountpoint the device will appear at.
    pub cow: String,
    #[serde(default)]
    pub cache_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionSnapParams {
    pub minor: u32,
    pub cow: String,
    #[serde(default)]
    pub fallocated_space: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconfigureParams {
    pub minor: u32,
    pub cache_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub enum ControlRequest {
    SetupSnapshot(SetupParams),
    ReloadSnapshot(ReloadParams),
    ReloadIncremental(ReloadParams),
    Destroy { minor: u32 },
    TransitionToIncremental { minor: u32 },
    TransitionToSnapshot(TransitionSnapParams),
    Reconfigure(ReconfigureParams),
    Info { minor: u32 },
    GetFreeMinor,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ControlReply {
    Done { status: &'static str },
    Info(TracerInfo),
    FreeMinor { minor: u32 },
}

impl ControlReply {
    fn ok() -> Self {
        ControlReply::Done { status: "ok" }
    }
}

/// Per-tracer record surfaced by `info` and the daemon status JSON.
#[derive(Debug, Clone, Serialize)]
pub struct TracerInfo {
    pub minor: u32,
    pub cow_file: String,
    pub block_device: String,
    pub max_cache: u64,
    pub fallocate: u64,
    pub seq_id: u64,
    pub uuid: String,
    pub version: u64,
    pub nr_changed_blocks: u64,
    pub error: i32,
    pub state: u32,
}

#[derive(Debug, Serialize)]
pub struct DaemonInfo {
    pub version: String,
    pub devices: Vec<TracerInfo>,
}

fn build_info(config: &EngineConfig, dev: &Tracer) -> TracerInfo {
    let max_cache = if dev.cache_size() != 0 {
        dev.cache_size()
    } else {
        config.cow_max_memory_default
    };

    let mut info = TracerInfo {
        minor: dev.minor(),
        cow_file: dev.cow_path_rel().display().to_string(),
        block_device: dev.bdev_path().display().to_string(),
        max_cache,
        fallocate: 0,
        seq_id: 0,
        uuid: String::new(),
        version: 0,
        nr_changed_blocks: 0,
        error: dev.read_fail_state(),
        state: dev.state_bits(),
    };

    if !dev.is_unverified() {
        if let Some(cow) = dev.cow_summary() {
            info.fallocate = cow.file_max;
            info.seq_id = cow.seqid;
            info.uuid = uuid::Uuid::from_bytes(cow.uuid).simple().to_string();
            info.version = cow.version;
            info.nr_changed_blocks = cow.nr_changed_blocks;
        }
    }
    info
}

/// Daemon-wide status record, every registered tracer included.
pub fn daemon_info(registry: &Arc<Registry>) -> DaemonInfo {
    let _guard = registry.lock_control();
    DaemonInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        devices: registry
            .tracers()
            .iter()
            .map(|dev| build_info(registry.config(), dev))
            .collect(),
    }
}

enum MinorCheck {
    Available,
    InUseNotBusy,
    InUse,
}

fn verify_minor(registry: &Registry, minor: u32, mode: MinorCheck) -> io::Result<()> {
    if minor >= registry.max_devices() {
        return Err(errno(libc::EINVAL));
    }
    match mode {
        MinorCheck::Available => {
            if registry.get(minor).is_some() {
                return Err(errno(libc::EBUSY));
            }
        }
        MinorCheck::InUseNotBusy | MinorCheck::InUse => {
            let Some(dev) = registry.get(minor) else {
                return Err(errno(libc::ENOENT));
            };
            if matches!(mode, MinorCheck::InUseNotBusy) && dev.refs() != 0 {
                return Err(errno(libc::EBUSY));
            }
        }
    }
    Ok(())
}

/// COW file path relative to the mountpoint it lives under; `EINVAL` when
/// the file is not on the base device's filesystem.
fn cow_rel_path(cow_path: &Path, mount_point: &Path) -> io::Result<PathBuf> {
    let stripped = cow_path
        .strip_prefix(mount_point)
        .map_err(|_| errno(libc::EINVAL))?;
    Ok(Path::new("/").join(stripped))
}

#[allow(clippy::too_many_arguments)]
fn setup(
    registry: &Arc<Registry>,
    mounts: &MountTable,
    minor: u32,
    bdev: &str,
    cow: &str,
    fallocated_space: u64,
    cache_size: u64,
    is_snap: bool,
    is_reload: bool,
) -> io::Result<()> {
    debug!(
        "received {} {} request - {minor} : {bdev} : {cow}",
        if is_reload { "reload" } else { "setup" },
        if is_snap { "snap" } else { "inc" },
    );

    verify_minor(registry, minor, MinorCheck::Available)?;

    let bdev_path = Path::new(bdev);
    let is_mounted = mounts.source_mounted_writable(bdev_path);
    if is_mounted && is_reload {
        debug!("illegal to perform reload while mounted");
        return Err(errno(libc::EINVAL));
    }
    if !is_mounted && !is_reload {
        debug!("illegal to perform setup while unmounted");
        return Err(errno(libc::EINVAL));
    }

    if is_snap {
        if is_mounted {
            let mount_point = mounts
                .mount_of_source(bdev_path)
                .map(|e| e.mount_point.clone())
                .ok_or_else(|| errno(libc::EINVAL))?;
            let cow_path = PathBuf::from(cow);
            let rel = cow_rel_path(&cow_path, &mount_point)?;
            Tracer::setup_active_snap(
                registry,
                minor,
                bdev_path,
                &cow_path,
                &rel,
                &mount_point,
                fallocated_space,
                cache_size,
            )?;
        } else {
            Tracer::setup_unverified(registry, minor, bdev_path, Path::new(cow), cache_size, true);
        }
    } else if !is_mounted {
        Tracer::setup_unverified(registry, minor, bdev_path, Path::new(cow), cache_size, false);
    } else {
        debug!("illegal to setup as active incremental");
        return Err(errno(libc::EINVAL));
    }

    Ok(())
}

fn destroy(registry: &Arc<Registry>, minor: u32) -> io::Result<()> {
    debug!("received destroy request - {minor}");
    verify_minor(registry, minor, MinorCheck::InUseNotBusy)?;
    if let Some(dev) = registry.get(minor) {
        dev.destroy(registry);
    }
    Ok(())
}

fn not_failed_and_in_state(dev: &Tracer, want_bits: u32, forbid_bits: u32) -> io::Result<()> {
    if dev.read_fail_state() != 0 {
        debug!("device specified is in the fail state");
        return Err(errno(libc::EINVAL));
    }
    let state = dev.state_bits();
    if state & want_bits != want_bits || state & forbid_bits != 0 {
        return Err(errno(libc::EINVAL));
    }
    Ok(())
}

fn transition_inc(registry: &Arc<Registry>, minor: u32) -> io::Result<()> {
    debug!("received transition inc request - {minor}");
    verify_minor(registry, minor, MinorCheck::InUseNotBusy)?;
    let dev = registry.get(minor).ok_or_else(|| errno(libc::ENOENT))?;
    not_failed_and_in_state(&dev, crate::tracer::SNAPSHOT | crate::tracer::ACTIVE, 0)?;

    Tracer::active_snap_to_inc(registry, &dev)?;
    Ok(())
}

fn transition_snap(
    registry: &Arc<Registry>,
    mounts: &MountTable,
    minor: u32,
    cow: &str,
    fallocated_space: u64,
) -> io::Result<()> {
    debug!("received transition snap request - {minor} : {cow}");
    verify_minor(registry, minor, MinorCheck::InUseNotBusy)?;
    let dev = registry.get(minor).ok_or_else(|| errno(libc::ENOENT))?;
    not_failed_and_in_state(&dev, crate::tracer::ACTIVE, crate::tracer::SNAPSHOT)?;

    let mount_point = mounts
        .mount_of_source(&dev.bdev_path())
        .map(|e| e.mount_point.clone())
        .ok_or_else(|| errno(libc::EINVAL))?;
    let cow_path = PathBuf::from(cow);
    let rel = cow_rel_path(&cow_path, &mount_point)?;

    Tracer::active_inc_to_snap(
        registry,
        &dev,
        &cow_path,
        &rel,
        &mount_point,
        fallocated_space,
    )?;
    Ok(())
}

fn reconfigure(registry: &Arc<Registry>, minor: u32, cache_size: u64) -> io::Result<()> {
    debug!("received reconfigure request - {minor} : {cache_size}");
    verify_minor(registry, minor, MinorCheck::InUseNotBusy)?;
    let dev = registry.get(minor).ok_or_else(|| errno(libc::ENOENT))?;
    if dev.read_fail_state() != 0 {
        return Err(errno(libc::EINVAL));
    }
    dev.reconfigure(registry.config(), cache_size);
    Ok(())
}

fn info(registry: &Arc<Registry>, minor: u32) -> io::Result<TracerInfo> {
    debug!("received info request - {minor}");
    verify_minor(registry, minor, MinorCheck::InUse)?;
    let dev = registry.get(minor).ok_or_else(|| errno(libc::ENOENT))?;
    Ok(build_info(registry.config(), &dev))
}

/// Entry point for the transport layer: dispatch one decoded request under
/// the global control mutex.
pub fn dispatch(
    registry: &Arc<Registry>,
    mounts: &MountTable,
    request: ControlRequest,
) -> io::Result<ControlReply> {
    let _guard = registry.lock_control();

    match request {
        ControlRequest::SetupSnapshot(p) => {
            setup(
                registry,
                mounts,
                p.minor,
                &p.bdev,
                &p.cow,
                p.fallocated_space,
                p.cache_size,
                true,
                false,
            )?;
            Ok(ControlReply::ok())
        }
        ControlRequest::ReloadSnapshot(p) => {
            setup(
                registry, mounts, p.minor, &p.bdev, &p.cow, 0, p.cache_size, true, true,
            )?;
            Ok(ControlReply::ok())
        }
        ControlRequest::ReloadIncremental(p) => {
            setup(
                registry, mounts, p.minor, &p.bdev, &p.cow, 0, p.cache_size, false, true,
            )?;
            Ok(ControlReply::ok())
        }
        ControlRequest::Destroy { minor } => {
            destroy(registry, minor)?;
            Ok(ControlReply::ok())
        }
        ControlRequest::TransitionToIncremental { minor } => {
            transition_inc(registry, minor)?;
            Ok(ControlReply::ok())
        }
        ControlRequest::TransitionToSnapshot(p) => {
            transition_snap(registry, mounts, p.minor, &p.cow, p.fallocated_space)?;
            Ok(ControlReply::ok())
        }
        ControlRequest::Reconfigure(p) => {
            reconfigure(registry, p.minor, p.cache_size)?;
            Ok(ControlReply::ok())
        }
        ControlRequest::Info { minor } => Ok(ControlReply::Info(info(registry, minor)?)),
        ControlRequest::GetFreeMinor => {
            let minor = registry.free_minor().ok_or_else(|| errno(libc::ENOENT))?;
            Ok(ControlReply::FreeMinor { minor })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::errno::code_of;
    use crate::mount::MountEntry;
    use crate::tracer::{ACTIVE, SNAPSHOT, UNVERIFIED};
    use std::fs::File;
    use std::io::Write;

    struct Rig {
        dir: tempfile::TempDir,
        registry: Arc<Registry>,
        base_path: PathBuf,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.img");
        let mut f = File::create(&base_path).unwrap();
        f.write_all(&vec![b'A'; 8 * 4096]).unwrap();
        drop(f);
        Rig {
            registry: Registry::new(EngineConfig::default()),
            dir,
            base_path,
        }
    }

    impl Rig {
        fn mounted(&self) -> MountTable {
            MountTable::new(vec![MountEntry {
                source: self.base_path.clone(),
                mount_point: self.dir.path().to_path_buf(),
                writable: true,
            }])
        }

        fn unmounted(&self) -> MountTable {
            MountTable::new(Vec::new())
        }

        fn setup_request(&self) -> ControlRequest {
            ControlRequest::SetupSnapshot(SetupParams {
                minor: 0,
                bdev: self.base_path.display().to_string(),
                cow: self.dir.path().join("cow.snap").display().to_string(),
                fallocated_space: 64,
                cache_size: 0,
            })
        }
    }

    #[test]
    fn free_minor_on_empty_registry() {
        let r = rig();
        let reply = dispatch(&r.registry, &r.unmounted(), ControlRequest::GetFreeMinor).unwrap();
        match reply {
            ControlReply::FreeMinor { minor } => assert_eq!(minor, 0),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn setup_snapshot_then_info_reports_state() {
        let r = rig();
        dispatch(&r.registry, &r.mounted(), r.setup_request()).unwrap();

        let reply = dispatch(
            &r.registry,
            &r.mounted(),
            ControlRequest::Info { minor: 0 },
        )
        .unwrap();
        let ControlReply::Info(info) = reply else {
            panic!("expected info reply");
        };
        assert_eq!(info.minor, 0);
        assert_eq!(info.state, SNAPSHOT | ACTIVE);
        assert_eq!(info.seq_id, 1);
        assert_eq!(info.error, 0);
        assert_eq!(info.uuid.len(), 32);
        assert_eq!(info.cow_file, "/cow.snap");
        assert_eq!(info.fallocate, 64 * 1024 * 1024);
        assert_eq!(info.max_cache, EngineConfig::default().cow_max_memory_default);

        // The next free minor moved on.
        let reply = dispatch(&r.registry, &r.mounted(), ControlRequest::GetFreeMinor).unwrap();
        match reply {
            ControlReply::FreeMinor { minor } => assert_eq!(minor, 1),
            other => panic!("unexpected reply: {other:?}"),
        }

        dispatch(&r.registry, &r.mounted(), ControlRequest::Destroy { minor: 0 }).unwrap();
    }

    #[test]
    fn second_destroy_returns_enoent() {
        let r = rig();
        dispatch(&r.registry, &r.mounted(), r.setup_request()).unwrap();
        dispatch(&r.registry, &r.mounted(), ControlRequest::Destroy { minor: 0 }).unwrap();

        let err = dispatch(&r.registry, &r.mounted(), ControlRequest::Destroy { minor: 0 })
            .unwrap_err();
        assert_eq!(code_of(&err), libc::ENOENT);
    }

    #[test]
    fn setup_requires_matching_mount_state() {
        let r = rig();

        // Setup needs the device mounted.
        let err = dispatch(&r.registry, &r.unmounted(), r.setup_request()).unwrap_err();
        assert_eq!(code_of(&err), libc::EINVAL);

        // Reload needs it unmounted.
        let reload = ControlRequest::ReloadSnapshot(ReloadParams {
            minor: 0,
            bdev: r.base_path.display().to_string(),
            cow: "/cow.snap".to_string(),
            cache_size: 0,
        });
        let err = dispatch(&r.registry, &r.mounted(), reload).unwrap_err();
        assert_eq!(code_of(&err), libc::EINVAL);

        // Active incremental cannot be created directly.
        let inc = ControlRequest::ReloadIncremental(ReloadParams {
            minor: 0,
            bdev: r.base_path.display().to_string(),
            cow: "/cow.snap".to_string(),
            cache_size: 0,
        });
        let err = dispatch(&r.registry, &r.mounted(), inc).unwrap_err();
        assert_eq!(code_of(&err), libc::EINVAL);
    }

    #[test]
    fn reload_registers_unverified_tracer() {
        let r = rig();
        let reload = ControlRequest::ReloadIncremental(ReloadParams {
            minor: 2,
            bdev: r.base_path.display().to_string(),
            cow: "/cow.snap".to_string(),
            cache_size: 0,
        });
        dispatch(&r.registry, &r.unmounted(), reload).unwrap();

        let reply = dispatch(
            &r.registry,
            &r.unmounted(),
            ControlRequest::Info { minor: 2 },
        )
        .unwrap();
        let ControlReply::Info(info) = reply else {
            panic!("expected info reply");
        };
        assert_eq!(info.state, UNVERIFIED);
        assert_eq!(info.seq_id, 0);
        assert_eq!(info.fallocate, 0);
        assert!(info.uuid.is_empty());

        // Unverified tracers cannot transition by request.
        let err = dispatch(
            &r.registry,
            &r.unmounted(),
            ControlRequest::TransitionToIncremental { minor: 2 },
        )
        .unwrap_err();
        assert_eq!(code_of(&err), libc::EINVAL);

        dispatch(&r.registry, &r.unmounted(), ControlRequest::Destroy { minor: 2 }).unwrap();
    }

    #[test]
    fn open_snapshot_handle_blocks_destroy() {
        let r = rig();
        dispatch(&r.registry, &r.mounted(), r.setup_request()).unwrap();

        let dev = r.registry.get(0).unwrap();
        let handle = dev.snapshot_device().unwrap().open().unwrap();

        let err = dispatch(&r.registry, &r.mounted(), ControlRequest::Destroy { minor: 0 })
            .unwrap_err();
        assert_eq!(code_of(&err), libc::EBUSY);

        drop(handle);
        dispatch(&r.registry, &r.mounted(), ControlRequest::Destroy { minor: 0 }).unwrap();
    }

    #[test]
    fn cow_file_must_live_on_the_base_filesystem() {
        let r = rig();
        let elsewhere = tempfile::tempdir().unwrap();
        let req = ControlRequest::SetupSnapshot(SetupParams {
            minor: 0,
            bdev: r.base_path.display().to_string(),
            cow: elsewhere.path().join("cow.snap").display().to_string(),
            fallocated_space: 64,
            cache_size: 0,
        });
        let err = dispatch(&r.registry, &r.mounted(), req).unwrap_err();
        assert_eq!(code_of(&err), libc::EINVAL);
    }

    #[test]
    fn out_of_range_minor_is_rejected() {
        let r = rig();
        let err = dispatch(
            &r.registry,
            &r.unmounted(),
            ControlRequest::Info { minor: 10_000 },
        )
        .unwrap_err();
        assert_eq!(code_of(&err), libc::EINVAL);
    }

    #[test]
    fn transitions_round_trip_through_control() {
        let r = rig();
        dispatch(&r.registry, &r.mounted(), r.setup_request()).unwrap();

        dispatch(
            &r.registry,
            &r.mounted(),
            ControlRequest::TransitionToIncremental { minor: 0 },
        )
        .unwrap();
        let dev = r.registry.get(0).unwrap();
        assert!(dev.is_active() && !dev.is_snapshot());

        dispatch(
            &r.registry,
            &r.mounted(),
            ControlRequest::TransitionToSnapshot(TransitionSnapParams {
                minor: 0,
                cow: r.dir.path().join("cow2.snap").display().to_string(),
                fallocated_space: 0,
            }),
        )
        .unwrap();
        let dev = r.registry.get(0).unwrap();
        assert!(dev.is_active() && dev.is_snapshot());
        assert_eq!(dev.cow_summary().unwrap().seqid, 2);

        dispatch(&r.registry, &r.mounted(), ControlRequest::Destroy { minor: 0 }).unwrap();
    }
}
