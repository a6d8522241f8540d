//! Realizes the maps an object declares into kernel objects pinned on
//! bpffs.
//!
//! The fd list this produces is index-parallel with the `maps` section:
//! slot *i* belongs to record *i* and to the *i*-th symbol of the
//! section. Skipped maps keep their slot as `None` so relocation indices
//! stay honest.

use log::{debug, error, info};

use crate::defs::{split_records, BpfMapDef};
use crate::domain::Domain;
use crate::elf::ElfFile;
use crate::env::EnvSnapshot;
use crate::error::LoadError;
use crate::gate::{
    effective_max_entries, expected_map_flags, log_skip, resolve_map_type, skip_reason, Predicates,
};
use crate::sys::{MapCreateAttr, Platform};
use crate::BPF_FS_PATH;

impl BpfMapDef {
    fn predicates(&self) -> Predicates {
        Predicates {
            bpfloader_min_ver: self.bpfloader_min_ver,
            bpfloader_max_ver: self.bpfloader_max_ver,
            min_kver: self.min_kver,
            max_kver: self.max_kver,
            ignore: self.ignore,
        }
    }
}

/// Create (or reuse) and pin every surviving map of the object.
///
/// Returns one fd slot per map record; gated-out maps occupy `None`.
pub fn create_maps<P: Platform>(
    platform: &P,
    env: &EnvSnapshot,
    elf: &ElfFile,
    obj_name: &str,
    prefix: &str,
    record_size: usize,
) -> Result<Vec<Option<P::Fd>>, LoadError> {
    let Some(section) = elf.read_section("maps")? else {
        return Ok(Vec::new()); // no maps to realize
    };
    let records =
        split_records(section, record_size).ok_or_else(|| LoadError::BadRecordSize {
            section: "maps",
            len: section.len(),
            record_size,
        })?;
    let defs: Vec<BpfMapDef> = records
        .iter()
        .map(|rec| BpfMapDef::decode(rec, record_size))
        .collect();

    let names = elf.symbols_in_section("maps", None)?;
    if names.len() != defs.len() {
        return Err(LoadError::RecordCountMismatch {
            section: "maps",
            records: defs.len(),
            symbols: names.len(),
        });
    }

    // Reject a poisoned object before creating anything for it.
    for (def, name) in defs.iter().zip(&names) {
        if def.zero != 0 {
            return Err(LoadError::ReservedFieldNotZero(name.clone()));
        }
    }

    let mut map_fds = Vec::with_capacity(defs.len());
    for (def, name) in defs.iter().zip(&names) {
        if let Some(reason) = skip_reason(&def.predicates(), env) {
            log_skip("map", name, &def.predicates(), env, reason);
            map_fds.push(None);
            continue;
        }

        let map_type = resolve_map_type(def.map_type, env);
        let max_entries = effective_max_entries(map_type, def.max_entries, env);

        let selinux_context = Domain::from_selinux_context(&def.selinux_context);
        if selinux_context.specified() {
            info!(
                "map {} selinux_context [{}] -> '{}' ({})",
                name,
                def.selinux_context,
                selinux_context.selinux_context(),
                selinux_context.pin_subdir()
            );
        }
        let pin_subdir = Domain::from_pin_subdir(&def.pin_subdir);
        if pin_subdir.unrecognized() {
            return Err(LoadError::UnrecognizedPinSubdir(def.pin_subdir.clone()));
        }
        if pin_subdir.specified() {
            info!(
                "map {} pin_subdir [{}] -> '{}'",
                name,
                def.pin_subdir,
                pin_subdir.pin_subdir()
            );
        }

        // Maps shared across objects drop the object name from the pin.
        let pin_path = format!(
            "{}{}map_{}_{}",
            BPF_FS_PATH,
            pin_subdir.pin_subdir_or(prefix),
            if def.shared { "" } else { obj_name },
            name
        );

        let reuse = platform.exists(&pin_path);
        let fd = if reuse {
            debug!("reusing pinned map {}", pin_path);
            platform
                .map_retrieve_ro(&pin_path)
                .map_err(|err| LoadError::Sys {
                    op: "BPF_OBJ_GET",
                    err,
                })?
        } else {
            let attr = MapCreateAttr {
                map_type,
                key_size: def.key_size,
                value_size: def.value_size,
                max_entries,
                map_flags: def.map_flags,
                name: env.is_at_least_kver(4, 15, 0).then_some(name.as_str()),
            };
            debug!("creating map {} type {}", name, map_type);
            platform.map_create(&attr).map_err(|err| LoadError::Sys {
                op: "BPF_MAP_CREATE",
                err,
            })?
        };

        // Mismatches come from the reuse path: a stale pin, or two
        // objects declaring one shared map differently. Freshly created
        // maps go through the same check. Readback needs 4.14.
        if env.is_at_least_kver(4, 14, 0) {
            let found = platform.map_info(&fd).unwrap_or_default();
            let desired_flags = expected_map_flags(map_type, def.map_flags);
            if found.map_type != map_type
                || found.key_size != def.key_size
                || found.value_size != def.value_size
                || found.max_entries != max_entries
                || found.map_flags != desired_flags
            {
                error!(
                    "map {} mismatch, desired/found: type {}/{} key {}/{} value {}/{} \
                     entries {}/{} flags {}/{}",
                    name,
                    map_type,
                    found.map_type,
                    def.key_size,
                    found.key_size,
                    def.value_size,
                    found.value_size,
                    max_entries,
                    found.max_entries,
                    desired_flags,
                    found.map_flags
                );
                return Err(LoadError::PinMismatch(pin_path));
            }
        }

        if !reuse {
            pin_map(platform, &fd, selinux_context, &pin_path, obj_name, name)?;
            platform
                .chmod(&pin_path, def.mode)
                .map_err(|err| LoadError::Sys { op: "chmod", err })?;
            platform
                .chown(&pin_path, def.uid, def.gid)
                .map_err(|err| LoadError::Sys { op: "chown", err })?;
        }

        if env.is_at_least_kver(4, 14, 0) {
            match platform.map_info(&fd) {
                Ok(found) => info!("map {} id {}", pin_path, found.id),
                Err(err) => error!("failed to read id of map {}: {}", pin_path, err),
            }
        }

        map_fds.push(Some(fd));
    }

    Ok(map_fds)
}

/// Pin a freshly created map.
///
/// A bpffs inode takes its SELinux label from the directory it is
/// created in, permanently. Realizing a non-default context therefore
/// means pinning into that context's own subdirectory and renaming into
/// the final location; the rename carries the label along and, with
/// `RENAME_NOREPLACE`, can never clobber an existing pin.
fn pin_map<P: Platform>(
    platform: &P,
    fd: &P::Fd,
    selinux_context: Domain,
    pin_path: &str,
    obj_name: &str,
    name: &str,
) -> Result<(), LoadError> {
    if selinux_context.specified() {
        let tmp_path = format!(
            "{}{}tmp_map_{}_{}",
            BPF_FS_PATH,
            selinux_context.pin_subdir(),
            obj_name,
            name
        );
        platform.obj_pin(fd, &tmp_path).map_err(|err| {
            error!("pin {} failed: {}", tmp_path, err);
            LoadError::Sys {
                op: "BPF_OBJ_PIN",
                err,
            }
        })?;
        platform.rename_exclusive(&tmp_path, pin_path).map_err(|err| {
            error!("rename {} -> {} failed: {}", tmp_path, pin_path, err);
            LoadError::Sys {
                op: "renameat2",
                err,
            }
        })?;
    } else {
        platform.obj_pin(fd, pin_path).map_err(|err| {
            error!("pin {} failed: {}", pin_path, err);
            LoadError::Sys {
                op: "BPF_OBJ_PIN",
                err,
            }
        })?;
    }
    Ok(())
}
