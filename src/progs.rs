//! Submits the relocated code sections to the kernel and pins the
//! resulting programs.

use log::{debug, error, info, warn};

use crate::defs::BpfProgDef;
use crate::domain::Domain;
use crate::env::EnvSnapshot;
use crate::error::LoadError;
use crate::gate::{log_skip, skip_reason, Predicates};
use crate::loader::CodeSection;
use crate::sys::{Platform, ProgLoadAttr};
use crate::BPF_FS_PATH;

/// Size of the verifier log buffer handed to every load
const BPF_LOAD_LOG_SZ: usize = 0xfffff;

impl BpfProgDef {
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

/// Load and pin every code section that passes its gates.
///
/// A verifier rejection fails the object unless the program is marked
/// optional; either way the verifier log is dumped first.
pub fn load_programs<P: Platform>(
    platform: &P,
    env: &EnvSnapshot,
    sections: &[CodeSection],
    license: &[u8],
    obj_name: &str,
    prefix: &str,
) -> Result<(), LoadError> {
    for cs in sections {
        let def = cs
            .prog_def
            .as_ref()
            .ok_or_else(|| LoadError::MissingProgDef(cs.name.clone()))?;

        if let Some(reason) = skip_reason(&def.predicates(), env) {
            log_skip("prog", &cs.name, &def.predicates(), env, reason);
            continue;
        }

        let selinux_context = Domain::from_selinux_context(&def.selinux_context);
        if selinux_context.specified() {
            info!(
                "prog {} selinux_context [{}] -> '{}' ({})",
                cs.name,
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
                "prog {} pin_subdir [{}] -> '{}'",
                cs.name,
                def.pin_subdir,
                pin_subdir.pin_subdir()
            );
        }

        // A `$suffix` distinguishes alternates of one program (picked by
        // their kernel-version gates); all alternates share one pin name.
        let name = match cs.name.rfind('$') {
            Some(idx) => &cs.name[..idx],
            None => cs.name.as_str(),
        };

        let pin_path = format!(
            "{}{}prog_{}_{}",
            BPF_FS_PATH,
            pin_subdir.pin_subdir_or(prefix),
            obj_name,
            name
        );

        let reuse = platform.exists(&pin_path);
        let fd = if reuse {
            debug!("reusing pinned prog {}", pin_path);
            platform
                .prog_retrieve(&pin_path)
                .map_err(|err| LoadError::Sys {
                    op: "BPF_OBJ_GET",
                    err,
                })?
        } else {
            let mut log_buf = vec![0u8; BPF_LOAD_LOG_SZ];
            let attr = ProgLoadAttr {
                prog_type: cs.prog_type,
                expected_attach_type: cs.expected_attach_type,
                name: env.is_at_least_kver(4, 15, 0).then_some(cs.name.as_str()),
                license,
                insns: &cs.data,
                kern_version: env.kernel_ver,
            };
            match platform.prog_load(&attr, &mut log_buf) {
                Ok(fd) => fd,
                Err(err) => {
                    dump_verifier_log(&log_buf);
                    if def.optional {
                        warn!("failed program {} is marked optional, continuing", cs.name);
                        continue;
                    }
                    error!("non-optional program {} failed to load", cs.name);
                    return Err(LoadError::Sys {
                        op: "BPF_PROG_LOAD",
                        err,
                    });
                }
            }
        };

        if !reuse {
            if selinux_context.specified() {
                let tmp_path = format!(
                    "{}{}tmp_prog_{}_{}",
                    BPF_FS_PATH,
                    selinux_context.pin_subdir(),
                    obj_name,
                    name
                );
                platform.obj_pin(&fd, &tmp_path).map_err(|err| {
                    error!("pin {} failed: {}", tmp_path, err);
                    LoadError::Sys {
                        op: "BPF_OBJ_PIN",
                        err,
                    }
                })?;
                platform.rename_exclusive(&tmp_path, &pin_path).map_err(|err| {
                    error!("rename {} -> {} failed: {}", tmp_path, pin_path, err);
                    LoadError::Sys {
                        op: "renameat2",
                        err,
                    }
                })?;
            } else {
                platform.obj_pin(&fd, &pin_path).map_err(|err| {
                    error!("pin {} failed: {}", pin_path, err);
                    LoadError::Sys {
                        op: "BPF_OBJ_PIN",
                        err,
                    }
                })?;
            }
            platform
                .chmod(&pin_path, 0o440)
                .map_err(|err| LoadError::Sys { op: "chmod", err })?;
            platform
                .chown(&pin_path, def.uid, def.gid)
                .map_err(|err| LoadError::Sys { op: "chown", err })?;
        }

        if env.is_at_least_kver(4, 14, 0) {
            match platform.prog_id(&fd) {
                Ok(id) => info!("prog {} id {}", pin_path, id),
                Err(err) => error!("failed to read id of prog {}: {}", pin_path, err),
            }
        }
    }
    Ok(())
}

/// The verifier log is the only diagnosis a rejected program gets;
/// print it whole, one line at a time.
fn dump_verifier_log(log_buf: &[u8]) {
    let end = log_buf.iter().position(|&b| b == 0).unwrap_or(log_buf.len());
    let text = String::from_utf8_lossy(&log_buf[..end]);
    warn!("BPF_PROG_LOAD - BEGIN log_buf contents:");
    for line in text.lines() {
        warn!("{}", line);
    }
    warn!("BPF_PROG_LOAD - END log_buf contents.");
}
