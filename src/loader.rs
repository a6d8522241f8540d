//! Drives the load of one object, and of whole directories of objects.
//!
//! Per object the order is fixed: parse, decode descriptors, realize
//! maps, patch relocations, realize programs. Maps must exist before any
//! relocation and every relocation must be applied before any program is
//! submitted, because the fd values end up inside the instruction
//! streams the kernel verifies.

use log::{debug, error, info};
use std::path::Path;

use crate::defs::{
    split_records, BpfProgDef, DEFAULT_BPFLOADER_MAX_VER, DEFAULT_BPFLOADER_MIN_VER,
    DEFAULT_SIZEOF_BPF_MAP_DEF, DEFAULT_SIZEOF_BPF_PROG_DEF,
};
use crate::ebpf;
use crate::elf::{ElfFile, STT_FUNC};
use crate::env::EnvSnapshot;
use crate::error::LoadError;
use crate::maps::create_maps;
use crate::progs::load_programs;
use crate::relocate::apply_map_relocations;
use crate::sys::Platform;
use crate::BPF_FS_PATH;

/// Where objects are searched for, and the default pin prefix of
/// everything found there.
#[derive(Debug, Clone, Copy)]
pub struct Location {
    /// Directory scanned for `*.o` files
    pub dir: &'static str,
    /// Pin subdirectory used when a descriptor does not name one
    pub prefix: &'static str,
}

/// The standard search locations, in load order.
pub const LOCATIONS: [Location; 5] = [
    // tether offload
    Location {
        dir: "/apex/com.android.tethering/etc/bpf/",
        prefix: "tethering/",
    },
    // shared with netd & system server, netutils_wrapper gets access
    Location {
        dir: "/apex/com.android.tethering/etc/bpf/netd_shared/",
        prefix: "netd_shared/",
    },
    // netd read only, no netutils_wrapper access
    Location {
        dir: "/apex/com.android.tethering/etc/bpf/netd_readonly/",
        prefix: "netd_readonly/",
    },
    // shared with system server
    Location {
        dir: "/apex/com.android.tethering/etc/bpf/net_shared/",
        prefix: "net_shared/",
    },
    // not shared, just network_stack
    Location {
        dir: "/apex/com.android.tethering/etc/bpf/net_private/",
        prefix: "net_private/",
    },
];

/// A code section, its relocation table, and its bound program record.
#[derive(Debug, Clone)]
pub struct CodeSection {
    pub prog_type: u32,
    pub expected_attach_type: u32,
    /// Section name with `/` flattened to `_`
    pub name: String,
    /// Instruction bytes, mutated in place by relocation
    pub data: Vec<u8>,
    /// Raw Rel table, empty when the section has none
    pub rel_data: Vec<u8>,
    pub prog_def: Option<BpfProgDef>,
}

struct SectionType {
    prefix: &'static str,
    prog_type: u32,
    expected_attach_type: u32,
}

/// Section name prefixes and the program/attach types they stand for.
/// A program is declared as `SECTION("<prefix>/<name>")`; everything
/// after the slash is the program name.
const SECTION_TYPES: [SectionType; 28] = [
    SectionType { prefix: "bind4/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCK_ADDR, expected_attach_type: ebpf::BPF_CGROUP_INET4_BIND },
    SectionType { prefix: "bind6/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCK_ADDR, expected_attach_type: ebpf::BPF_CGROUP_INET6_BIND },
    SectionType { prefix: "cgroupskb/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SKB, expected_attach_type: ebpf::BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "cgroupsock/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCK, expected_attach_type: ebpf::BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "cgroupsockcreate/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCK, expected_attach_type: ebpf::BPF_CGROUP_INET_SOCK_CREATE },
    SectionType { prefix: "cgroupsockrelease/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCK, expected_attach_type: ebpf::BPF_CGROUP_INET_SOCK_RELEASE },
    SectionType { prefix: "connect4/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCK_ADDR, expected_attach_type: ebpf::BPF_CGROUP_INET4_CONNECT },
    SectionType { prefix: "connect6/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCK_ADDR, expected_attach_type: ebpf::BPF_CGROUP_INET6_CONNECT },
    SectionType { prefix: "egress/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SKB, expected_attach_type: ebpf::BPF_CGROUP_INET_EGRESS },
    SectionType { prefix: "getsockopt/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCKOPT, expected_attach_type: ebpf::BPF_CGROUP_GETSOCKOPT },
    SectionType { prefix: "ingress/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SKB, expected_attach_type: ebpf::BPF_CGROUP_INET_INGRESS },
    SectionType { prefix: "lwt_in/", prog_type: ebpf::BPF_PROG_TYPE_LWT_IN, expected_attach_type: ebpf::BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "lwt_out/", prog_type: ebpf::BPF_PROG_TYPE_LWT_OUT, expected_attach_type: ebpf::BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "lwt_seg6local/", prog_type: ebpf::BPF_PROG_TYPE_LWT_SEG6LOCAL, expected_attach_type: ebpf::BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "lwt_xmit/", prog_type: ebpf::BPF_PROG_TYPE_LWT_XMIT, expected_attach_type: ebpf::BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "postbind4/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCK, expected_attach_type: ebpf::BPF_CGROUP_INET4_POST_BIND },
    SectionType { prefix: "postbind6/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCK, expected_attach_type: ebpf::BPF_CGROUP_INET6_POST_BIND },
    SectionType { prefix: "recvmsg4/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCK_ADDR, expected_attach_type: ebpf::BPF_CGROUP_UDP4_RECVMSG },
    SectionType { prefix: "recvmsg6/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCK_ADDR, expected_attach_type: ebpf::BPF_CGROUP_UDP6_RECVMSG },
    SectionType { prefix: "schedact/", prog_type: ebpf::BPF_PROG_TYPE_SCHED_ACT, expected_attach_type: ebpf::BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "schedcls/", prog_type: ebpf::BPF_PROG_TYPE_SCHED_CLS, expected_attach_type: ebpf::BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "sendmsg4/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCK_ADDR, expected_attach_type: ebpf::BPF_CGROUP_UDP4_SENDMSG },
    SectionType { prefix: "sendmsg6/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCK_ADDR, expected_attach_type: ebpf::BPF_CGROUP_UDP6_SENDMSG },
    SectionType { prefix: "setsockopt/", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SOCKOPT, expected_attach_type: ebpf::BPF_CGROUP_SETSOCKOPT },
    SectionType { prefix: "skfilter/", prog_type: ebpf::BPF_PROG_TYPE_SOCKET_FILTER, expected_attach_type: ebpf::BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "sockops/", prog_type: ebpf::BPF_PROG_TYPE_SOCK_OPS, expected_attach_type: ebpf::BPF_CGROUP_SOCK_OPS },
    SectionType { prefix: "sysctl", prog_type: ebpf::BPF_PROG_TYPE_CGROUP_SYSCTL, expected_attach_type: ebpf::BPF_CGROUP_SYSCTL },
    SectionType { prefix: "xdp/", prog_type: ebpf::BPF_PROG_TYPE_XDP, expected_attach_type: ebpf::BPF_ATTACH_TYPE_UNSPEC },
];

fn section_type(name: &str) -> Option<&'static SectionType> {
    SECTION_TYPES.iter().find(|st| name.starts_with(st.prefix))
}

/// The pin-name component of an object path: the basename with its
/// extension and any `@variant` suffix stripped. The `@` convention lets
/// several builds of one logical object ship side by side.
pub fn path_to_obj_name(path: &Path) -> String {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = file.rfind('.').map(|i| &file[..i]).unwrap_or(&file);
    let base = base.rfind('@').map(|i| &base[..i]).unwrap_or(base);
    base.to_string()
}

/// Scan the object for code sections and bind each to its program record.
///
/// A section is a code section when its name starts with a recognized
/// prefix. Its record in `progs` is found through the symbol named after
/// the section's function symbol plus `_def`. The relocation table, if
/// any, is expected at the very next section index under the name
/// `.rel<section>`; objects placing it elsewhere are not supported.
pub fn read_code_sections(
    elf: &ElfFile,
    record_size: usize,
) -> Result<Vec<CodeSection>, LoadError> {
    let prog_defs: Vec<BpfProgDef> = match elf.read_section("progs")? {
        Some(section) => split_records(section, record_size)
            .ok_or(LoadError::BadRecordSize {
                section: "progs",
                len: section.len(),
                record_size,
            })?
            .iter()
            .map(|rec| BpfProgDef::decode(rec, record_size))
            .collect(),
        None => Vec::new(),
    };
    let prog_def_names = if prog_defs.is_empty() {
        Vec::new()
    } else {
        let names = elf.symbols_in_section("progs", None)?;
        if names.len() != prog_defs.len() {
            return Err(LoadError::RecordCountMismatch {
                section: "progs",
                records: prog_defs.len(),
                symbols: names.len(),
            });
        }
        names
    };

    let mut sections = Vec::new();
    for i in 0..elf.section_count() {
        let original_name = elf.section_name(i)?.to_string();
        let Some(st) = section_type(&original_name) else {
            continue;
        };
        let data = elf.section_data(i)?.to_vec();
        if data.is_empty() {
            continue;
        }

        let mut cs = CodeSection {
            prog_type: st.prog_type,
            expected_attach_type: st.expected_attach_type,
            name: original_name.replace('/', "_"),
            data,
            rel_data: Vec::new(),
            prog_def: None,
        };
        debug!("loaded code section {} ({})", i, cs.name);

        if let Some(func) = elf
            .symbols_in_section(&original_name, Some(STT_FUNC))?
            .into_iter()
            .next()
        {
            let def_name = format!("{}_def", func);
            if let Some(idx) = prog_def_names.iter().position(|n| *n == def_name) {
                cs.prog_def = Some(prog_defs[idx].clone());
            }
        }

        if i + 1 < elf.section_count()
            && elf.section_name(i + 1)? == format!(".rel{}", original_name)
        {
            cs.rel_data = elf.section_data(i + 1)?.to_vec();
            debug!("loaded relo section for {}", cs.name);
        }

        sections.push(cs);
    }
    Ok(sections)
}

/// Run the whole pipeline for one object file.
///
/// The bool is the object's criticality (presence of a `critical`
/// section), reported even when the load fails so the directory driver
/// can weigh the failure.
pub fn load_object<P: Platform>(
    platform: &P,
    env: &EnvSnapshot,
    path: &Path,
    location: &Location,
) -> (bool, Result<(), LoadError>) {
    let elf = match ElfFile::open(path) {
        Ok(elf) => elf,
        Err(err) => return (false, Err(err.into())),
    };
    let critical = match elf.read_section("critical") {
        Ok(Some(reason)) => {
            let end = reason.iter().position(|&b| b == 0).unwrap_or(reason.len());
            info!(
                "loading critical for {} ELF object {}",
                String::from_utf8_lossy(&reason[..end]),
                path.display()
            );
            true
        }
        _ => false,
    };
    (critical, run_pipeline(platform, env, &elf, path, location))
}

fn run_pipeline<P: Platform>(
    platform: &P,
    env: &EnvSnapshot,
    elf: &ElfFile,
    path: &Path,
    location: &Location,
) -> Result<(), LoadError> {
    let mut license = match elf.read_section("license")? {
        Some(license) => license.to_vec(),
        None => {
            error!("missing license in {}", path.display());
            return Err(LoadError::MissingLicense);
        }
    };
    if license.last() != Some(&0) {
        license.push(0);
    }

    // Objects in the unversioned v0.0 format carry none of these sections.
    let min_ver = elf.read_section_uint("bpfloader_min_ver", DEFAULT_BPFLOADER_MIN_VER);
    let max_ver = elf.read_section_uint("bpfloader_max_ver", DEFAULT_BPFLOADER_MAX_VER);
    let min_required_ver = elf.read_section_uint("bpfloader_min_required_ver", 0);
    let map_record_size =
        elf.read_section_uint("size_of_bpf_map_def", DEFAULT_SIZEOF_BPF_MAP_DEF as u32) as usize;
    let prog_record_size =
        elf.read_section_uint("size_of_bpf_prog_def", DEFAULT_SIZEOF_BPF_PROG_DEF as u32) as usize;

    if env.loader_ver < min_ver {
        info!(
            "bpfloader version {:#x} ignoring object {} with min ver {:#x}",
            env.loader_ver,
            path.display(),
            min_ver
        );
        return Ok(());
    }
    if env.loader_ver >= max_ver {
        info!(
            "bpfloader version {:#x} ignoring object {} with max ver {:#x}",
            env.loader_ver,
            path.display(),
            max_ver
        );
        return Ok(());
    }
    if env.loader_ver < min_required_ver {
        error!(
            "bpfloader version {:#x} too old for object {} requiring {:#x}",
            env.loader_ver,
            path.display(),
            min_required_ver
        );
        return Err(LoadError::LoaderTooOld {
            min: min_required_ver,
            have: env.loader_ver,
        });
    }
    info!(
        "bpfloader version {:#x} processing object {} with ver [{:#x},{:#x})",
        env.loader_ver,
        path.display(),
        min_ver,
        max_ver
    );

    if map_record_size < DEFAULT_SIZEOF_BPF_MAP_DEF {
        return Err(LoadError::RecordSizeTooSmall {
            section: "maps",
            size: map_record_size,
            min: DEFAULT_SIZEOF_BPF_MAP_DEF,
        });
    }
    if prog_record_size < DEFAULT_SIZEOF_BPF_PROG_DEF {
        return Err(LoadError::RecordSizeTooSmall {
            section: "progs",
            size: prog_record_size,
            min: DEFAULT_SIZEOF_BPF_PROG_DEF,
        });
    }

    let obj_name = path_to_obj_name(path);
    let mut sections = read_code_sections(elf, prog_record_size)?;

    let map_fds = create_maps(
        platform,
        env,
        elf,
        &obj_name,
        location.prefix,
        map_record_size,
    )?;
    let map_names = elf.symbols_in_section("maps", None).unwrap_or_default();
    apply_map_relocations(elf, &map_names, &map_fds, &mut sections)?;
    load_programs(
        platform,
        env,
        &sections,
        &license,
        &obj_name,
        location.prefix,
    )?;

    // map_fds drop here: pinned maps live on through their bpffs inodes,
    // and the fd values are already baked into the loaded programs.
    Ok(())
}

/// Load every object in a location, in readdir order.
///
/// Failures of non-critical objects are logged and skipped; the first
/// failure of a critical object becomes the directory's status.
pub fn load_dir<P: Platform>(
    platform: &P,
    env: &EnvSnapshot,
    location: &Location,
) -> Result<(), LoadError> {
    let entries = match std::fs::read_dir(location.dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()), // nothing shipped for this location
    };

    let mut status = Ok(());
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != "o") {
            continue;
        }
        let (critical, result) = load_object(platform, env, &path, location);
        match result {
            Ok(()) => debug!("loaded object {}", path.display()),
            Err(err) => {
                error!("failed to load object {}: {}", path.display(), err);
                if critical && status.is_ok() {
                    status = Err(err);
                }
            }
        }
    }
    status
}

/// Create one pin subdirectory under bpffs. Sticky and world-writable,
/// like the bpffs root itself; labeling is the policy's job.
pub fn create_pin_subdir<P: Platform>(platform: &P, prefix: &str) -> Result<(), LoadError> {
    if prefix.is_empty() {
        return Ok(());
    }
    let path = format!("{}{}", BPF_FS_PATH, prefix);
    platform
        .mkdir_sticky(&path)
        .map_err(|err| {
            error!("failed to create {}: {}", path, err);
            LoadError::Sys { op: "mkdir", err }
        })
}

/// Realize every configured location.
///
/// All pin subdirectories are created up front: labeled pinning renames
/// across them, so they must all exist before the first object loads.
pub fn load_all<P: Platform>(
    platform: &P,
    env: &EnvSnapshot,
    locations: &[Location],
) -> Result<(), LoadError> {
    for location in locations {
        create_pin_subdir(platform, location.prefix)?;
    }
    // No objects ship for the loader's own subdirectory; it exists to
    // give its labeling rule something to apply to.
    create_pin_subdir(platform, "loader")?;

    for location in locations {
        if let Err(err) = load_dir(platform, env, location) {
            error!(
                "=== CRITICAL FAILURE LOADING BPF PROGRAMS FROM {} ===",
                location.dir
            );
            error!("--- DO NOT EXPECT SYSTEM TO BOOT SUCCESSFULLY ---");
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obj_name_strips_extension_and_variant() {
        assert_eq!(path_to_obj_name(Path::new("/etc/bpf/foo.o")), "foo");
        assert_eq!(path_to_obj_name(Path::new("/etc/bpf/foo@1.o")), "foo");
        assert_eq!(path_to_obj_name(Path::new("bar.bpf.o")), "bar.bpf");
        assert_eq!(path_to_obj_name(Path::new("baz")), "baz");
    }

    #[test]
    fn section_prefixes_resolve_types() {
        let st = section_type("cgroupskb/prog1").unwrap();
        assert_eq!(st.prog_type, ebpf::BPF_PROG_TYPE_CGROUP_SKB);
        let st = section_type("connect6/other").unwrap();
        assert_eq!(st.prog_type, ebpf::BPF_PROG_TYPE_CGROUP_SOCK_ADDR);
        assert_eq!(st.expected_attach_type, ebpf::BPF_CGROUP_INET6_CONNECT);
        assert!(section_type(".text").is_none());
        assert!(section_type("maps").is_none());
    }
}
