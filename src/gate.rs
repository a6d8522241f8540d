//! Skip/include decisions for maps and programs.
//!
//! A descriptor is realized only when the running loader version, kernel
//! version, build type, and architecture all fall inside what it declares.
//! A skip is not an error: the object was built for a sibling
//! configuration and simply has nothing to say here.

use crate::defs::IgnoreBits;
use crate::ebpf;
use crate::env::{Arch, BuildType, EnvSnapshot};

/// The predicate fields common to map and program descriptors.
#[derive(Debug, Clone, Copy)]
pub struct Predicates {
    pub bpfloader_min_ver: u32,
    pub bpfloader_max_ver: u32,
    pub min_kver: u32,
    pub max_kver: u32,
    pub ignore: IgnoreBits,
}

/// Why a descriptor was skipped, for the log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Loader version outside `[min, max)`
    LoaderVersion,
    /// Kernel version outside `[min, max)`
    KernelVersion,
    /// Opted out on this build type
    BuildType,
    /// Opted out on this architecture
    Arch,
}

/// Decide whether `pred` rules this descriptor out under `env`.
pub fn skip_reason(pred: &Predicates, env: &EnvSnapshot) -> Option<SkipReason> {
    if env.loader_ver < pred.bpfloader_min_ver || env.loader_ver >= pred.bpfloader_max_ver {
        return Some(SkipReason::LoaderVersion);
    }
    if env.kernel_ver < pred.min_kver || env.kernel_ver >= pred.max_kver {
        return Some(SkipReason::KernelVersion);
    }
    let build_ignored = match env.build_type {
        BuildType::Eng => pred.ignore.on_eng,
        BuildType::User => pred.ignore.on_user,
        BuildType::Userdebug => pred.ignore.on_userdebug,
    };
    if build_ignored {
        return Some(SkipReason::BuildType);
    }
    let arch_ignored = match env.arch {
        Arch::Arm32 => pred.ignore.on_arm32,
        Arch::Aarch64 => pred.ignore.on_aarch64,
        Arch::X86_32 => pred.ignore.on_x86_32,
        Arch::X86_64 => pred.ignore.on_x86_64,
        Arch::Riscv64 => pred.ignore.on_riscv64,
    };
    if arch_ignored {
        return Some(SkipReason::Arch);
    }
    None
}

/// One log line explaining a skip; `kind` is "map" or "prog".
pub fn log_skip(kind: &str, name: &str, pred: &Predicates, env: &EnvSnapshot, reason: SkipReason) {
    match reason {
        SkipReason::LoaderVersion => log::info!(
            "skipping {} {} which requires bpfloader version [{:#x},{:#x}), have {:#x}",
            kind, name, pred.bpfloader_min_ver, pred.bpfloader_max_ver, env.loader_ver
        ),
        SkipReason::KernelVersion => log::info!(
            "skipping {} {} which requires kernel version [{:#x},{:#x}), have {:#x}",
            kind, name, pred.min_kver, pred.max_kver, env.kernel_ver
        ),
        SkipReason::BuildType => log::info!(
            "skipping {} {} which is ignored on {} builds",
            kind, name, env.build_type.as_str()
        ),
        SkipReason::Arch => log::info!(
            "skipping {} {} which is ignored on {}",
            kind, name, env.arch.describe()
        ),
    }
}

/// Substitute an approximation for map types the running kernel lacks.
///
/// DEVMAP appeared in 4.14 and DEVMAP_HASH in 5.4. ARRAY and HASH have
/// the same userspace-visible API, and a program actually redirecting
/// through the map cannot load on such a kernel anyway, so the
/// substitution only has to keep userspace bookkeeping alive.
pub fn resolve_map_type(map_type: u32, env: &EnvSnapshot) -> u32 {
    if map_type == ebpf::BPF_MAP_TYPE_DEVMAP && !env.is_at_least_kver(4, 14, 0) {
        return ebpf::BPF_MAP_TYPE_ARRAY;
    }
    if map_type == ebpf::BPF_MAP_TYPE_DEVMAP_HASH && !env.is_at_least_kver(5, 4, 0) {
        return ebpf::BPF_MAP_TYPE_HASH;
    }
    map_type
}

/// Ring buffers must span at least one page. Both operands are powers of
/// two, so the max is already the page-size multiple the kernel demands.
pub fn effective_max_entries(map_type: u32, max_entries: u32, env: &EnvSnapshot) -> u32 {
    if map_type == ebpf::BPF_MAP_TYPE_RINGBUF && max_entries < env.page_size {
        env.page_size
    } else {
        max_entries
    }
}

/// The flags an existing kernel object is expected to report.
///
/// Device maps are program-side read-only; the kernel sets the flag on
/// creation no matter what was asked for, so the comparison value must
/// carry it too.
pub fn expected_map_flags(map_type: u32, map_flags: u32) -> u32 {
    if map_type == ebpf::BPF_MAP_TYPE_DEVMAP || map_type == ebpf::BPF_MAP_TYPE_DEVMAP_HASH {
        map_flags | ebpf::BPF_F_RDONLY_PROG
    } else {
        map_flags
    }
}
