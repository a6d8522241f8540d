//! The environment snapshot the load pipeline is gated on.
//!
//! Everything here is probed once at startup and frozen; the pipeline
//! only ever reads it. Tests construct snapshots directly.

use std::io;

/// Version of this loader. Objects declare `[min, max)` ranges against it.
pub const BPFLOADER_VERSION: u32 = 45;

/// Pack a kernel version as `(major << 16) | (minor << 8) | sub`.
///
/// Components are saturated to their field widths so comparisons between
/// packed values stay monotonic even for oddball release strings.
pub const fn kver(major: u32, minor: u32, sub: u32) -> u32 {
    let major = if major > 0xff { 0xff } else { major };
    let minor = if minor > 0xff { 0xff } else { minor };
    let sub = if sub > 0xff { 0xff } else { sub };
    (major << 16) | (minor << 8) | sub
}

/// Android build variant, from `ro.build.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildType {
    Eng,
    User,
    Userdebug,
}

impl BuildType {
    /// Parse the build-type property value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eng" => Some(Self::Eng),
            "user" => Some(Self::User),
            "userdebug" => Some(Self::Userdebug),
            _ => None,
        }
    }

    /// The canonical property value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eng => "eng",
            Self::User => "user",
            Self::Userdebug => "userdebug",
        }
    }
}

/// Kernel architecture tag. 32-bit kernels on 64-bit capable silicon
/// report the 32-bit tag; what matters for gating is the running kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum Arch {
    Arm32,
    Aarch64,
    X86_32,
    X86_64,
    Riscv64,
}

impl Arch {
    /// Human-readable tag for logs.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Arm32 => "arm32",
            Self::Aarch64 => "aarch64",
            Self::X86_32 => "x86_32",
            Self::X86_64 => "x86_64",
            Self::Riscv64 => "riscv64",
        }
    }
}

/// Immutable facts about the machine the loader runs on.
#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    /// Running kernel version, packed by [`kver`]
    pub kernel_ver: u32,
    /// Version of this loader
    pub loader_ver: u32,
    pub build_type: BuildType,
    pub arch: Arch,
    /// Userspace pointer width is 64 bits
    pub userspace_64bit: bool,
    pub running_as_root: bool,
    /// System page size in bytes
    pub page_size: u32,
}

impl EnvSnapshot {
    /// True when the kernel is at least `major.minor.sub`.
    pub fn is_at_least_kver(&self, major: u32, minor: u32, sub: u32) -> bool {
        self.kernel_ver >= kver(major, minor, sub)
    }

    /// Probe the running system. `build_type` comes from the caller,
    /// which owns property access.
    pub fn probe(build_type: BuildType, loader_ver: u32) -> io::Result<Self> {
        Ok(Self {
            kernel_ver: kernel_version()?,
            loader_ver,
            build_type,
            arch: arch(),
            userspace_64bit: cfg!(target_pointer_width = "64"),
            running_as_root: unsafe { libc::getuid() } == 0,
            page_size: page_size(),
        })
    }
}

/// Packed version of the running kernel, from `uname(2)`.
pub fn kernel_version() -> io::Result<u32> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let release: Vec<u8> = uts
        .release
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    let release = String::from_utf8_lossy(&release);
    Ok(parse_kernel_release(&release))
}

/// Parse a `major.minor.sub[-anything]` release string; unparsable
/// components read as zero.
fn parse_kernel_release(release: &str) -> u32 {
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let mut next = || {
        parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .unwrap_or(0)
    };
    let (major, minor, sub) = (next(), next(), next());
    kver(major, minor, sub)
}

fn arch() -> Arch {
    if cfg!(target_arch = "aarch64") {
        Arch::Aarch64
    } else if cfg!(target_arch = "arm") {
        Arch::Arm32
    } else if cfg!(target_arch = "x86_64") {
        Arch::X86_64
    } else if cfg!(target_arch = "x86") {
        Arch::X86_32
    } else {
        Arch::Riscv64
    }
}

fn page_size() -> u32 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as u32
    }
}
