//! The kernel and filesystem port of the loader.
//!
//! Everything the pipeline asks of the outside world goes through the
//! [`Platform`] trait: `bpf(2)` in its four roles (create, load, pin,
//! retrieve), the pin-directory filesystem calls, and the atomic
//! no-replace rename that pin labeling is built on. [`LinuxPlatform`]
//! is the real implementation; tests substitute a scripted one.

use crate::ebpf;
use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Flag for retrieving a pinned map read-only
const BPF_F_RDONLY: u32 = 1 << 3;

/// A raw OS error number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    /// The calling thread's current errno.
    pub fn last() -> Self {
        Self(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", io::Error::from_raw_os_error(self.0), self.0)
    }
}

impl std::error::Error for Errno {}

/// Result of a platform operation.
pub type SysResult<T> = Result<T, Errno>;

/// Arguments of a `BPF_MAP_CREATE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapCreateAttr<'a> {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    /// Object name; `None` on kernels without map naming
    pub name: Option<&'a str>,
}

/// Arguments of a `BPF_PROG_LOAD`.
pub struct ProgLoadAttr<'a> {
    pub prog_type: u32,
    pub expected_attach_type: u32,
    /// Object name; `None` on kernels without program naming
    pub name: Option<&'a str>,
    /// NUL-terminated license string
    pub license: &'a [u8],
    /// Raw instruction stream, a multiple of eight bytes
    pub insns: &'a [u8],
    pub kern_version: u32,
}

/// Shape of an in-kernel map, read back through its fd.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapInfo {
    pub map_type: u32,
    pub id: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
}

/// The loader's view of the kernel and of the bpffs namespace.
pub trait Platform {
    /// An owned kernel object handle; dropping it releases the kernel
    /// reference (pins hold their own).
    type Fd: AsRawFd;

    fn map_create(&self, attr: &MapCreateAttr<'_>) -> SysResult<Self::Fd>;
    /// Open an existing pin read-only.
    fn map_retrieve_ro(&self, path: &str) -> SysResult<Self::Fd>;
    fn map_info(&self, fd: &Self::Fd) -> SysResult<MapInfo>;
    fn prog_load(&self, attr: &ProgLoadAttr<'_>, log_buf: &mut [u8]) -> SysResult<Self::Fd>;
    fn prog_retrieve(&self, path: &str) -> SysResult<Self::Fd>;
    fn prog_id(&self, fd: &Self::Fd) -> SysResult<u32>;
    fn obj_pin(&self, fd: &Self::Fd, path: &str) -> SysResult<()>;
    /// `renameat2(RENAME_NOREPLACE)`: the commit point of a labeled pin.
    fn rename_exclusive(&self, from: &str, to: &str) -> SysResult<()>;
    fn exists(&self, path: &str) -> bool;
    /// Create a world-writable sticky directory; an existing one is fine.
    fn mkdir_sticky(&self, path: &str) -> SysResult<()>;
    fn chmod(&self, path: &str, mode: u32) -> SysResult<()>;
    fn chown(&self, path: &str, uid: u32, gid: u32) -> SysResult<()>;
    /// Full single write of `value` into `path` (proc/sys knobs).
    fn write_file(&self, path: &str, value: &str) -> SysResult<()>;
}

// bpf_attr layouts for the commands in use. Only the leading fields of
// the kernel's union are declared; the syscall size argument bounds what
// the kernel reads.

#[repr(C)]
#[derive(Default)]
struct MapCreateReq {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; ebpf::BPF_OBJ_NAME_LEN],
}

#[repr(C)]
struct ProgLoadReq {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
    prog_name: [u8; ebpf::BPF_OBJ_NAME_LEN],
    prog_ifindex: u32,
    expected_attach_type: u32,
}

#[repr(C)]
#[derive(Default)]
struct ObjReq {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

#[repr(C)]
#[derive(Default)]
struct InfoReq {
    bpf_fd: u32,
    info_len: u32,
    info: u64,
}

#[repr(C)]
#[derive(Default)]
struct MapInfoRaw {
    map_type: u32,
    id: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
}

#[repr(C)]
#[derive(Default)]
struct ProgInfoRaw {
    prog_type: u32,
    id: u32,
}

fn sys_bpf<T>(cmd: u32, attr: &mut T) -> SysResult<RawFd> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            std::mem::size_of::<T>(),
        )
    };
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret as RawFd)
    }
}

fn path_cstr(path: &str) -> SysResult<CString> {
    CString::new(path).map_err(|_| Errno(libc::EINVAL))
}

fn obj_name(name: Option<&str>) -> [u8; ebpf::BPF_OBJ_NAME_LEN] {
    let mut buf = [0u8; ebpf::BPF_OBJ_NAME_LEN];
    if let Some(name) = name {
        let n = name.len().min(ebpf::BPF_OBJ_NAME_LEN - 1);
        buf[..n].copy_from_slice(&name.as_bytes()[..n]);
    }
    buf
}

fn obj_get(path: &str, file_flags: u32) -> SysResult<OwnedFd> {
    let path = path_cstr(path)?;
    let mut req = ObjReq {
        pathname: path.as_ptr() as u64,
        bpf_fd: 0,
        file_flags,
    };
    let fd = sys_bpf(ebpf::BPF_OBJ_GET, &mut req)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn obj_get_info<T: Default>(fd: RawFd) -> SysResult<T> {
    let mut info = T::default();
    let mut req = InfoReq {
        bpf_fd: fd as u32,
        info_len: std::mem::size_of::<T>() as u32,
        info: &mut info as *mut T as u64,
    };
    sys_bpf(ebpf::BPF_OBJ_GET_INFO_BY_FD, &mut req)?;
    Ok(info)
}

/// The real thing: raw syscalls against the running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxPlatform;

impl Platform for LinuxPlatform {
    type Fd = OwnedFd;

    fn map_create(&self, attr: &MapCreateAttr<'_>) -> SysResult<OwnedFd> {
        let mut req = MapCreateReq {
            map_type: attr.map_type,
            key_size: attr.key_size,
            value_size: attr.value_size,
            max_entries: attr.max_entries,
            map_flags: attr.map_flags,
            map_name: obj_name(attr.name),
            ..Default::default()
        };
        let fd = sys_bpf(ebpf::BPF_MAP_CREATE, &mut req)?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn map_retrieve_ro(&self, path: &str) -> SysResult<OwnedFd> {
        obj_get(path, BPF_F_RDONLY)
    }

    fn map_info(&self, fd: &OwnedFd) -> SysResult<MapInfo> {
        let raw: MapInfoRaw = obj_get_info(fd.as_raw_fd())?;
        Ok(MapInfo {
            map_type: raw.map_type,
            id: raw.id,
            key_size: raw.key_size,
            value_size: raw.value_size,
            max_entries: raw.max_entries,
            map_flags: raw.map_flags,
        })
    }

    fn prog_load(&self, attr: &ProgLoadAttr<'_>, log_buf: &mut [u8]) -> SysResult<OwnedFd> {
        let mut req = ProgLoadReq {
            prog_type: attr.prog_type,
            insn_cnt: (attr.insns.len() / ebpf::INSN_SIZE) as u32,
            insns: attr.insns.as_ptr() as u64,
            license: attr.license.as_ptr() as u64,
            log_level: if log_buf.is_empty() { 0 } else { 1 },
            log_size: log_buf.len() as u32,
            log_buf: if log_buf.is_empty() {
                0
            } else {
                log_buf.as_mut_ptr() as u64
            },
            kern_version: attr.kern_version,
            prog_flags: 0,
            prog_name: obj_name(attr.name),
            prog_ifindex: 0,
            expected_attach_type: attr.expected_attach_type,
        };
        let fd = sys_bpf(ebpf::BPF_PROG_LOAD, &mut req)?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn prog_retrieve(&self, path: &str) -> SysResult<OwnedFd> {
        obj_get(path, 0)
    }

    fn prog_id(&self, fd: &OwnedFd) -> SysResult<u32> {
        let raw: ProgInfoRaw = obj_get_info(fd.as_raw_fd())?;
        Ok(raw.id)
    }

    fn obj_pin(&self, fd: &OwnedFd, path: &str) -> SysResult<()> {
        let path = path_cstr(path)?;
        let mut req = ObjReq {
            pathname: path.as_ptr() as u64,
            bpf_fd: fd.as_raw_fd() as u32,
            file_flags: 0,
        };
        sys_bpf(ebpf::BPF_OBJ_PIN, &mut req)?;
        Ok(())
    }

    fn rename_exclusive(&self, from: &str, to: &str) -> SysResult<()> {
        let from = path_cstr(from)?;
        let to = path_cstr(to)?;
        let ret = unsafe {
            libc::renameat2(
                libc::AT_FDCWD,
                from.as_ptr(),
                libc::AT_FDCWD,
                to.as_ptr(),
                libc::RENAME_NOREPLACE,
            )
        };
        if ret != 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        let Ok(path) = path_cstr(path) else {
            return false;
        };
        if unsafe { libc::access(path.as_ptr(), libc::F_OK) } == 0 {
            return true;
        }
        let err = Errno::last();
        if err.0 != libc::ENOENT {
            // only reachable with a broken pin-directory policy
            log::error!("access({:?}) failed: {}", path, err);
        }
        false
    }

    fn mkdir_sticky(&self, path: &str) -> SysResult<()> {
        let cpath = path_cstr(path)?;
        let prev_umask = unsafe { libc::umask(0) };
        let ret = unsafe { libc::mkdir(cpath.as_ptr(), 0o1777) };
        let err = Errno::last();
        unsafe { libc::umask(prev_umask) };
        if ret != 0 && err.0 != libc::EEXIST {
            return Err(err);
        }
        Ok(())
    }

    fn chmod(&self, path: &str, mode: u32) -> SysResult<()> {
        let path = path_cstr(path)?;
        if unsafe { libc::chmod(path.as_ptr(), mode as libc::mode_t) } != 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> SysResult<()> {
        let path = path_cstr(path)?;
        if unsafe { libc::chown(path.as_ptr(), uid, gid) } != 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    fn write_file(&self, path: &str, value: &str) -> SysResult<()> {
        let cpath = path_cstr(path)?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(Errno::last());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let written = unsafe {
            libc::write(
                fd.as_raw_fd(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
            )
        };
        if written < 0 {
            return Err(Errno::last());
        }
        if written as usize != value.len() {
            return Err(Errno(libc::EINVAL));
        }
        Ok(())
    }
}
