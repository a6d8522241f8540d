//! Shared fixtures for the loader's integration tests: a scripted
//! in-memory platform standing in for the kernel plus bpffs, and
//! builders for synthetic object files.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use netbpfload::ebpf;
use netbpfload::sys::{Errno, MapCreateAttr, MapInfo, Platform, ProgLoadAttr, SysResult};

pub mod obj;

pub use obj::{encode_map_def, encode_prog_def, le32, MapDefSpec, ObjBuilder, ProgDefSpec};

/// A canned program: `lddw r1, 0 ; mov64 r0, 0 ; exit`, with the
/// load-immediate pair at instruction 0 ready to take a map relocation.
pub fn ld_map_fd_prog() -> Vec<u8> {
    let mut insns = vec![0u8; 32];
    insns[0] = 0x18; // lddw
    insns[1] = 0x01; // dst r1
    insns[16] = 0xb7; // mov64 r0, imm
    insns[24] = 0x95; // exit
    insns
}

/// An in-kernel object held by the fake platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelObject {
    Map(MapInfo),
    Prog { id: u32, prog_type: u32 },
}

/// A pinned bpffs entry: the object plus the inode-ish metadata the
/// loader stamps onto it.
#[derive(Debug, Clone)]
pub struct PinEntry {
    pub object: Rc<KernelObject>,
    pub mode: u32,
    pub owner: (u32, u32),
}

/// One recorded `BPF_MAP_CREATE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapCreateRecord {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub name: Option<String>,
}

/// One recorded `BPF_PROG_LOAD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgLoadRecord {
    pub prog_type: u32,
    pub expected_attach_type: u32,
    pub name: Option<String>,
    pub license: Vec<u8>,
    pub insns: Vec<u8>,
    pub kern_version: u32,
}

#[derive(Debug, Default)]
struct State {
    next_fd: RawFd,
    next_id: u32,
    open_fds: BTreeMap<RawFd, Rc<KernelObject>>,
    pins: BTreeMap<String, PinEntry>,
    dirs: Vec<String>,
    map_creates: Vec<MapCreateRecord>,
    prog_loads: Vec<ProgLoadRecord>,
    renames: Vec<(String, String)>,
    file_writes: Vec<(String, String)>,
    prog_load_failures: Vec<(i32, String)>,
}

/// An owned fake fd; dropping it closes the handle, pins keep the
/// object alive.
#[derive(Debug)]
pub struct TestFd {
    fd: RawFd,
    state: Rc<RefCell<State>>,
}

impl AsRawFd for TestFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TestFd {
    fn drop(&mut self) {
        self.state.borrow_mut().open_fds.remove(&self.fd);
    }
}

/// Scripted kernel + bpffs. Records every call; failure injection is
/// per-call for program loads.
#[derive(Debug, Default)]
pub struct TestPlatform {
    state: Rc<RefCell<State>>,
}

impl TestPlatform {
    pub fn new() -> Self {
        let platform = Self::default();
        platform.state.borrow_mut().next_fd = 3;
        platform.state.borrow_mut().next_id = 1;
        platform
    }

    fn new_fd(&self, object: Rc<KernelObject>) -> TestFd {
        let mut state = self.state.borrow_mut();
        let fd = state.next_fd;
        state.next_fd += 1;
        state.open_fds.insert(fd, object);
        TestFd {
            fd,
            state: Rc::clone(&self.state),
        }
    }

    /// Queue a failure for the next `BPF_PROG_LOAD`, with the verifier
    /// log text the kernel would have produced.
    pub fn fail_next_prog_load(&self, errno: i32, verifier_log: &str) {
        self.state
            .borrow_mut()
            .prog_load_failures
            .push((errno, verifier_log.to_string()));
    }

    pub fn map_create_count(&self) -> usize {
        self.state.borrow().map_creates.len()
    }

    pub fn prog_load_count(&self) -> usize {
        self.state.borrow().prog_loads.len()
    }

    pub fn map_create_calls(&self) -> Vec<MapCreateRecord> {
        self.state.borrow().map_creates.clone()
    }

    pub fn prog_load_calls(&self) -> Vec<ProgLoadRecord> {
        self.state.borrow().prog_loads.clone()
    }

    pub fn renames(&self) -> Vec<(String, String)> {
        self.state.borrow().renames.clone()
    }

    pub fn pinned_paths(&self) -> Vec<String> {
        self.state.borrow().pins.keys().cloned().collect()
    }

    pub fn pin_exists(&self, path: &str) -> bool {
        self.state.borrow().pins.contains_key(path)
    }

    /// The pinned object's kernel id: stable across retrievals, so it
    /// doubles as the inode identity in tests.
    pub fn pin_id(&self, path: &str) -> Option<u32> {
        self.state
            .borrow()
            .pins
            .get(path)
            .map(|pin| match *pin.object {
                KernelObject::Map(info) => info.id,
                KernelObject::Prog { id, .. } => id,
            })
    }

    pub fn pin_mode(&self, path: &str) -> Option<u32> {
        self.state.borrow().pins.get(path).map(|pin| pin.mode)
    }

    pub fn pin_owner(&self, path: &str) -> Option<(u32, u32)> {
        self.state.borrow().pins.get(path).map(|pin| pin.owner)
    }

    pub fn pinned_map_info(&self, path: &str) -> Option<MapInfo> {
        self.state
            .borrow()
            .pins
            .get(path)
            .and_then(|pin| match *pin.object {
                KernelObject::Map(info) => Some(info),
                KernelObject::Prog { .. } => None,
            })
    }

    /// Plant a pre-existing pinned map, as a previous boot would have.
    pub fn plant_pinned_map(&self, path: &str, info: MapInfo) {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        state.pins.insert(
            path.to_string(),
            PinEntry {
                object: Rc::new(KernelObject::Map(MapInfo { id, ..info })),
                mode: 0o600,
                owner: (0, 0),
            },
        );
    }

    pub fn dirs(&self) -> Vec<String> {
        self.state.borrow().dirs.clone()
    }

    pub fn file_writes(&self) -> Vec<(String, String)> {
        self.state.borrow().file_writes.clone()
    }

    pub fn open_fd_count(&self) -> usize {
        self.state.borrow().open_fds.len()
    }
}

impl Platform for TestPlatform {
    type Fd = TestFd;

    fn map_create(&self, attr: &MapCreateAttr<'_>) -> SysResult<TestFd> {
        let (id, map_flags) = {
            let mut state = self.state.borrow_mut();
            state.map_creates.push(MapCreateRecord {
                map_type: attr.map_type,
                key_size: attr.key_size,
                value_size: attr.value_size,
                max_entries: attr.max_entries,
                map_flags: attr.map_flags,
                name: attr.name.map(str::to_string),
            });
            let id = state.next_id;
            state.next_id += 1;
            // device maps come back read-only on the program side
            let extra = if attr.map_type == ebpf::BPF_MAP_TYPE_DEVMAP
                || attr.map_type == ebpf::BPF_MAP_TYPE_DEVMAP_HASH
            {
                ebpf::BPF_F_RDONLY_PROG
            } else {
                0
            };
            (id, attr.map_flags | extra)
        };
        let info = MapInfo {
            map_type: attr.map_type,
            id,
            key_size: attr.key_size,
            value_size: attr.value_size,
            max_entries: attr.max_entries,
            map_flags,
        };
        Ok(self.new_fd(Rc::new(KernelObject::Map(info))))
    }

    fn map_retrieve_ro(&self, path: &str) -> SysResult<TestFd> {
        let object = {
            let state = self.state.borrow();
            match state.pins.get(path) {
                Some(pin) if matches!(*pin.object, KernelObject::Map(_)) => {
                    Rc::clone(&pin.object)
                }
                Some(_) => return Err(Errno(libc::EINVAL)),
                None => return Err(Errno(libc::ENOENT)),
            }
        };
        Ok(self.new_fd(object))
    }

    fn map_info(&self, fd: &TestFd) -> SysResult<MapInfo> {
        let state = self.state.borrow();
        match state.open_fds.get(&fd.fd).map(Rc::as_ref) {
            Some(KernelObject::Map(info)) => Ok(*info),
            _ => Err(Errno(libc::EBADF)),
        }
    }

    fn prog_load(&self, attr: &ProgLoadAttr<'_>, log_buf: &mut [u8]) -> SysResult<TestFd> {
        let (id, failure) = {
            let mut state = self.state.borrow_mut();
            state.prog_loads.push(ProgLoadRecord {
                prog_type: attr.prog_type,
                expected_attach_type: attr.expected_attach_type,
                name: attr.name.map(str::to_string),
                license: attr.license.to_vec(),
                insns: attr.insns.to_vec(),
                kern_version: attr.kern_version,
            });
            let failure = if state.prog_load_failures.is_empty() {
                None
            } else {
                Some(state.prog_load_failures.remove(0))
            };
            let id = state.next_id;
            state.next_id += 1;
            (id, failure)
        };
        if let Some((errno, log)) = failure {
            let n = log.len().min(log_buf.len().saturating_sub(1));
            log_buf[..n].copy_from_slice(&log.as_bytes()[..n]);
            return Err(Errno(errno));
        }
        Ok(self.new_fd(Rc::new(KernelObject::Prog {
            id,
            prog_type: attr.prog_type,
        })))
    }

    fn prog_retrieve(&self, path: &str) -> SysResult<TestFd> {
        let object = {
            let state = self.state.borrow();
            match state.pins.get(path) {
                Some(pin) if matches!(*pin.object, KernelObject::Prog { .. }) => {
                    Rc::clone(&pin.object)
                }
                Some(_) => return Err(Errno(libc::EINVAL)),
                None => return Err(Errno(libc::ENOENT)),
            }
        };
        Ok(self.new_fd(object))
    }

    fn prog_id(&self, fd: &TestFd) -> SysResult<u32> {
        let state = self.state.borrow();
        match state.open_fds.get(&fd.fd).map(Rc::as_ref) {
            Some(KernelObject::Prog { id, .. }) => Ok(*id),
            _ => Err(Errno(libc::EBADF)),
        }
    }

    fn obj_pin(&self, fd: &TestFd, path: &str) -> SysResult<()> {
        let mut state = self.state.borrow_mut();
        if state.pins.contains_key(path) {
            return Err(Errno(libc::EEXIST));
        }
        let Some(object) = state.open_fds.get(&fd.fd).map(Rc::clone) else {
            return Err(Errno(libc::EBADF));
        };
        state.pins.insert(
            path.to_string(),
            PinEntry {
                object,
                mode: 0o600,
                owner: (0, 0),
            },
        );
        Ok(())
    }

    fn rename_exclusive(&self, from: &str, to: &str) -> SysResult<()> {
        let mut state = self.state.borrow_mut();
        if state.pins.contains_key(to) {
            return Err(Errno(libc::EEXIST));
        }
        let Some(entry) = state.pins.remove(from) else {
            return Err(Errno(libc::ENOENT));
        };
        state.pins.insert(to.to_string(), entry);
        state.renames.push((from.to_string(), to.to_string()));
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        let state = self.state.borrow();
        state.pins.contains_key(path) || state.dirs.iter().any(|d| d == path)
    }

    fn mkdir_sticky(&self, path: &str) -> SysResult<()> {
        let mut state = self.state.borrow_mut();
        if !state.dirs.iter().any(|d| d == path) {
            state.dirs.push(path.to_string());
        }
        Ok(())
    }

    fn chmod(&self, path: &str, mode: u32) -> SysResult<()> {
        let mut state = self.state.borrow_mut();
        match state.pins.get_mut(path) {
            Some(pin) => {
                pin.mode = mode;
                Ok(())
            }
            None => Err(Errno(libc::ENOENT)),
        }
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> SysResult<()> {
        let mut state = self.state.borrow_mut();
        match state.pins.get_mut(path) {
            Some(pin) => {
                pin.owner = (uid, gid);
                Ok(())
            }
            None => Err(Errno(libc::ENOENT)),
        }
    }

    fn write_file(&self, path: &str, value: &str) -> SysResult<()> {
        self.state
            .borrow_mut()
            .file_writes
            .push((path.to_string(), value.to_string()));
        Ok(())
    }
}
