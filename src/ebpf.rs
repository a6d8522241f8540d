//! Constants of the eBPF ABI shared with the kernel.
//!
//! Only the slice of the ABI this loader touches is defined here: the
//! instruction encoding needed to patch map references, the map and
//! program type tags declared by object files, and the `bpf(2)` command
//! numbers of the syscall port.

/// Size of a BPF instruction in bytes
pub const INSN_SIZE: usize = 8;

// An instruction is laid out, from least significant byte up, as:
//   8 bit opcode
//   4 bit destination register | 4 bit source register
//   16 bit offset
//   32 bit immediate
/// Byte offset of the register nibbles within an instruction
pub const INSN_REGS_OFFSET: usize = 1;
/// Byte offset of the immediate field within an instruction
pub const INSN_IMM_OFFSET: usize = 4;

/// Load to register instruction class
pub const BPF_LD: u8 = 0x00;
/// Immediate value mode modifier
pub const BPF_IMM: u8 = 0x00;
/// 64-bit doubleword size modifier
pub const BPF_DW: u8 = 0x18;

/// Opcode of the two-slot 64-bit load-immediate instruction, the only
/// valid target of a map relocation.
pub const BPF_LD_IMM64_OPCODE: u8 = BPF_LD | BPF_IMM | BPF_DW;

/// Marker placed in `src_reg` telling the verifier that the immediate
/// field holds a map file descriptor rather than a plain constant.
pub const BPF_PSEUDO_MAP_FD: u8 = 1;

// bpf(2) commands
pub const BPF_MAP_CREATE: u32 = 0;
pub const BPF_PROG_LOAD: u32 = 5;
pub const BPF_OBJ_PIN: u32 = 6;
pub const BPF_OBJ_GET: u32 = 7;
pub const BPF_OBJ_GET_INFO_BY_FD: u32 = 15;

// Map types (kernel enum bpf_map_type)
pub const BPF_MAP_TYPE_UNSPEC: u32 = 0;
pub const BPF_MAP_TYPE_HASH: u32 = 1;
pub const BPF_MAP_TYPE_ARRAY: u32 = 2;
pub const BPF_MAP_TYPE_PROG_ARRAY: u32 = 3;
pub const BPF_MAP_TYPE_PERF_EVENT_ARRAY: u32 = 4;
pub const BPF_MAP_TYPE_PERCPU_HASH: u32 = 5;
pub const BPF_MAP_TYPE_PERCPU_ARRAY: u32 = 6;
pub const BPF_MAP_TYPE_LRU_HASH: u32 = 9;
pub const BPF_MAP_TYPE_LPM_TRIE: u32 = 11;
pub const BPF_MAP_TYPE_DEVMAP: u32 = 14;
pub const BPF_MAP_TYPE_DEVMAP_HASH: u32 = 25;
pub const BPF_MAP_TYPE_RINGBUF: u32 = 27;

/// Map flag set by the kernel on device maps: read-only from the program side
pub const BPF_F_RDONLY_PROG: u32 = 1 << 7;

// Program types (kernel enum bpf_prog_type)
pub const BPF_PROG_TYPE_UNSPEC: u32 = 0;
pub const BPF_PROG_TYPE_SOCKET_FILTER: u32 = 1;
pub const BPF_PROG_TYPE_SCHED_CLS: u32 = 3;
pub const BPF_PROG_TYPE_SCHED_ACT: u32 = 4;
pub const BPF_PROG_TYPE_XDP: u32 = 6;
pub const BPF_PROG_TYPE_CGROUP_SKB: u32 = 8;
pub const BPF_PROG_TYPE_CGROUP_SOCK: u32 = 9;
pub const BPF_PROG_TYPE_LWT_IN: u32 = 10;
pub const BPF_PROG_TYPE_LWT_OUT: u32 = 11;
pub const BPF_PROG_TYPE_LWT_XMIT: u32 = 12;
pub const BPF_PROG_TYPE_SOCK_OPS: u32 = 13;
pub const BPF_PROG_TYPE_CGROUP_SOCK_ADDR: u32 = 18;
pub const BPF_PROG_TYPE_LWT_SEG6LOCAL: u32 = 19;
pub const BPF_PROG_TYPE_CGROUP_SYSCTL: u32 = 23;
pub const BPF_PROG_TYPE_CGROUP_SOCKOPT: u32 = 25;

// Expected attach types (kernel enum bpf_attach_type)
//
// Zero is BPF_CGROUP_INET_INGRESS; it doubles as "unspecified" in
// bpf_attr, which is why sections with no meaningful attach point use it.
pub const BPF_ATTACH_TYPE_UNSPEC: u32 = 0;
pub const BPF_CGROUP_INET_INGRESS: u32 = 0;
pub const BPF_CGROUP_INET_EGRESS: u32 = 1;
pub const BPF_CGROUP_INET_SOCK_CREATE: u32 = 2;
pub const BPF_CGROUP_SOCK_OPS: u32 = 3;
pub const BPF_CGROUP_INET4_BIND: u32 = 8;
pub const BPF_CGROUP_INET6_BIND: u32 = 9;
pub const BPF_CGROUP_INET4_CONNECT: u32 = 10;
pub const BPF_CGROUP_INET6_CONNECT: u32 = 11;
pub const BPF_CGROUP_INET4_POST_BIND: u32 = 12;
pub const BPF_CGROUP_INET6_POST_BIND: u32 = 13;
pub const BPF_CGROUP_UDP4_SENDMSG: u32 = 14;
pub const BPF_CGROUP_UDP6_SENDMSG: u32 = 15;
pub const BPF_CGROUP_SYSCTL: u32 = 18;
pub const BPF_CGROUP_UDP4_RECVMSG: u32 = 19;
pub const BPF_CGROUP_UDP6_RECVMSG: u32 = 20;
pub const BPF_CGROUP_GETSOCKOPT: u32 = 21;
pub const BPF_CGROUP_SETSOCKOPT: u32 = 22;
pub const BPF_CGROUP_INET_SOCK_RELEASE: u32 = 34;

/// Maximum length of a map or program name embedded in bpf_attr,
/// including the trailing NUL.
pub const BPF_OBJ_NAME_LEN: usize = 16;
