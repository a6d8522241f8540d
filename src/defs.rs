//! Fixed-layout map and program descriptors embedded in object files.
//!
//! The `maps` and `progs` sections are arrays of little-endian records
//! whose size is declared by the object itself. Decoding is what keeps
//! old loaders and new objects (and vice versa) compatible: the in-memory
//! descriptor is zeroed, non-zero defaults are applied, then the first
//! `min(on-disk, in-memory)` bytes of the record are copied over. An older
//! record therefore leaves the newer tail fields at their defaults, and a
//! newer record's unknown tail is ignored.

use byteorder::{ByteOrder, LittleEndian};

/// Loader version objects without a `bpfloader_min_ver` section implicitly require
pub const DEFAULT_BPFLOADER_MIN_VER: u32 = 0;
/// Loader version cap for objects without a `bpfloader_max_ver` section (v1.0)
pub const DEFAULT_BPFLOADER_MAX_VER: u32 = 0x10000;

/// Kernel version cap applied when a record does not carry one
pub const KVER_INF: u32 = 0xFFFF_FFFF;

/// Size of the oldest, unversioned map record: `type` through `mode`
pub const DEFAULT_SIZEOF_BPF_MAP_DEF: usize = 36;
/// Size of the oldest, unversioned program record: `uid` through `optional`
pub const DEFAULT_SIZEOF_BPF_PROG_DEF: usize = 20;

/// In-memory layout size of [`BpfMapDef`]; records longer than this are truncated
pub const SIZEOF_BPF_MAP_DEF: usize = 128;
/// In-memory layout size of [`BpfProgDef`]
pub const SIZEOF_BPF_PROG_DEF: usize = 100;

const CONTEXT_STR_LEN: usize = 32;

/// Build-type and architecture opt-out bits shared by both descriptors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IgnoreBits {
    pub on_eng: bool,
    pub on_user: bool,
    pub on_userdebug: bool,
    pub on_arm32: bool,
    pub on_aarch64: bool,
    pub on_x86_32: bool,
    pub on_x86_64: bool,
    pub on_riscv64: bool,
}

impl IgnoreBits {
    fn decode(bytes: &[u8]) -> Self {
        Self {
            on_eng: bytes[0] != 0,
            on_user: bytes[1] != 0,
            on_userdebug: bytes[2] != 0,
            on_arm32: bytes[3] != 0,
            on_aarch64: bytes[4] != 0,
            on_x86_32: bytes[5] != 0,
            on_x86_64: bytes[6] != 0,
            on_riscv64: bytes[7] != 0,
        }
    }
}

/// One record of the `maps` section.
///
/// Field offsets (bytes, little-endian):
/// ```text
///   0 type          4 key_size     8 value_size  12 max_entries
///  16 map_flags    20 zero        24 uid         28 gid
///  32 mode         36 bpfloader_min_ver          40 bpfloader_max_ver
///  44 min_kver     48 max_kver
///  52 selinux_context[32]         84 pin_subdir[32]
/// 116 shared      117 ignore bits (eng, user, userdebug,
///                     arm32, aarch64, x86_32, x86_64, riscv64)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BpfMapDef {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    /// Reserved, must be zero
    pub zero: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub bpfloader_min_ver: u32,
    pub bpfloader_max_ver: u32,
    pub min_kver: u32,
    pub max_kver: u32,
    pub selinux_context: String,
    pub pin_subdir: String,
    pub shared: bool,
    pub ignore: IgnoreBits,
}

/// One record of the `progs` section.
///
/// Field offsets (bytes, little-endian):
/// ```text
///   0 uid           4 gid          8 min_kver    12 max_kver
///  16 optional     17 ignore bits (same order as maps)
///  28 bpfloader_min_ver           32 bpfloader_max_ver
///  36 selinux_context[32]         68 pin_subdir[32]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BpfProgDef {
    pub uid: u32,
    pub gid: u32,
    pub min_kver: u32,
    pub max_kver: u32,
    /// A verifier rejection of this program is tolerated
    pub optional: bool,
    pub ignore: IgnoreBits,
    pub bpfloader_min_ver: u32,
    pub bpfloader_max_ver: u32,
    pub selinux_context: String,
    pub pin_subdir: String,
}

/// Decode a NUL-padded fixed-width string field. The final byte is
/// treated as a forced terminator regardless of its on-disk value.
fn padded_str(bytes: &[u8]) -> String {
    let field = &bytes[..bytes.len() - 1];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Zero-extend or truncate one on-disk record to the in-memory layout
/// size, with `defaults` pre-applied at their field offsets.
fn layout_record(record: &[u8], image_size: usize, defaults: &[(usize, u32)]) -> Vec<u8> {
    let mut image = vec![0u8; image_size];
    for &(offset, value) in defaults {
        LittleEndian::write_u32(&mut image[offset..offset + 4], value);
    }
    let n = record.len().min(image_size);
    image[..n].copy_from_slice(&record[..n]);
    image
}

/// Split a descriptor section into records of the declared size.
///
/// Returns `None` when the section length is not a whole number of
/// records; the caller treats that as a malformed object.
pub fn split_records(section: &[u8], record_size: usize) -> Option<Vec<&[u8]>> {
    if record_size == 0 || section.len() % record_size != 0 {
        return None;
    }
    Some(section.chunks_exact(record_size).collect())
}

impl BpfMapDef {
    /// Decode one on-disk record of `record_size` bytes.
    pub fn decode(record: &[u8], record_size: usize) -> Self {
        debug_assert_eq!(record.len(), record_size);
        let img = layout_record(
            record,
            SIZEOF_BPF_MAP_DEF,
            &[(40, DEFAULT_BPFLOADER_MAX_VER), (48, KVER_INF)],
        );
        Self {
            map_type: LittleEndian::read_u32(&img[0..4]),
            key_size: LittleEndian::read_u32(&img[4..8]),
            value_size: LittleEndian::read_u32(&img[8..12]),
            max_entries: LittleEndian::read_u32(&img[12..16]),
            map_flags: LittleEndian::read_u32(&img[16..20]),
            zero: LittleEndian::read_u32(&img[20..24]),
            uid: LittleEndian::read_u32(&img[24..28]),
            gid: LittleEndian::read_u32(&img[28..32]),
            mode: LittleEndian::read_u32(&img[32..36]),
            bpfloader_min_ver: LittleEndian::read_u32(&img[36..40]),
            bpfloader_max_ver: LittleEndian::read_u32(&img[40..44]),
            min_kver: LittleEndian::read_u32(&img[44..48]),
            max_kver: LittleEndian::read_u32(&img[48..52]),
            selinux_context: padded_str(&img[52..52 + CONTEXT_STR_LEN]),
            pin_subdir: padded_str(&img[84..84 + CONTEXT_STR_LEN]),
            shared: img[116] != 0,
            ignore: IgnoreBits::decode(&img[117..125]),
        }
    }
}

impl BpfProgDef {
    /// Decode one on-disk record of `record_size` bytes.
    pub fn decode(record: &[u8], record_size: usize) -> Self {
        debug_assert_eq!(record.len(), record_size);
        let img = layout_record(
            record,
            SIZEOF_BPF_PROG_DEF,
            &[(12, KVER_INF), (32, DEFAULT_BPFLOADER_MAX_VER)],
        );
        Self {
            uid: LittleEndian::read_u32(&img[0..4]),
            gid: LittleEndian::read_u32(&img[4..8]),
            min_kver: LittleEndian::read_u32(&img[8..12]),
            max_kver: LittleEndian::read_u32(&img[12..16]),
            optional: img[16] != 0,
            ignore: IgnoreBits::decode(&img[17..25]),
            bpfloader_min_ver: LittleEndian::read_u32(&img[28..32]),
            bpfloader_max_ver: LittleEndian::read_u32(&img[32..36]),
            selinux_context: padded_str(&img[36..36 + CONTEXT_STR_LEN]),
            pin_subdir: padded_str(&img[68..68 + CONTEXT_STR_LEN]),
        }
    }
}
