//! Builders for synthetic BPF object files.
//!
//! [`ObjBuilder`] assembles a minimal but structurally honest ELF64
//! relocatable image: declared sections in declaration order (with each
//! `.rel` table emitted directly after its code section), then the
//! symbol table, its string table, and the section-header string table.

use byteorder::{ByteOrder, LittleEndian};

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_REL: u32 = 9;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const REL_SIZE: usize = 16;

/// A little-endian u32, the payload of the version/size constant sections.
pub fn le32(value: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; 4];
    LittleEndian::write_u32(&mut bytes, value);
    bytes
}

/// Everything a `maps` record can carry; encode with [`encode_map_def`].
#[derive(Debug, Clone)]
pub struct MapDefSpec {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
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
    pub ignore_on_eng: bool,
    pub ignore_on_user: bool,
    pub ignore_on_userdebug: bool,
}

impl Default for MapDefSpec {
    fn default() -> Self {
        Self {
            map_type: 1, // hash
            key_size: 4,
            value_size: 4,
            max_entries: 10,
            map_flags: 0,
            zero: 0,
            uid: 0,
            gid: 0,
            mode: 0o660,
            bpfloader_min_ver: 0,
            bpfloader_max_ver: 0x10000,
            min_kver: 0,
            max_kver: 0xFFFF_FFFF,
            selinux_context: String::new(),
            pin_subdir: String::new(),
            shared: false,
            ignore_on_eng: false,
            ignore_on_user: false,
            ignore_on_userdebug: false,
        }
    }
}

fn put_str(buf: &mut [u8], s: &str) {
    let n = s.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&s.as_bytes()[..n]);
}

/// Encode a full-size (128 byte) map record.
pub fn encode_map_def(spec: &MapDefSpec) -> Vec<u8> {
    let mut rec = vec![0u8; 128];
    LittleEndian::write_u32(&mut rec[0..4], spec.map_type);
    LittleEndian::write_u32(&mut rec[4..8], spec.key_size);
    LittleEndian::write_u32(&mut rec[8..12], spec.value_size);
    LittleEndian::write_u32(&mut rec[12..16], spec.max_entries);
    LittleEndian::write_u32(&mut rec[16..20], spec.map_flags);
    LittleEndian::write_u32(&mut rec[20..24], spec.zero);
    LittleEndian::write_u32(&mut rec[24..28], spec.uid);
    LittleEndian::write_u32(&mut rec[28..32], spec.gid);
    LittleEndian::write_u32(&mut rec[32..36], spec.mode);
    LittleEndian::write_u32(&mut rec[36..40], spec.bpfloader_min_ver);
    LittleEndian::write_u32(&mut rec[40..44], spec.bpfloader_max_ver);
    LittleEndian::write_u32(&mut rec[44..48], spec.min_kver);
    LittleEndian::write_u32(&mut rec[48..52], spec.max_kver);
    put_str(&mut rec[52..84], &spec.selinux_context);
    put_str(&mut rec[84..116], &spec.pin_subdir);
    rec[116] = spec.shared as u8;
    rec[117] = spec.ignore_on_eng as u8;
    rec[118] = spec.ignore_on_user as u8;
    rec[119] = spec.ignore_on_userdebug as u8;
    rec
}

/// Everything a `progs` record can carry; encode with [`encode_prog_def`].
#[derive(Debug, Clone)]
pub struct ProgDefSpec {
    pub uid: u32,
    pub gid: u32,
    pub min_kver: u32,
    pub max_kver: u32,
    pub optional: bool,
    pub ignore_on_eng: bool,
    pub ignore_on_user: bool,
    pub ignore_on_userdebug: bool,
    pub bpfloader_min_ver: u32,
    pub bpfloader_max_ver: u32,
    pub selinux_context: String,
    pub pin_subdir: String,
}

impl Default for ProgDefSpec {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            min_kver: 0,
            max_kver: 0xFFFF_FFFF,
            optional: false,
            ignore_on_eng: false,
            ignore_on_user: false,
            ignore_on_userdebug: false,
            bpfloader_min_ver: 0,
            bpfloader_max_ver: 0x10000,
            selinux_context: String::new(),
            pin_subdir: String::new(),
        }
    }
}

/// Encode a full-size (100 byte) program record.
pub fn encode_prog_def(spec: &ProgDefSpec) -> Vec<u8> {
    let mut rec = vec![0u8; 100];
    LittleEndian::write_u32(&mut rec[0..4], spec.uid);
    LittleEndian::write_u32(&mut rec[4..8], spec.gid);
    LittleEndian::write_u32(&mut rec[8..12], spec.min_kver);
    LittleEndian::write_u32(&mut rec[12..16], spec.max_kver);
    rec[16] = spec.optional as u8;
    rec[17] = spec.ignore_on_eng as u8;
    rec[18] = spec.ignore_on_user as u8;
    rec[19] = spec.ignore_on_userdebug as u8;
    LittleEndian::write_u32(&mut rec[28..32], spec.bpfloader_min_ver);
    LittleEndian::write_u32(&mut rec[32..36], spec.bpfloader_max_ver);
    put_str(&mut rec[36..68], &spec.selinux_context);
    put_str(&mut rec[68..100], &spec.pin_subdir);
    rec
}

struct SectionSpec {
    name: String,
    data: Vec<u8>,
}

struct SymSpec {
    name: String,
    section: String,
    st_type: u8,
    value: u64,
}

/// Assembles an ELF64 relocatable BPF object image.
#[derive(Default)]
pub struct ObjBuilder {
    sections: Vec<SectionSpec>,
    symbols: Vec<SymSpec>,
    rels: Vec<(String, Vec<(u64, String)>)>,
}

impl ObjBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a PROGBITS section.
    pub fn section(&mut self, name: &str, data: &[u8]) -> &mut Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            data: data.to_vec(),
        });
        self
    }

    /// Add a symbol of `st_type` at `value` inside `section`.
    pub fn symbol(&mut self, name: &str, section: &str, st_type: u8, value: u64) -> &mut Self {
        self.symbols.push(SymSpec {
            name: name.to_string(),
            section: section.to_string(),
            st_type,
            value,
        });
        self
    }

    /// Attach a relocation table to `section`; entries are
    /// `(byte offset, symbol name)`. The table is emitted at the section
    /// index right after its target.
    pub fn rel(&mut self, section: &str, entries: &[(u64, &str)]) -> &mut Self {
        self.rels.push((
            section.to_string(),
            entries
                .iter()
                .map(|(off, sym)| (*off, sym.to_string()))
                .collect(),
        ));
        self
    }

    /// Produce the object image.
    pub fn build(&self) -> Vec<u8> {
        // Final section order: null, user sections with each .rel right
        // behind its target, .symtab, .strtab, .shstrtab.
        struct OutSection {
            name: String,
            sh_type: u32,
            sh_link: u32,
            sh_entsize: u64,
            data: Vec<u8>,
        }

        // symbol string table; index 0 is the empty name
        let mut strtab = vec![0u8];
        let mut sym_name_offsets = Vec::new();
        for sym in &self.symbols {
            sym_name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }

        let mut out: Vec<OutSection> = vec![OutSection {
            name: String::new(),
            sh_type: 0,
            sh_link: 0,
            sh_entsize: 0,
            data: Vec::new(),
        }];
        for spec in &self.sections {
            out.push(OutSection {
                name: spec.name.clone(),
                sh_type: SHT_PROGBITS,
                sh_link: 0,
                sh_entsize: 0,
                data: spec.data.clone(),
            });
            if let Some((_, entries)) = self.rels.iter().find(|(target, _)| *target == spec.name)
            {
                let mut data = vec![0u8; entries.len() * REL_SIZE];
                for (i, (offset, sym_name)) in entries.iter().enumerate() {
                    // symbol table index: null symbol + declaration order
                    let sym_index = 1 + self
                        .symbols
                        .iter()
                        .position(|s| s.name == *sym_name)
                        .unwrap_or_else(|| panic!("relocation against unknown symbol {sym_name}"));
                    let rec = &mut data[i * REL_SIZE..(i + 1) * REL_SIZE];
                    LittleEndian::write_u64(&mut rec[0..8], *offset);
                    LittleEndian::write_u64(&mut rec[8..16], ((sym_index as u64) << 32) | 1);
                }
                out.push(OutSection {
                    name: format!(".rel{}", spec.name),
                    sh_type: SHT_REL,
                    sh_link: 0, // patched to symtab index below
                    sh_entsize: REL_SIZE as u64,
                    data,
                });
            }
        }

        let section_index = |sections: &[OutSection], name: &str| -> u16 {
            sections
                .iter()
                .position(|s| s.name == name)
                .unwrap_or_else(|| panic!("symbol in unknown section {name}")) as u16
        };

        let symtab_index = out.len() as u32;
        let strtab_index = symtab_index + 1;

        let mut symtab = vec![0u8; SYM_SIZE]; // null symbol
        for (sym, name_off) in self.symbols.iter().zip(&sym_name_offsets) {
            let mut rec = vec![0u8; SYM_SIZE];
            LittleEndian::write_u32(&mut rec[0..4], *name_off);
            rec[4] = (1 << 4) | (sym.st_type & 0xf); // global binding
            LittleEndian::write_u16(&mut rec[6..8], section_index(&out, &sym.section));
            LittleEndian::write_u64(&mut rec[8..16], sym.value);
            symtab.extend_from_slice(&rec);
        }

        for section in out.iter_mut() {
            if section.sh_type == SHT_REL {
                section.sh_link = symtab_index;
            }
        }
        out.push(OutSection {
            name: ".symtab".to_string(),
            sh_type: SHT_SYMTAB,
            sh_link: strtab_index,
            sh_entsize: SYM_SIZE as u64,
            data: symtab,
        });
        out.push(OutSection {
            name: ".strtab".to_string(),
            sh_type: SHT_STRTAB,
            sh_link: 0,
            sh_entsize: 0,
            data: strtab,
        });

        let mut shstrtab = vec![0u8];
        let mut sh_name_offsets = Vec::new();
        for section in &out {
            if section.name.is_empty() {
                sh_name_offsets.push(0u32);
            } else {
                sh_name_offsets.push(shstrtab.len() as u32);
                shstrtab.extend_from_slice(section.name.as_bytes());
                shstrtab.push(0);
            }
        }
        sh_name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(b".shstrtab\0");
        let shstrndx = out.len() as u16;
        out.push(OutSection {
            name: ".shstrtab".to_string(),
            sh_type: SHT_STRTAB,
            sh_link: 0,
            sh_entsize: 0,
            data: shstrtab,
        });

        // layout: header, section data blobs, then the header table
        let mut image = vec![0u8; EHDR_SIZE];
        let mut offsets = Vec::new();
        for section in &out {
            while image.len() % 8 != 0 {
                image.push(0);
            }
            offsets.push(image.len() as u64);
            image.extend_from_slice(&section.data);
        }
        while image.len() % 8 != 0 {
            image.push(0);
        }
        let e_shoff = image.len() as u64;
        for (i, section) in out.iter().enumerate() {
            let mut shdr = vec![0u8; SHDR_SIZE];
            LittleEndian::write_u32(&mut shdr[0..4], sh_name_offsets[i]);
            LittleEndian::write_u32(&mut shdr[4..8], section.sh_type);
            LittleEndian::write_u64(&mut shdr[24..32], offsets[i]);
            LittleEndian::write_u64(&mut shdr[32..40], section.data.len() as u64);
            LittleEndian::write_u32(&mut shdr[40..44], section.sh_link);
            LittleEndian::write_u64(&mut shdr[56..64], section.sh_entsize);
            image.extend_from_slice(&shdr);
        }

        image[0..4].copy_from_slice(b"\x7fELF");
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // ELFDATA2LSB
        image[6] = 1; // EV_CURRENT
        LittleEndian::write_u16(&mut image[16..18], 1); // ET_REL
        LittleEndian::write_u16(&mut image[18..20], 247); // EM_BPF
        LittleEndian::write_u32(&mut image[20..24], 1);
        LittleEndian::write_u64(&mut image[40..48], e_shoff);
        LittleEndian::write_u16(&mut image[52..54], EHDR_SIZE as u16);
        LittleEndian::write_u16(&mut image[58..60], SHDR_SIZE as u16);
        LittleEndian::write_u16(&mut image[60..62], out.len() as u16);
        LittleEndian::write_u16(&mut image[62..64], shstrndx);
        image
    }
}
