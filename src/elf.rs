//! Reader for the ELF64 relocatable objects produced by a BPF-targeted
//! compiler.
//!
//! The whole image is pulled into memory once; every accessor decodes on
//! demand from the byte buffer. Nothing here is written back: relocation
//! happens on copies of the code sections, never on the image itself.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info};
use std::path::Path;

/// Symbol table section type
pub const SHT_SYMTAB: u32 = 2;
/// Relocation (without addend) section type
pub const SHT_REL: u32 = 9;

/// Data object symbol type
pub const STT_OBJECT: u8 = 1;
/// Function symbol type
pub const STT_FUNC: u8 = 2;

/// Size of an ELF64 file header
pub const EHDR_SIZE: usize = 64;
/// Size of an ELF64 section header
pub const SHDR_SIZE: usize = 64;
/// Size of an ELF64 symbol table entry
pub const SYM_SIZE: usize = 24;
/// Size of an ELF64 Rel entry
pub const REL_SIZE: usize = 16;

/// Error definitions
#[derive(Debug, thiserror::Error)]
pub enum ElfError {
    /// Failed to read the object file
    #[error("failed to read object: {0}")]
    Io(#[from] std::io::Error),
    /// Not an ELF image
    #[error("bad ELF magic")]
    BadMagic,
    /// Incompatible ELF: wrong class
    #[error("incompatible ELF: not 64-bit")]
    WrongClass,
    /// Incompatible ELF: wrong endianness
    #[error("incompatible ELF: not little-endian")]
    WrongEndianness,
    /// A header or section extends past the end of the image
    #[error("truncated {0}")]
    Truncated(&'static str),
    /// Section not found
    #[error("section not found: {0}")]
    SectionNotFound(String),
    /// A string table offset points outside its table
    #[error("string table offset {0} out of bounds")]
    BadStringOffset(usize),
    /// A name in a string table is not valid UTF-8
    #[error("string table entry is not valid UTF-8")]
    BadString,
    /// The object carries no symbol table
    #[error("no symbol table")]
    NoSymbolTable,
    /// Symbol index out of bounds
    #[error("symbol index {0} out of bounds")]
    BadSymbolIndex(usize),
}

/// ELF64 section header
#[derive(Debug, Clone, Copy, Default)]
pub struct Elf64Shdr {
    /// Offset of the section name in the section-header string table
    pub sh_name: u32,
    /// Section type
    pub sh_type: u32,
    /// Section flags
    pub sh_flags: u64,
    /// Virtual address (unused in relocatable objects)
    pub sh_addr: u64,
    /// File offset of the section data
    pub sh_offset: u64,
    /// Size of the section data in bytes
    pub sh_size: u64,
    /// Section-type specific link (for SYMTAB: its string table)
    pub sh_link: u32,
    /// Section-type specific info
    pub sh_info: u32,
    /// Alignment
    pub sh_addralign: u64,
    /// Entry size for table-like sections
    pub sh_entsize: u64,
}

/// ELF64 symbol table entry
#[derive(Debug, Clone, Copy, Default)]
pub struct Elf64Sym {
    /// Offset of the symbol name in the linked string table
    pub st_name: u32,
    /// Type (low nibble) and binding (high nibble)
    pub st_info: u8,
    /// Visibility
    pub st_other: u8,
    /// Index of the section the symbol lives in
    pub st_shndx: u16,
    /// Value (offset within the section for relocatable objects)
    pub st_value: u64,
    /// Size of the object the symbol names
    pub st_size: u64,
}

impl Elf64Sym {
    /// Symbol type, the low nibble of `st_info`
    pub fn st_type(&self) -> u8 {
        self.st_info & 0xf
    }
}

/// ELF64 Rel relocation entry
#[derive(Debug, Clone, Copy)]
pub struct Elf64Rel {
    /// Byte offset of the relocation target within its section
    pub r_offset: u64,
    /// Symbol index (high 32 bits) and relocation type (low 32 bits)
    pub r_info: u64,
}

impl Elf64Rel {
    /// Index into the symbol table of the symbol this relocation refers to
    pub fn sym_index(&self) -> usize {
        (self.r_info >> 32) as usize
    }
}

/// Decode a byte buffer as a table of Rel entries.
///
/// A trailing partial entry is ignored, matching how the toolchain sizes
/// these tables.
pub fn parse_rel_table(bytes: &[u8]) -> Vec<Elf64Rel> {
    bytes
        .chunks_exact(REL_SIZE)
        .map(|rec| Elf64Rel {
            r_offset: LittleEndian::read_u64(&rec[0..8]),
            r_info: LittleEndian::read_u64(&rec[8..16]),
        })
        .collect()
}

fn decode_shdr(rec: &[u8]) -> Elf64Shdr {
    Elf64Shdr {
        sh_name: LittleEndian::read_u32(&rec[0..4]),
        sh_type: LittleEndian::read_u32(&rec[4..8]),
        sh_flags: LittleEndian::read_u64(&rec[8..16]),
        sh_addr: LittleEndian::read_u64(&rec[16..24]),
        sh_offset: LittleEndian::read_u64(&rec[24..32]),
        sh_size: LittleEndian::read_u64(&rec[32..40]),
        sh_link: LittleEndian::read_u32(&rec[40..44]),
        sh_info: LittleEndian::read_u32(&rec[44..48]),
        sh_addralign: LittleEndian::read_u64(&rec[48..56]),
        sh_entsize: LittleEndian::read_u64(&rec[56..64]),
    }
}

fn decode_sym(rec: &[u8]) -> Elf64Sym {
    Elf64Sym {
        st_name: LittleEndian::read_u32(&rec[0..4]),
        st_info: rec[4],
        st_other: rec[5],
        st_shndx: LittleEndian::read_u16(&rec[6..8]),
        st_value: LittleEndian::read_u64(&rec[8..16]),
        st_size: LittleEndian::read_u64(&rec[16..24]),
    }
}

/// Read the NUL-terminated string at `offset` in a string table.
fn cstr_at(table: &[u8], offset: usize) -> Result<&str, ElfError> {
    let tail = table
        .get(offset..)
        .ok_or(ElfError::BadStringOffset(offset))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(ElfError::BadStringOffset(offset))?;
    std::str::from_utf8(&tail[..end]).map_err(|_| ElfError::BadString)
}

/// A parsed BPF object image.
#[derive(Debug)]
pub struct ElfFile {
    bytes: Vec<u8>,
    shdrs: Vec<Elf64Shdr>,
    shstrndx: usize,
}

impl ElfFile {
    /// Read and parse an object file from disk.
    pub fn open(path: &Path) -> Result<Self, ElfError> {
        Self::parse(std::fs::read(path)?)
    }

    /// Parse an in-memory object image.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, ElfError> {
        let header = bytes
            .get(..EHDR_SIZE)
            .ok_or(ElfError::Truncated("ELF header"))?;
        if &header[0..4] != b"\x7fELF" {
            return Err(ElfError::BadMagic);
        }
        if header[4] != 2 {
            return Err(ElfError::WrongClass);
        }
        if header[5] != 1 {
            return Err(ElfError::WrongEndianness);
        }

        let e_shoff = LittleEndian::read_u64(&header[40..48]) as usize;
        let e_shnum = LittleEndian::read_u16(&header[60..62]) as usize;
        let e_shstrndx = LittleEndian::read_u16(&header[62..64]) as usize;

        let table = bytes
            .get(e_shoff..e_shoff.saturating_add(e_shnum.saturating_mul(SHDR_SIZE)))
            .ok_or(ElfError::Truncated("section header table"))?;
        let shdrs: Vec<Elf64Shdr> = table.chunks_exact(SHDR_SIZE).map(decode_shdr).collect();
        if e_shstrndx >= shdrs.len() {
            return Err(ElfError::Truncated("section header string table"));
        }

        Ok(Self {
            bytes,
            shdrs,
            shstrndx: e_shstrndx,
        })
    }

    /// Number of sections in the object.
    pub fn section_count(&self) -> usize {
        self.shdrs.len()
    }

    /// The section header at `index`.
    pub fn section_header(&self, index: usize) -> Option<&Elf64Shdr> {
        self.shdrs.get(index)
    }

    /// The raw data of the section at `index`.
    pub fn section_data(&self, index: usize) -> Result<&[u8], ElfError> {
        let shdr = self
            .shdrs
            .get(index)
            .ok_or(ElfError::Truncated("section header table"))?;
        let start = shdr.sh_offset as usize;
        let end = start.saturating_add(shdr.sh_size as usize);
        self.bytes
            .get(start..end)
            .ok_or(ElfError::Truncated("section data"))
    }

    /// The name of the section at `index`, from the section-header string table.
    pub fn section_name(&self, index: usize) -> Result<&str, ElfError> {
        let sh_name = self
            .shdrs
            .get(index)
            .ok_or(ElfError::Truncated("section header table"))?
            .sh_name as usize;
        let shstrtab = self.section_data(self.shstrndx)?;
        cstr_at(shstrtab, sh_name)
    }

    /// Index of the first section named `name`.
    pub fn find_section(&self, name: &str) -> Option<usize> {
        (0..self.shdrs.len()).find(|&i| self.section_name(i).map_or(false, |n| n == name))
    }

    /// The data of the first section named `name`, or `None` if absent.
    pub fn read_section(&self, name: &str) -> Result<Option<&[u8]>, ElfError> {
        match self.find_section(name) {
            Some(idx) => self.section_data(idx).map(Some),
            None => Ok(None),
        }
    }

    /// The data of the first section of type `sh_type`, or `None` if absent.
    pub fn read_section_by_type(&self, sh_type: u32) -> Result<Option<&[u8]>, ElfError> {
        match self.shdrs.iter().position(|s| s.sh_type == sh_type) {
            Some(idx) => self.section_data(idx).map(Some),
            None => Ok(None),
        }
    }

    fn symtab_section(&self) -> Result<usize, ElfError> {
        self.shdrs
            .iter()
            .position(|s| s.sh_type == SHT_SYMTAB)
            .ok_or(ElfError::NoSymbolTable)
    }

    /// The symbol table, optionally sorted by ascending `st_value`.
    ///
    /// The sorted form keeps symbols of a table-like section (`maps`,
    /// `progs`) in record order, so names and records can be matched by
    /// index.
    pub fn symbol_table(&self, sort: bool) -> Result<Vec<Elf64Sym>, ElfError> {
        let data = self.section_data(self.symtab_section()?)?;
        let mut syms: Vec<Elf64Sym> = data.chunks_exact(SYM_SIZE).map(decode_sym).collect();
        if sort {
            syms.sort_by_key(|s| s.st_value);
        }
        Ok(syms)
    }

    /// The name of symbol `index` in the unsorted symbol table, resolved
    /// through the string table the symbol table links to.
    pub fn symbol_name(&self, index: usize) -> Result<&str, ElfError> {
        let symtab_idx = self.symtab_section()?;
        let data = self.section_data(symtab_idx)?;
        let rec = data
            .chunks_exact(SYM_SIZE)
            .nth(index)
            .ok_or(ElfError::BadSymbolIndex(index))?;
        let sym = decode_sym(rec);
        let strtab_idx = self.shdrs[symtab_idx].sh_link as usize;
        let strtab = self.section_data(strtab_idx)?;
        cstr_at(strtab, sym.st_name as usize)
    }

    /// Names of the symbols resident in section `section_name`, in
    /// `st_value` order, optionally filtered by symbol type.
    pub fn symbols_in_section(
        &self,
        section_name: &str,
        symbol_type: Option<u8>,
    ) -> Result<Vec<String>, ElfError> {
        let sec_idx = self
            .find_section(section_name)
            .ok_or_else(|| ElfError::SectionNotFound(section_name.to_string()))?;
        let symtab_idx = self.symtab_section()?;
        let strtab = self.section_data(self.shdrs[symtab_idx].sh_link as usize)?;

        let mut names = Vec::new();
        for sym in self.symbol_table(true)? {
            if let Some(ty) = symbol_type {
                if sym.st_type() != ty {
                    continue;
                }
            }
            if sym.st_shndx as usize == sec_idx {
                names.push(cstr_at(strtab, sym.st_name as usize)?.to_string());
            }
        }
        Ok(names)
    }

    /// Decode the first four bytes of section `name` as a little-endian
    /// unsigned integer, falling back to `default` when the section is
    /// absent or too short.
    pub fn read_section_uint(&self, name: &str, default: u32) -> u32 {
        match self.read_section(name) {
            Ok(Some(bytes)) if bytes.len() >= 4 => {
                let value = LittleEndian::read_u32(&bytes[0..4]);
                info!("section {} value is {} [{:#x}]", name, value, value);
                value
            }
            Ok(Some(bytes)) => {
                error!(
                    "section {} too short ({} bytes), defaulting to {} [{:#x}]",
                    name,
                    bytes.len(),
                    default,
                    default
                );
                default
            }
            _ => {
                debug!(
                    "no {} section, defaulting to {} [{:#x}]",
                    name, default, default
                );
                default
            }
        }
    }
}
