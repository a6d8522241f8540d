//! Patches map references into the instruction streams of an object.
//!
//! The compiler leaves a two-slot 64-bit load-immediate wherever a
//! program touches a map, plus a Rel entry pointing at it. Realizing the
//! reference means writing the map's fd into the first slot's immediate
//! and flagging the source register so the verifier resolves the fd into
//! a map pointer.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error};
use std::os::fd::AsRawFd;

use crate::ebpf;
use crate::elf::{parse_rel_table, ElfError, ElfFile};
use crate::loader::CodeSection;

/// Patch one instruction in place with a map fd.
///
/// Anything other than the load-immediate opcode at the target is a
/// malformed relocation; it is logged and left untouched, and the
/// verifier gets the final say on the program.
fn apply_relocation(insns: &mut [u8], offset: u64, fd: i32) {
    let insn_index = offset as usize / ebpf::INSN_SIZE;
    let byte_offset = insn_index * ebpf::INSN_SIZE;
    let Some(insn) = insns.get_mut(byte_offset..byte_offset + ebpf::INSN_SIZE) else {
        error!("relocation at {:#x} is outside the section", offset);
        return;
    };
    if insn[0] != ebpf::BPF_LD_IMM64_OPCODE {
        error!(
            "invalid relocation target at insn {}: opcode {:#x}",
            insn_index, insn[0]
        );
        return;
    }
    LittleEndian::write_i32(&mut insn[ebpf::INSN_IMM_OFFSET..ebpf::INSN_IMM_OFFSET + 4], fd);
    insn[ebpf::INSN_REGS_OFFSET] =
        (insn[ebpf::INSN_REGS_OFFSET] & 0x0f) | (ebpf::BPF_PSEUDO_MAP_FD << 4);
}

/// Resolve every map relocation of every code section against the
/// realized fd list.
///
/// `map_names` and `map_fds` are the index-parallel arrays produced by
/// map realization. Relocations whose symbol is not a map are left for
/// the kernel to judge; relocations against a gated-out map stay
/// unpatched, since the programs referencing them carry the same gates.
pub fn apply_map_relocations<F: AsRawFd>(
    elf: &ElfFile,
    map_names: &[String],
    map_fds: &[Option<F>],
    sections: &mut [CodeSection],
) -> Result<(), ElfError> {
    for cs in sections.iter_mut() {
        for rel in parse_rel_table(&cs.rel_data) {
            let sym_name = elf.symbol_name(rel.sym_index())?;
            let Some(map_index) = map_names.iter().position(|n| n == sym_name) else {
                continue;
            };
            match &map_fds[map_index] {
                Some(fd) => apply_relocation(&mut cs.data, rel.r_offset, fd.as_raw_fd()),
                None => debug!(
                    "not relocating {} in {} against skipped map",
                    sym_name, cs.name
                ),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ld_imm64(dst: u8, imm: i32) -> [u8; 16] {
        let mut insn = [0u8; 16];
        insn[0] = ebpf::BPF_LD_IMM64_OPCODE;
        insn[1] = dst & 0x0f;
        LittleEndian::write_i32(&mut insn[4..8], imm);
        insn
    }

    #[test]
    fn patches_imm_and_src_reg() {
        let mut insns = ld_imm64(1, 0).to_vec();
        apply_relocation(&mut insns, 0, 17);
        assert_eq!(LittleEndian::read_i32(&insns[4..8]), 17);
        assert_eq!(insns[1] >> 4, ebpf::BPF_PSEUDO_MAP_FD);
        assert_eq!(insns[1] & 0x0f, 1); // dst untouched
        // second slot of the pair untouched
        assert_eq!(&insns[8..16], &[0u8; 8]);
    }

    #[test]
    fn wrong_opcode_leaves_stream_unchanged() {
        let mut insns = vec![0u8; 16];
        insns[0] = 0xb7; // mov64 imm
        let before = insns.clone();
        apply_relocation(&mut insns, 0, 17);
        assert_eq!(insns, before);
    }

    #[test]
    fn out_of_bounds_offset_is_ignored() {
        let mut insns = ld_imm64(0, 0).to_vec();
        let before = insns.clone();
        apply_relocation(&mut insns, 64, 17);
        assert_eq!(insns, before);
    }
}
