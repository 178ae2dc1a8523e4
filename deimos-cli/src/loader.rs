//! ELF loading: copies PT_LOAD segments into guest RAM and reports the entry point.

use deimos_core::board::Board;
use goblin::elf::program_header::PT_LOAD;
use log::debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("not a loadable ELF: {0}")]
    Parse(#[from] goblin::error::Error),
    #[error("ELF is not 64-bit little-endian RISC-V")]
    WrongMachine,
    #[error("segment does not fit in guest RAM: {0}")]
    Placement(#[from] deimos_core::board::BoardError),
}

/// Parse the ELF header only, returning the entry point. Used to pick the board's reset vector
/// before the board exists.
pub fn entry_point(program_elf: &[u8]) -> Result<u64, LoadError> {
    let elf = parse(program_elf)?;
    Ok(elf.header.e_entry)
}

fn parse(program_elf: &[u8]) -> Result<goblin::elf::Elf, LoadError> {
    let elf = goblin::elf::Elf::parse(program_elf)?;
    if !elf.is_64 || !elf.little_endian || elf.header.e_machine != goblin::elf::header::EM_RISCV {
        return Err(LoadError::WrongMachine);
    }
    Ok(elf)
}

/// Load the PT_LOAD segments of `program_elf` into `board`'s RAM at their physical addresses.
/// Returns the ELF entry point.
pub fn load_elf(board: &mut Board, program_elf: &[u8]) -> Result<u64, LoadError> {
    let elf = parse(program_elf)?;

    let segments = elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD);
    for header in segments {
        debug!(
            "loading segment: file range [{:#010x?}..{:#010x?}] to pmem range [{:#010x?}..{:#010x?}] (virt {:#010x?})",
            header.p_offset,
            header.p_offset + header.p_filesz,
            header.p_paddr,
            header.p_paddr + header.p_memsz,
            header.p_vaddr,
        );
        let data = &program_elf[header.file_range()];
        board.load_physical(header.p_paddr, data)?;
        // p_memsz beyond p_filesz is zero-fill; RAM starts zeroed, so nothing to do unless a
        // previous segment overlapped, which linkers don't produce.
    }

    Ok(elf.header.e_entry)
}
