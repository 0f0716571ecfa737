//! Loads an ELF executable into a fresh address space and builds its
//! initial stack, so [`crate::process::Process`] has something to run.
//!
//! This is intentionally thin: just enough to drive `mmap`/`munmap` and the
//! page-fault path from an actual running program in tests, not a general
//! purpose `execve`.

pub mod elf;
pub mod stack_builder;

use crate::mm::MmStruct;
use elf::{Elf, PType};
use keos::{KernelError, addressing::Va, fs::RegularFile, syscall::Registers};
use stack_builder::StackBuilder;

/// Memory image and initial register state for a process about to start.
pub struct LoadContext {
    pub mm_struct: MmStruct,
    pub regs: Registers,
}

impl LoadContext {
    fn new() -> Self {
        Self {
            mm_struct: MmStruct::new(),
            regs: Registers::new(),
        }
    }

    /// Installs every `PT_LOAD` segment as a lazily-faulted file-backed
    /// mapping, then eagerly faults each page in so the `.bss` tail of the
    /// last page (the bytes beyond `p_filesz`) can be zeroed before the
    /// process ever runs.
    fn load_phdr(&mut self, elf: &Elf, file: &RegularFile) -> Result<(), KernelError> {
        for phdr in elf.phdrs()? {
            if phdr.type_ != PType::Load {
                continue;
            }
            let vaddr = phdr.p_vaddr as usize;
            let page_vaddr = vaddr & !0xFFF;
            let page_ofs = vaddr & 0xFFF;
            let filesz = phdr.p_filesz as usize;
            let memsz = phdr.p_memsz as usize;
            let file_ofs = phdr.p_offset as usize;
            let perm = phdr.permission();
            let writable = perm.contains(keos::mm::page_table::Permission::WRITE);

            let mut off_in_seg = 0usize;
            let mut addr = page_vaddr;
            let first_page_skip = page_ofs;
            while off_in_seg < memsz {
                let va = Va::new(addr).ok_or(KernelError::InvalidArgument)?;
                let skip = if addr == page_vaddr { first_page_skip } else { 0 };
                let file_bytes_here = filesz.saturating_sub(off_in_seg).min(0x1000 - skip);
                if file_bytes_here > 0 {
                    // `ofs` names the file offset that lines up with page
                    // offset 0, not with `skip` — the loaded page is a whole
                    // 4 KiB page, so its leading `skip` bytes (before the
                    // segment's own start) are still file-backed, at the
                    // page-aligned file offset ELF's `p_vaddr`/`p_offset`
                    // alignment invariant guarantees exists.
                    let page_file_ofs = (file_ofs + off_in_seg).saturating_sub(skip);
                    self.mm_struct
                        .install_file_page(va, file.clone(), page_file_ofs, skip + file_bytes_here, writable);
                    self.mm_struct.ensure_resident(va)?;
                    if skip + file_bytes_here < 0x1000 {
                        self.mm_struct.get_user_page_and(va, |mut page, _| {
                            page.inner_mut()[skip + file_bytes_here..].fill(0);
                        })?;
                    }
                } else {
                    self.mm_struct.ensure_anon_page(va, writable)?;
                }
                off_in_seg += 0x1000 - skip;
                addr += 0x1000;
            }
        }
        Ok(())
    }

    /// Lays out `argv` on the initial stack per the standard `_start`
    /// calling convention: strings, then a null-terminated pointer array,
    /// `argc` in `rdi` and `argv` in `rsi`.
    fn build_stack(&mut self, arguments: &[&str]) -> Result<(), KernelError> {
        let mut builder = StackBuilder::new(&mut self.mm_struct)?;
        let mut ptrs = alloc::vec::Vec::with_capacity(arguments.len());
        for arg in arguments.iter().rev() {
            ptrs.push(builder.push_str(arg));
        }
        ptrs.reverse();
        builder.align(8);
        builder.push_usize(0);
        for ptr in ptrs.iter().rev() {
            builder.push_usize(ptr.into_usize());
        }
        let argv = builder.sp();
        builder.push_usize(0);
        let sp = builder.finish();

        *self.regs.rsp() = sp.into_usize();
        self.regs.gprs.rdi = arguments.len();
        self.regs.gprs.rsi = argv.into_usize();
        Ok(())
    }

    /// Parses `file` as an ELF64 executable, loads its segments, and builds
    /// the initial stack for `args`.
    pub fn load(file: &RegularFile, args: &[&str]) -> Result<Self, KernelError> {
        let elf = Elf::from_file(file).ok_or(KernelError::NoExec)?;
        let mut ctx = Self::new();
        *ctx.regs.rip() = elf.header.e_entry as usize;
        ctx.load_phdr(&elf, file)?;
        ctx.build_stack(args)?;
        Ok(ctx)
    }
}
