//! Minimal ELF64 program-header parsing: just enough to drive
//! [`super::LoadContext::load_phdr`].

use alloc::vec::Vec;
use core::convert::TryInto;
use keos::{KernelError, fs::RegularFile, mm::page_table::Permission};

#[derive(Copy, Clone)]
#[repr(C)]
pub struct ElfHeader {
    pub magic: [u8; 4],
    pub class: u8,
    pub data: u8,
    pub version: u8,
    pub abi: u8,
    pub abi_version: u8,
    pub pad: [u8; 7],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// A parsed ELF64 executable, backed by the file it was read from.
pub struct Elf<'a> {
    pub header: ElfHeader,
    pub file: &'a RegularFile,
}

impl<'a> Elf<'a> {
    /// Validates the magic, word size, endianness, and machine, and parses
    /// the header. Everything this kernel loads is a static x86_64 ET_EXEC.
    pub fn from_file(file: &'a RegularFile) -> Option<Self> {
        union HeaderUnion {
            raw: [u8; 4096],
            header: ElfHeader,
        }
        let header = unsafe {
            let mut u = HeaderUnion { raw: [0; 4096] };
            file.read(0, &mut u.raw).ok()?;
            u.header
        };
        let ok = header.magic == *b"\x7FELF"
            && header.data == 1
            && header.class == 2
            && header.e_machine == 0x3E
            && header.e_type == 2;
        ok.then_some(Self { header, file })
    }

    pub fn phdrs(&self) -> Result<PhdrIterator, KernelError> {
        let base: usize = self.header.e_phoff.try_into().map_err(|_| KernelError::InvalidArgument)?;
        let count = self.header.e_phnum as usize;
        let mut buffer = alloc::vec![0u8; count * core::mem::size_of::<Phdr>()];
        self.file.read(base, &mut buffer)?;
        Ok(PhdrIterator { cursor: 0, buffer })
    }
}

pub struct PhdrIterator {
    cursor: usize,
    buffer: Vec<u8>,
}

impl Iterator for PhdrIterator {
    type Item = Phdr;
    fn next(&mut self) -> Option<Self::Item> {
        let sz = core::mem::size_of::<Phdr>();
        let ofs = self.cursor * sz;
        if ofs + sz > self.buffer.len() {
            return None;
        }
        self.cursor += 1;
        let mut raw = [0u8; 0x38];
        raw.copy_from_slice(&self.buffer[ofs..ofs + sz]);
        Some(unsafe { core::mem::transmute::<[u8; 0x38], Phdr>(raw) })
    }
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PType {
    Null = 0x0,
    Load = 0x1,
    Dynamic = 0x2,
    Interp = 0x3,
    Note = 0x4,
    Shlib = 0x5,
    Phdr = 0x6,
    Tls = 0x7,
}

bitflags::bitflags! {
    pub struct PFlags: u32 {
        const EXECUTABLE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Phdr {
    pub type_: PType,
    pub p_flags: PFlags,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Phdr {
    /// Translates this segment's ELF permission flags into the page-table
    /// permissions the loader should map it with. Every loaded segment is
    /// user-accessible and at least readable.
    pub fn permission(&self) -> Permission {
        let mut perm = Permission::READ | Permission::USER;
        if self.p_flags.contains(PFlags::WRITE) {
            perm |= Permission::WRITE;
        }
        if self.p_flags.contains(PFlags::EXECUTABLE) {
            perm |= Permission::EXECUTABLE;
        }
        perm
    }
}
