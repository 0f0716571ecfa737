//! A process's memory image: its hardware page table plus the paging policy
//! backing it.
//!
//! The assignment this is adapted from parameterizes this over a `Pager`
//! trait so graders can swap in an eager or a lazy implementation; this
//! crate ships exactly one production pager, so `MmStruct` holds it
//! directly instead of carrying an unused type parameter.

use super::{page_table::PageTable, pager::Pager};
use core::ops::Range;
use keos::{
    KernelError,
    addressing::Va,
    fs::RegularFile,
    mm::{PageRef, page_table::Permission},
};

/// A process's address space.
pub struct MmStruct {
    pub page_table: PageTable,
    pager: Pager,
}

impl Default for MmStruct {
    fn default() -> Self {
        Self::new()
    }
}

impl MmStruct {
    pub fn new() -> Self {
        Self {
            page_table: PageTable::new(),
            pager: Pager::new(),
        }
    }

    /// Whether `addr` names memory this process is allowed to touch, and
    /// (if `is_write`) allowed to modify. Does not fault anything in.
    pub fn access_ok(&self, addr: Range<Va>, is_write: bool) -> bool {
        let mut n = addr.start.into_usize() & !0xFFF;
        let end = addr.end.into_usize();
        while n < end {
            let page_addr = match Va::new(n) {
                Some(v) => v,
                None => return false,
            };
            if !self.pager.access_ok(page_addr, is_write) {
                return false;
            }
            n += 4096;
        }
        true
    }

    /// Installs an on-demand file-backed mapping at `addr`, covering `size`
    /// bytes of `file` starting at `offset`.
    pub fn do_mmap(
        &mut self,
        addr: Va,
        size: usize,
        prot: Permission,
        file: Option<&RegularFile>,
        offset: usize,
    ) -> Result<usize, KernelError> {
        self.pager.mmap(&mut self.page_table, addr, size, prot, file, offset)
    }

    /// Tears down a mapping previously installed by [`MmStruct::do_mmap`],
    /// writing back dirty pages. Returns the number of bytes unmapped.
    pub fn munmap(&mut self, id: usize) -> Result<usize, KernelError> {
        self.pager.munmap(&mut self.page_table, id)
    }

    /// Resolves a page fault at `addr`, given the thread's saved user stack
    /// pointer.
    pub fn resolve_fault(&mut self, addr: Va, user_rsp: Va) -> Result<(), KernelError> {
        self.pager.resolve(&mut self.page_table, addr, user_rsp)
    }

    /// Registers a lazily-faulted executable segment page, as installed by
    /// the ELF loader before the process ever runs.
    pub fn install_file_page(&mut self, addr: Va, file: RegularFile, ofs: usize, bytes: usize, writable: bool) {
        self.pager.install_file_page(addr, file, ofs, bytes, writable)
    }

    /// Eagerly installs one zero-filled stack page, used by the loader to
    /// set up the initial stack before the process has run.
    pub fn ensure_stack_page(&mut self, addr: Va) -> Result<(), KernelError> {
        self.pager.ensure_stack_page(&mut self.page_table, addr)
    }

    /// Eagerly installs one zero-filled anonymous page, used by the loader
    /// to zero-fill a segment's `.bss` tail.
    pub fn ensure_anon_page(&mut self, addr: Va, writable: bool) -> Result<(), KernelError> {
        self.pager.ensure_anon_page(&mut self.page_table, addr, writable)
    }

    /// Eagerly faults in an already-tracked page, used by the loader to force
    /// ELF segment pages resident at load time instead of waiting for a real
    /// page fault.
    pub fn ensure_resident(&mut self, addr: Va) -> Result<(), KernelError> {
        self.pager.fault_in(&mut self.page_table, addr)
    }

    /// Borrows the resident page backing `addr`, if any, together with its
    /// current permissions. Used by syscalls that need to read or write
    /// directly into user memory without copying through a temporary
    /// buffer.
    pub fn get_user_page_and<R>(
        &mut self,
        addr: Va,
        f: impl FnOnce(PageRef<'_>, Permission) -> R,
    ) -> Result<R, KernelError> {
        let (page, perm) = self
            .pager
            .get_user_page(&mut self.page_table, addr)
            .ok_or(KernelError::BadAddress)?;
        Ok(f(page, perm))
    }
}

impl Drop for MmStruct {
    fn drop(&mut self) {
        self.pager.destroy(&mut self.page_table);
    }
}
