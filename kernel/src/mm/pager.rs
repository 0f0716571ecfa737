//! The one paging policy this crate ships: lazy file-backed pages and
//! zero-filled stack pages, both backed by [`crate::mm::frame::FrameTable`]
//! and [`crate::mm::swap::SwapStore`] when evicted.
//!
//! The teaching assignment this is adapted from splits this into an
//! `EagerPager` (maps everything up front) and a `LazyPager` (demand-pages);
//! a production pager only needs the lazy behavior, so the two are
//! collapsed into one [`Pager`].

use super::{
    frame::{EvictionTarget, FRAME_TABLE},
    page_table::PageTable,
    swap::{SWAP_STORE, SwapSlot},
};
use crate::sync::Mutex;
use alloc::{boxed::Box, collections::btree_map::BTreeMap, sync::Arc, vec::Vec};
use keos::{
    KernelError,
    addressing::Va,
    fs::RegularFile,
    mm::{
        Page, PageRef,
        page_table::{PageTableRoot, Permission, PteFlags},
    },
};

/// Absolute bottom of the address space any stack is allowed to grow into.
pub const USER_KERNEL_BOUNDARY: usize = PageTableRoot::KBASE << 39;
/// Largest a single stack is allowed to grow.
pub const STACK_LIMIT: usize = 8 * 1024 * 1024;
/// A fault this far below the saved user stack pointer is still stack growth.
pub const STACK_HEURISTIC: usize = 32;

#[derive(Clone, Copy)]
enum Kind {
    File { file_ofs: usize, bytes: usize, writable: bool },
    /// Zero-filled, never file-backed: the growable stack, and the tail of a
    /// segment's `.bss` that extends past its file contents.
    Anon { writable: bool },
}

enum Residency {
    NotResident,
    Resident,
    Swapped(SwapSlot),
}

struct Descriptor {
    kind: Kind,
    file: Option<RegularFile>,
    residency: Residency,
}

impl Descriptor {
    fn writable(&self) -> bool {
        match self.kind {
            Kind::File { writable, .. } => writable,
            Kind::Anon { writable } => writable,
        }
    }
}

/// Registered with the frame table as the back-pointer for one resident
/// frame. Safe to outlive the [`Pager`] call that created it as long as the
/// owning process's [`PageTable`] is not torn down while this is still
/// registered — guaranteed by [`Pager::destroy`], which deregisters every
/// frame before dropping the page table.
struct PageOwner {
    page_table: *mut PageTable,
    va: Va,
    descriptor: Arc<Mutex<Descriptor>>,
}

unsafe impl Send for PageOwner {}

impl EvictionTarget for PageOwner {
    fn accessed(&self) -> bool {
        let pt = unsafe { &*self.page_table };
        pt.walk(self.va).map(|pte| pte.flags().contains(PteFlags::A)).unwrap_or(false)
    }

    fn dirty(&self) -> bool {
        let pt = unsafe { &*self.page_table };
        pt.walk(self.va).map(|pte| pte.flags().contains(PteFlags::D)).unwrap_or(false)
    }

    fn clear_accessed(&mut self) {
        let pt = unsafe { &mut *self.page_table };
        let _ = pt.clear_accessed(self.va);
    }

    fn evict(&mut self) -> Page {
        let pt = unsafe { &mut *self.page_table };
        let dirty = self.dirty();
        let page = pt.unmap(self.va).expect("resident page missing its hardware mapping");
        let mut desc = self.descriptor.lock();
        let is_anon = matches!(desc.kind, Kind::Anon { .. });
        let must_swap = dirty || is_anon;
        if must_swap {
            let mut guard = SWAP_STORE.lock();
            let slot = guard.swap_out(&page);
            guard.unlock();
            desc.residency = Residency::Swapped(slot);
        } else {
            desc.residency = Residency::NotResident;
        }
        desc.unlock();
        page
    }
}

/// Per-process paging policy: lazy file-backed and stack pages, plus mmap
/// bookkeeping for teardown.
pub struct Pager {
    pages: BTreeMap<Va, Arc<Mutex<Descriptor>>>,
    mmaps: BTreeMap<usize, Vec<Va>>,
    next_mmap_id: usize,
}

impl Default for Pager {
    fn default() -> Self {
        Self::new()
    }
}

fn perm_of(writable: bool) -> Permission {
    let mut p = Permission::READ | Permission::USER;
    if writable {
        p |= Permission::WRITE;
    }
    p
}

impl Pager {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
            mmaps: BTreeMap::new(),
            next_mmap_id: 0,
        }
    }

    fn register_resident(&self, page_table: &mut PageTable, va: Va, descriptor: Arc<Mutex<Descriptor>>) {
        let owner = PageOwner {
            page_table: page_table as *mut PageTable,
            va,
            descriptor,
        };
        FRAME_TABLE.lock().register(Box::new(owner));
    }

    /// Removes the frame table's resident entry for `(page_table, va)`
    /// without evicting it, used when the hardware mapping is torn down
    /// directly (as [`munmap`](Self::munmap) does) instead of through
    /// [`EvictionTarget::evict`]. Leaving the entry registered after its
    /// mapping is gone would panic the next time the clock sweep reached it.
    fn deregister_frame(page_table: &mut PageTable, va: Va) {
        let pt_ptr = page_table as *mut PageTable;
        FRAME_TABLE.lock().forget_all(|target| {
            // Safety: same cast `destroy` relies on — `PageOwner` is the only
            // `EvictionTarget` this pager ever registers.
            let owner = unsafe { &*(target as *const dyn EvictionTarget as *const PageOwner) };
            core::ptr::eq(owner.page_table, pt_ptr) && owner.va == va
        });
    }

    /// Registers a lazily-faulted-in file-backed page without mapping it yet.
    pub fn install_file_page(
        &mut self,
        addr: Va,
        file: RegularFile,
        ofs: usize,
        bytes: usize,
        writable: bool,
    ) {
        self.pages.insert(
            addr,
            Arc::new(Mutex::new(Descriptor {
                kind: Kind::File { file_ofs: ofs, bytes, writable },
                file: Some(file),
                residency: Residency::NotResident,
            })),
        );
    }

    /// Brings an already-tracked page descriptor into residency, faulting it
    /// in from its file, swap slot, or as a fresh zero-filled page. Also used
    /// outside of a real page fault, to eagerly fault in ELF segment pages at
    /// load time.
    pub fn fault_in(&mut self, page_table: &mut PageTable, page_addr: Va) -> Result<(), KernelError> {
        let Some(desc_arc) = self.pages.get(&page_addr).cloned() else {
            return Err(KernelError::BadAddress);
        };
        let mut desc = desc_arc.lock();
        let mut frame_table = FRAME_TABLE.lock();
        let page = match core::mem::replace(&mut desc.residency, Residency::Resident) {
            Residency::Resident => {
                desc.residency = Residency::Resident;
                frame_table.unlock();
                desc.unlock();
                panic!("page fault on an already-resident page");
            }
            Residency::Swapped(slot) => {
                let mut page = frame_table.allocate();
                let mut swap = SWAP_STORE.lock();
                let r = swap.swap_in(slot, &mut page);
                swap.unlock();
                r?;
                page
            }
            Residency::NotResident => {
                let mut page = frame_table.allocate();
                match desc.kind {
                    Kind::File { file_ofs, bytes, .. } => {
                        page.inner_mut().fill(0);
                        let file = desc.file.as_ref().expect("file-backed page missing its file");
                        file.read(file_ofs, &mut page.inner_mut()[..bytes])?;
                    }
                    Kind::Anon { .. } => {
                        page.inner_mut().fill(0);
                    }
                }
                page
            }
        };
        frame_table.unlock();
        let writable = desc.writable();
        page_table
            .map(page_addr, page, perm_of(writable))
            .map_err(|_| KernelError::BadAddress)?;
        self.register_resident(page_table, page_addr, desc_arc.clone());
        desc.unlock();
        Ok(())
    }

    /// Resolves a page fault at `addr`, given the thread's saved user stack
    /// pointer (for the stack-growth heuristic).
    pub fn resolve(&mut self, page_table: &mut PageTable, addr: Va, user_rsp: Va) -> Result<(), KernelError> {
        let page_addr = Va::new(addr.into_usize() & !0xFFF).ok_or(KernelError::BadAddress)?;
        if self.pages.contains_key(&page_addr) {
            return self.fault_in(page_table, page_addr);
        }
        let n = addr.into_usize();
        let rsp = user_rsp.into_usize();
        let stack_floor = USER_KERNEL_BOUNDARY - STACK_LIMIT;
        if n >= stack_floor && n < USER_KERNEL_BOUNDARY && n + STACK_HEURISTIC >= rsp {
            self.pages.insert(
                page_addr,
                Arc::new(Mutex::new(Descriptor {
                    kind: Kind::Anon { writable: true },
                    file: None,
                    residency: Residency::NotResident,
                })),
            );
            self.fault_in(page_table, page_addr)
        } else {
            Err(KernelError::BadAddress)
        }
    }

    /// Eagerly installs one zero-filled stack page at `page_addr`, bypassing
    /// the stack-growth heuristic. Used only by the process loader to set up
    /// the initial stack before the process has ever run a fault.
    pub fn ensure_stack_page(&mut self, page_table: &mut PageTable, page_addr: Va) -> Result<(), KernelError> {
        self.ensure_anon_page(page_table, page_addr, true)
    }

    /// Eagerly installs one zero-filled anonymous page at `page_addr`, used
    /// by the loader to zero-fill the `.bss` tail of a segment that extends
    /// past its file contents.
    pub fn ensure_anon_page(
        &mut self,
        page_table: &mut PageTable,
        page_addr: Va,
        writable: bool,
    ) -> Result<(), KernelError> {
        if !self.pages.contains_key(&page_addr) {
            self.pages.insert(
                page_addr,
                Arc::new(Mutex::new(Descriptor {
                    kind: Kind::Anon { writable },
                    file: None,
                    residency: Residency::NotResident,
                })),
            );
        }
        self.fault_in(page_table, page_addr)
    }

    pub fn mmap(
        &mut self,
        _page_table: &mut PageTable,
        addr: Va,
        size: usize,
        prot: Permission,
        file: Option<&RegularFile>,
        offset: usize,
    ) -> Result<usize, KernelError> {
        let n = addr.into_usize();
        if n == 0 || n & 0xFFF != 0 || n >= USER_KERNEL_BOUNDARY || size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let file = file.ok_or(KernelError::InvalidArgument)?;
        if file.size() == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let page_count = size.div_ceil(4096);
        let mut vas = Vec::with_capacity(page_count);
        for i in 0..page_count {
            let va = Va::new(n + i * 4096).ok_or(KernelError::InvalidArgument)?;
            if self.pages.contains_key(&va) {
                return Err(KernelError::InvalidArgument);
            }
            vas.push(va);
        }
        let id = self.next_mmap_id;
        self.next_mmap_id += 1;
        for (i, &va) in vas.iter().enumerate() {
            let file_ofs = offset + i * 4096;
            let bytes = (size - i * 4096).min(4096);
            self.pages.insert(
                va,
                Arc::new(Mutex::new(Descriptor {
                    kind: Kind::File { file_ofs, bytes, writable: prot.contains(Permission::WRITE) },
                    file: Some(file.clone()),
                    residency: Residency::NotResident,
                })),
            );
        }
        self.mmaps.insert(id, vas);
        Ok(id)
    }

    pub fn munmap(&mut self, page_table: &mut PageTable, id: usize) -> Result<usize, KernelError> {
        let vas = self.mmaps.remove(&id).ok_or(KernelError::InvalidArgument)?;
        let mut n = 0;
        for va in vas {
            let Some(desc_arc) = self.pages.remove(&va) else { continue };
            let mut desc = desc_arc.lock();
            let Kind::File { file_ofs, bytes, .. } = desc.kind else {
                desc.unlock();
                continue;
            };
            let file = desc.file.clone();
            let residency = core::mem::replace(&mut desc.residency, Residency::NotResident);
            desc.unlock();

            let page = match residency {
                Residency::NotResident => None,
                Residency::Swapped(slot) => {
                    let mut page = Page::new();
                    let mut swap = SWAP_STORE.lock();
                    swap.swap_in(slot, &mut page)?;
                    swap.unlock();
                    Some(page)
                }
                Residency::Resident => {
                    let dirty = page_table
                        .walk(va)
                        .map(|pte| pte.flags().contains(PteFlags::D))
                        .unwrap_or(false);
                    let page = page_table.unmap(va).map_err(|_| KernelError::InvalidArgument)?;
                    Self::deregister_frame(page_table, va);
                    if dirty {
                        Some(page)
                    } else {
                        drop(page);
                        None
                    }
                }
            };
            if let (Some(page), Some(file)) = (page, file) {
                file.write(file_ofs, &page.inner()[..bytes])?;
            }
            n += 1;
        }
        Ok(n * 4096)
    }

    pub fn get_user_page(&mut self, page_table: &mut PageTable, addr: Va) -> Option<(PageRef<'_>, Permission)> {
        let page_addr = Va::new(addr.into_usize() & !0xFFF)?;
        let pte = page_table.walk(page_addr).ok()?;
        let pa = pte.pa()?;
        let mut perm = Permission::READ | Permission::USER;
        if pte.flags().contains(PteFlags::RW) {
            perm |= Permission::WRITE;
        }
        if !pte.flags().contains(PteFlags::XD) {
            perm |= Permission::EXECUTABLE;
        }
        Some((unsafe { PageRef::from_pa(pa) }, perm))
    }

    pub fn access_ok(&self, addr: Va, is_write: bool) -> bool {
        let page_addr = match Va::new(addr.into_usize() & !0xFFF) {
            Some(v) => v,
            None => return false,
        };
        match self.pages.get(&page_addr) {
            Some(desc_arc) => {
                let desc = desc_arc.lock();
                let ok = !is_write || desc.writable();
                desc.unlock();
                ok
            }
            None => false,
        }
    }

    /// Tears down every mapping at process exit: invalidates swap slots and
    /// deregisters every resident frame before the page table is dropped.
    pub fn destroy(&mut self, page_table: &mut PageTable) {
        let pt_ptr = page_table as *mut PageTable;
        FRAME_TABLE.lock().forget_all(|target| {
            // Safety: `PageOwner` is the only `EvictionTarget` this pager
            // ever registers, and it always points back into this call's
            // page table.
            let owner = unsafe { &*(target as *const dyn EvictionTarget as *const PageOwner) };
            core::ptr::eq(owner.page_table, pt_ptr)
        });
        for desc_arc in self.pages.values() {
            let mut desc = desc_arc.lock();
            if let Residency::Swapped(slot) = core::mem::replace(&mut desc.residency, Residency::NotResident) {
                let mut swap = SWAP_STORE.lock();
                swap.invalidate(slot);
                swap.unlock();
            }
            desc.unlock();
        }
        self.pages.clear();
        self.mmaps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockFile;
    use keos::mm::page_table::{get_current_pt_pa, load_pt};

    /// Runs `f` with `pt` loaded as the active page table, so raw pointer
    /// access through a mapped user virtual address goes through the real
    /// hardware walk and sets the accessed/dirty bits the way a genuine user
    /// access would — `get_user_page_and`'s direct physical-memory slice
    /// access never touches those bits, so eviction/write-back tests need
    /// this instead.
    fn with_loaded<R>(pt: &PageTable, f: impl FnOnce() -> R) -> R {
        let prev = get_current_pt_pa();
        load_pt(pt.pa());
        let r = f();
        load_pt(prev);
        r
    }

    pub fn mmap_rejects_a_misaligned_address() {
        let mut pager = Pager::new();
        let mut pt = PageTable::new();
        let file = MockFile::zeroed(4096);
        let addr = Va::new(0x1000 + 8).unwrap();
        let err = pager
            .mmap(&mut pt, addr, 4096, Permission::READ | Permission::USER, Some(&file), 0)
            .unwrap_err();
        assert_eq!(err, KernelError::InvalidArgument);
    }

    pub fn mmap_rejects_a_zero_length_request() {
        let mut pager = Pager::new();
        let mut pt = PageTable::new();
        let file = MockFile::zeroed(4096);
        let addr = Va::new(0x1000).unwrap();
        let err = pager
            .mmap(&mut pt, addr, 0, Permission::READ | Permission::USER, Some(&file), 0)
            .unwrap_err();
        assert_eq!(err, KernelError::InvalidArgument);
    }

    pub fn mmap_rejects_an_empty_file() {
        let mut pager = Pager::new();
        let mut pt = PageTable::new();
        let file = MockFile::zeroed(0);
        let addr = Va::new(0x1000).unwrap();
        let err = pager
            .mmap(&mut pt, addr, 4096, Permission::READ | Permission::USER, Some(&file), 0)
            .unwrap_err();
        assert_eq!(err, KernelError::InvalidArgument);
    }

    pub fn mmap_rejects_overlapping_an_existing_mapping() {
        let mut pager = Pager::new();
        let mut pt = PageTable::new();
        let file = MockFile::zeroed(8192);
        let addr = Va::new(0x1000).unwrap();
        pager
            .mmap(&mut pt, addr, 8192, Permission::READ | Permission::USER, Some(&file), 0)
            .unwrap();
        let err = pager
            .mmap(&mut pt, addr, 4096, Permission::READ | Permission::USER, Some(&file), 0)
            .unwrap_err();
        assert_eq!(err, KernelError::InvalidArgument);
    }

    /// Boundary behavior: a fault just below the saved stack pointer, within
    /// the 8 MiB stack region, grows the stack; a fault further away does
    /// not.
    pub fn stack_growth_heuristic_respects_its_boundary() {
        let mut pager = Pager::new();
        let mut pt = PageTable::new();
        let rsp = Va::new(USER_KERNEL_BOUNDARY - 0x2000).unwrap();

        let just_below = Va::new(rsp.into_usize() - STACK_HEURISTIC).unwrap();
        assert!(pager.resolve(&mut pt, just_below, rsp).is_ok());
        pager.destroy(&mut pt);

        let mut pager = Pager::new();
        let mut pt = PageTable::new();
        let too_far = Va::new(rsp.into_usize() - STACK_HEURISTIC - 0x1000).unwrap();
        assert!(pager.resolve(&mut pt, too_far, rsp).is_err());
        pager.destroy(&mut pt);
    }

    pub fn stack_growth_heuristic_rejects_past_the_stack_limit() {
        let mut pager = Pager::new();
        let mut pt = PageTable::new();
        let rsp = Va::new(USER_KERNEL_BOUNDARY - STACK_LIMIT - 0x10000).unwrap();
        let addr = Va::new(rsp.into_usize() - STACK_HEURISTIC).unwrap();
        assert!(pager.resolve(&mut pt, addr, rsp).is_err());
    }

    /// Scenario: a clean file-backed page that gets evicted must reload from
    /// its file, never touching swap (a page that was never written is
    /// dropped, not swapped out).
    pub fn clean_file_page_reloads_from_file_after_eviction() {
        let mut pager = Pager::new();
        let mut pt = PageTable::new();
        let file = MockFile::new(alloc::vec![0xAB; 4096]);
        let va = Va::new(0x10000).unwrap();

        pager.install_file_page(va, file, 0, 4096, false);
        pager.fault_in(&mut pt, va).unwrap();
        assert!(pt.walk(va).unwrap().flags().contains(PteFlags::P));

        FRAME_TABLE.lock().evict_one();
        assert!(pt.walk(va).is_err(), "eviction must unmap the page");

        pager.fault_in(&mut pt, va).unwrap();
        let pte = pt.walk(va).unwrap();
        let pa = pte.pa().unwrap();
        let page = unsafe { keos::mm::PageRef::from_pa(pa) };
        assert_eq!(page.inner()[0], 0xAB);

        pager.destroy(&mut pt);
    }

    /// Scenario: a dirtied anonymous (stack) page survives an eviction round
    /// trip through swap byte-identical, and the swap slot it used is freed
    /// again once the process exits.
    pub fn dirty_anon_page_round_trips_through_swap() {
        let mut pager = Pager::new();
        let mut pt = PageTable::new();
        let va = Va::new(USER_KERNEL_BOUNDARY - 0x1000).unwrap();
        pager.ensure_anon_page(&mut pt, va, true).unwrap();

        let before = SWAP_STORE.lock();
        let free_before = before.free_count();
        before.unlock();

        let pattern: alloc::vec::Vec<u8> = (0u8..=0xFFu8).chain(core::iter::once(0x00)).collect();
        with_loaded(&pt, || unsafe {
            let base = va.into_usize() as *mut u8;
            for (i, b) in pattern.iter().enumerate() {
                core::ptr::write_volatile(base.add(i), *b);
            }
        });

        FRAME_TABLE.lock().evict_one();
        assert!(pt.walk(va).is_err());

        pager.fault_in(&mut pt, va).unwrap();
        let pte = pt.walk(va).unwrap();
        let pa = pte.pa().unwrap();
        let page = unsafe { keos::mm::PageRef::from_pa(pa) };
        assert_eq!(&page.inner()[..pattern.len()], &pattern[..]);

        pager.destroy(&mut pt);
        let after = SWAP_STORE.lock();
        assert_eq!(after.free_count(), free_before);
        after.unlock();
    }

    /// Scenario: writing through a writable mmap and unmapping writes the
    /// dirty bytes back to the file at their recorded offsets, leaving
    /// everything else untouched.
    pub fn munmap_writes_back_dirty_bytes_at_their_offsets() {
        let mut pager = Pager::new();
        let mut pt = PageTable::new();
        let file = MockFile::zeroed(4_100);
        let addr = Va::new(0x20000).unwrap();
        let id = pager
            .mmap(&mut pt, addr, 4_100, Permission::READ | Permission::WRITE | Permission::USER, Some(&file), 0)
            .unwrap();

        pager.fault_in(&mut pt, addr).unwrap();
        let second_page = Va::new(addr.into_usize() + 4096).unwrap();
        pager.fault_in(&mut pt, second_page).unwrap();

        with_loaded(&pt, || unsafe {
            let base = addr.into_usize() as *mut u8;
            core::ptr::write_volatile(base.add(10), b'X');
            core::ptr::write_volatile(base.add(4_099), b'Y');
        });

        let n = pager.munmap(&mut pt, id).unwrap();
        assert_eq!(n, 2 * 4096);

        let content = MockFile::snapshot(&file);
        assert_eq!(content.len(), 4_100);
        assert_eq!(content[10], b'X');
        assert_eq!(content[4_099], b'Y');
        assert_eq!(content[9], 0);
        assert_eq!(content[11], 0);
    }
}
