//! Four-level x86_64 page table: indexing a [`Va`] down to its [`Pte`] and
//! mapping/unmapping/walking it.
//!
//! Intermediate tables (PDP/PD/PT) are allocated on demand and always
//! stamped `P | RW | US`; the leaf [`Pte`]'s own flags are what actually
//! narrows access, matching the hardware's AND-down-the-levels semantics.

use alloc::boxed::Box;
use core::ops::Deref;
use keos::{
    addressing::{Pa, Va},
    mm::{Page, page_table::*},
};

/// Page table indices decomposed from a page-aligned virtual address.
pub struct PtIndices {
    pub va: Va,
    pub pml4ei: usize,
    pub pdptei: usize,
    pub pdei: usize,
    pub ptei: usize,
}

impl PtIndices {
    pub fn from_va(va: Va) -> Result<Self, PageTableMappingError> {
        let n = va.into_usize();
        if n & 0xFFF != 0 {
            return Err(PageTableMappingError::Unaligned);
        }
        Ok(Self {
            va,
            pml4ei: (n >> 39) & 0x1ff,
            pdptei: (n >> 30) & 0x1ff,
            pdei: (n >> 21) & 0x1ff,
            ptei: (n >> 12) & 0x1ff,
        })
    }
}

/// A process's user-half page table, rooted at a [`PageTableRoot`] that
/// starts out sharing every kernel-half (`pml4ei >= KBASE`) entry.
pub struct PageTable(pub Box<PageTableRoot>);

impl PageTable {
    pub fn new() -> Self {
        Self(PageTableRoot::new_boxed_with_kernel_addr())
    }

    pub fn pa(&self) -> Pa {
        keos::addressing::Kva::new(self.0.as_ref() as *const _ as usize)
            .unwrap()
            .into_pa()
    }

    pub fn map(&mut self, va: Va, pg: Page, perm: Permission) -> Result<(), PageTableMappingError> {
        let pa = pg.into_raw();
        unsafe {
            self.do_map(va, pa, perm).inspect_err(|_| {
                Page::from_pa(pa);
            })
        }
    }

    /// # Safety
    /// `pa` must be a physical address this call is allowed to take
    /// ownership of on success (typically from [`Page::into_raw`]).
    pub unsafe fn do_map(
        &mut self,
        va: Va,
        pa: Pa,
        perm: Permission,
    ) -> Result<(), PageTableMappingError> {
        if !perm.contains(Permission::READ) {
            return Err(PageTableMappingError::InvalidPermission);
        }
        let indices = PtIndices::from_va(va)?;

        let pml4e = &mut self.0[indices.pml4ei];
        if pml4e.pa().is_none() {
            pml4e.set_pa(Page::new().into_raw())?;
        }
        pml4e.set_flags(Pml4eFlags::P | Pml4eFlags::RW | Pml4eFlags::US);

        let pdpe = &mut pml4e.into_pdp_mut()?[indices.pdptei];
        if pdpe.pa().is_none() {
            pdpe.set_pa(Page::new().into_raw())?;
        }
        pdpe.set_flags(PdpeFlags::P | PdpeFlags::RW | PdpeFlags::US);

        let pde = &mut pdpe.into_pd_mut()?[indices.pdei];
        if pde.pa().is_none() {
            pde.set_pa(Page::new().into_raw())?;
        }
        pde.set_flags(PdeFlags::P | PdeFlags::RW | PdeFlags::US);

        let pte = &mut pde.into_pt_mut()?[indices.ptei];
        if pte.flags().contains(PteFlags::P) {
            return Err(PageTableMappingError::Duplicated);
        }
        pte.set_pa(pa)?;
        let mut flags = PteFlags::P;
        if perm.contains(Permission::WRITE) {
            flags |= PteFlags::RW;
        }
        if perm.contains(Permission::USER) {
            flags |= PteFlags::US;
        }
        if !perm.contains(Permission::EXECUTABLE) {
            flags |= PteFlags::XD;
        }
        unsafe {
            pte.set_flags(flags);
        }
        Ok(())
    }

    pub fn unmap(&mut self, va: Va) -> Result<Page, PageTableMappingError> {
        let mut walked = self.walk_mut(va)?;
        let stale = walked.clear().ok_or(PageTableMappingError::NotExist)?;
        Ok(stale.invalidate())
    }

    /// Clears the hardware accessed bit on an existing mapping, reinstalling
    /// the same page with the same permissions otherwise. Used by the frame
    /// table's clock sweep to give a referenced frame a second chance.
    pub fn clear_accessed(&mut self, va: Va) -> Result<(), PageTableMappingError> {
        let mut walked = self.walk_mut(va)?;
        let flags = walked.flags() & !PteFlags::A;
        if let Some(stale) = walked.clear() {
            let page = stale.invalidate();
            walked.set_page(page, flags)?;
        }
        Ok(())
    }

    pub fn walk(&self, va: Va) -> Result<&Pte, PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;
        let pdp = self.0[indices.pml4ei].into_pdp()?;
        let pd = pdp[indices.pdptei].into_pd()?;
        let pt = pd[indices.pdei].into_pt()?;
        let pte = &pt[indices.ptei];
        if pte.flags().contains(PteFlags::P) {
            Ok(pte)
        } else {
            Err(PageTableMappingError::NotExist)
        }
    }

    pub fn walk_mut(&mut self, va: Va) -> Result<Walked<'_>, PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;
        let pdp = self.0[indices.pml4ei].into_pdp_mut()?;
        let pd = pdp[indices.pdptei].into_pd_mut()?;
        let pt = pd[indices.pdei].into_pt_mut()?;
        let pte = &mut pt[indices.ptei];
        if !pte.flags().contains(PteFlags::P) {
            return Err(PageTableMappingError::NotExist);
        }
        Ok(Walked { addr: va, pte })
    }

    /// Tears down every user-half mapping (and every intermediate table),
    /// leaving only the PML4 root. Called from `Drop`.
    fn clear(&mut self) {
        for pml4ei in 0..PageTableRoot::KBASE {
            let Some(pdp_pa) = self.0[pml4ei].pa() else {
                continue;
            };
            let pdp = unsafe { core::slice::from_raw_parts_mut(pdp_pa.into_kva().into_usize() as *mut Pdpe, 512) };
            for pdpe in pdp.iter_mut() {
                let Some(pd_pa) = pdpe.pa() else { continue };
                let pd = unsafe { core::slice::from_raw_parts_mut(pd_pa.into_kva().into_usize() as *mut Pde, 512) };
                for pde in pd.iter_mut() {
                    let Some(pt_pa) = pde.pa() else { continue };
                    let pt = unsafe { core::slice::from_raw_parts_mut(pt_pa.into_kva().into_usize() as *mut Pte, 512) };
                    for pte in pt.iter_mut() {
                        if let Some(pa) = unsafe { pte.clear() } {
                            drop(unsafe { Page::from_pa(pa) });
                        }
                    }
                    if let Some(pa) = pde.clear() {
                        drop(unsafe { Page::from_pa(pa) });
                    }
                }
                if let Some(pa) = pdpe.clear() {
                    drop(unsafe { Page::from_pa(pa) });
                }
            }
            if let Some(pa) = self.0[pml4ei].clear() {
                drop(unsafe { Page::from_pa(pa) });
            }
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        assert_ne!(
            keos::intrinsics::read_cr3(),
            self.pa().into_usize(),
            "dropping the currently active page table"
        );
        self.clear()
    }
}

pub struct Walked<'a> {
    addr: Va,
    pte: &'a mut Pte,
}

impl Walked<'_> {
    pub fn clear(&mut self) -> Option<StaleTLBEntry> {
        unsafe {
            self.pte
                .clear()
                .map(|pa| StaleTLBEntry::new(self.addr, Page::from_pa(pa)))
        }
    }

    pub fn set_page(&mut self, page: Page, flags: PteFlags) -> Result<(), PageTableMappingError> {
        if self.pte.flags().contains(PteFlags::P) {
            Err(PageTableMappingError::Duplicated)
        } else {
            unsafe {
                self.pte.set_pa(page.into_raw())?.set_flags(flags);
            }
            Ok(())
        }
    }
}

impl Deref for Walked<'_> {
    type Target = Pte;
    fn deref(&self) -> &Self::Target {
        self.pte
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn map_then_walk_reports_the_requested_permission() {
        let mut pt = PageTable::new();
        let va = Va::new(0x1000).unwrap();
        let perm = Permission::READ | Permission::WRITE | Permission::USER;
        pt.map(va, Page::new(), perm).unwrap();

        let pte = pt.walk(va).unwrap();
        assert!(pte.flags().contains(PteFlags::P | PteFlags::RW | PteFlags::US));
        assert!(!pte.flags().contains(PteFlags::XD));
    }

    pub fn mapping_twice_at_the_same_address_is_rejected() {
        let mut pt = PageTable::new();
        let va = Va::new(0x2000).unwrap();
        pt.map(va, Page::new(), Permission::READ).unwrap();
        let err = pt.map(va, Page::new(), Permission::READ).unwrap_err();
        assert_eq!(err, PageTableMappingError::Duplicated);
    }

    pub fn walking_an_unmapped_address_fails() {
        let pt = PageTable::new();
        let va = Va::new(0x3000).unwrap();
        assert_eq!(pt.walk(va).unwrap_err(), PageTableMappingError::NotExist);
    }

    pub fn unmap_returns_the_page_and_clears_the_mapping() {
        let mut pt = PageTable::new();
        let va = Va::new(0x4000).unwrap();
        pt.map(va, Page::new(), Permission::READ | Permission::WRITE).unwrap();
        let _page = pt.unmap(va).unwrap();
        assert_eq!(pt.walk(va).unwrap_err(), PageTableMappingError::NotExist);
    }

    pub fn clear_accessed_preserves_the_mapping_and_its_flags() {
        let mut pt = PageTable::new();
        let va = Va::new(0x5000).unwrap();
        pt.map(va, Page::new(), Permission::READ | Permission::WRITE).unwrap();
        pt.clear_accessed(va).unwrap();
        let pte = pt.walk(va).unwrap();
        assert!(!pte.flags().contains(PteFlags::A));
        assert!(pte.flags().contains(PteFlags::RW));
    }

    pub fn non_executable_permission_sets_the_xd_bit() {
        let mut pt = PageTable::new();
        let va = Va::new(0x6000).unwrap();
        pt.map(va, Page::new(), Permission::READ).unwrap();
        assert!(pt.walk(va).unwrap().flags().contains(PteFlags::XD));
    }

    pub fn executable_permission_clears_the_xd_bit() {
        let mut pt = PageTable::new();
        let va = Va::new(0x7000).unwrap();
        pt.map(va, Page::new(), Permission::READ | Permission::EXECUTABLE).unwrap();
        assert!(!pt.walk(va).unwrap().flags().contains(PteFlags::XD));
    }
}
