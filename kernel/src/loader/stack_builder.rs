//! Builds the initial user stack: argv strings and pointer array, laid out
//! top-down before the process ever runs.

use crate::mm::{MmStruct, pager::USER_KERNEL_BOUNDARY};
use keos::{KernelError, addressing::Va};

/// Fixed size of the initial stack mapping. The stack pager is free to grow
/// this further on a real fault, up to [`crate::mm::pager::STACK_LIMIT`].
const INITIAL_STACK_SIZE: usize = 0x10000;

/// Top of the address space any process stack starts at — immediately below
/// the user/kernel boundary the stack-growth heuristic grows towards.
pub const STACK_TOP: usize = USER_KERNEL_BOUNDARY - 0x1000;

/// A cursor for writing argv strings and pointers onto a freshly-mapped
/// stack, growing downward from [`STACK_TOP`].
pub struct StackBuilder<'a> {
    sp: Va,
    mm_struct: &'a mut MmStruct,
}

impl<'a> StackBuilder<'a> {
    /// Eagerly faults in every page of the initial stack mapping so the
    /// builder can write into it directly, without going through a real
    /// page-fault trap.
    pub fn new(mm_struct: &'a mut MmStruct) -> Result<Self, KernelError> {
        let top = Va::new(STACK_TOP).unwrap();
        let bottom = top.into_usize() - INITIAL_STACK_SIZE;
        let mut addr = bottom;
        while addr < top.into_usize() {
            mm_struct.ensure_stack_page(Va::new(addr).unwrap())?;
            addr += 0x1000;
        }
        Ok(Self { sp: top, mm_struct })
    }

    pub fn finish(self) -> Va {
        self.sp
    }

    #[inline]
    pub fn sp(&self) -> Va {
        self.sp
    }

    /// Rounds the stack pointer down to `align`.
    #[inline]
    pub fn align(&mut self, align: usize) {
        let n = self.sp.into_usize() & !(align - 1);
        self.sp = Va::new(n).unwrap();
    }

    /// Pushes `bytes` onto the stack, crossing page boundaries one
    /// already-resident stack page at a time.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Va {
        let new_sp = self.sp.into_usize() - bytes.len();
        let mut written = 0;
        let mut cursor = new_sp;
        while written < bytes.len() {
            let page_addr = Va::new(cursor & !0xFFF).unwrap();
            let page_ofs = cursor & 0xFFF;
            let chunk = (0x1000 - page_ofs).min(bytes.len() - written);
            self.mm_struct
                .get_user_page_and(page_addr, |mut page, _| {
                    page.inner_mut()[page_ofs..page_ofs + chunk].copy_from_slice(&bytes[written..written + chunk]);
                })
                .expect("stack page must already be resident");
            written += chunk;
            cursor += chunk;
        }
        self.sp = Va::new(new_sp).unwrap();
        self.sp
    }

    pub fn push_usize(&mut self, v: usize) -> Va {
        self.push_bytes(&v.to_ne_bytes())
    }

    /// Pushes a null-terminated copy of `s`.
    pub fn push_str(&mut self, s: &str) -> Va {
        self.sp = Va::new(self.sp.into_usize() - 1).unwrap();
        self.push_bytes(s.as_bytes())
    }
}
