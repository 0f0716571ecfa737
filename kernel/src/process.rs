//! Ties one address space to the [`Task`] hooks the kernel drives it
//! through: system calls, page faults, and access checks.

use crate::{
    mm::MmStruct,
    syscall::{SyscallAbi, SyscallNumber},
};
use core::ops::Range;
use keos::{
    KernelError,
    addressing::{Pa, Va},
    fs::FileSystem,
    mm::page_table::Permission,
    syscall::{Registers, uaccess::UserCString},
    task::{PFErrorCode, Task},
    thread::{kill_current_thread, with_current},
};

/// Prints the line a real shell expects to see before a process dies with a
/// nonzero status, then terminates the current thread with exit code -1.
fn exit_with_failure() -> ! {
    let name = with_current(|th| th.name.clone());
    keos::println!("{}: exit(-1)", name);
    kill_current_thread();
}

/// A running user program: its address space plus the stack pointer last
/// seen at a syscall boundary.
///
/// `keos::task::Task::page_fault` is not handed the trap frame, only the
/// faulting address and error code, so there is no direct way to read the
/// saved user stack pointer at fault time. `last_user_rsp` is the pragmatic
/// stand-in: it is refreshed on every syscall entry, which for a
/// single-threaded process is current as of the last time the process was
/// definitely executing with a valid stack pointer, and is exactly what the
/// stack-growth heuristic needs a recent value of, not an exact one.
pub struct Process {
    pub mm_struct: MmStruct,
    last_user_rsp: Va,
}

impl Process {
    pub fn new(mm_struct: MmStruct, entry_rsp: Va) -> Self {
        Self {
            mm_struct,
            last_user_rsp: entry_rsp,
        }
    }
}

impl Default for Process {
    /// A process with an empty address space, used where `keos::TestDriver`
    /// needs a placeholder `Task` to attach before a test installs its own
    /// mappings.
    fn default() -> Self {
        Self::new(MmStruct::new(), Va::new(0).unwrap())
    }
}

impl Task for Process {
    fn syscall(&mut self, regs: &mut Registers) {
        self.last_user_rsp = Va::new(*regs.rsp()).unwrap_or(self.last_user_rsp);
        let abi = SyscallAbi::from_registers(regs);
        let return_val = SyscallNumber::try_from(abi.sysno).and_then(|no| match no {
            SyscallNumber::Exit => {
                exit_with_failure();
            }
            SyscallNumber::Mmap => {
                // There is no open-file-descriptor table in this kernel (out
                // of scope), so `mmap` takes a path directly and opens it for
                // just the duration of the call, instead of an fd.
                let addr = Va::new(abi.arg1).ok_or(KernelError::InvalidArgument)?;
                let size = abi.arg2;
                let writable = abi.arg3 != 0;
                let offset = abi.arg4;
                let path = UserCString::new(abi.arg5).read()?;
                let file = FileSystem::root()
                    .open(&path)?
                    .into_regular_file()
                    .ok_or(KernelError::IsDirectory)?;
                let mut perm = Permission::READ | Permission::USER;
                if writable {
                    perm |= Permission::WRITE;
                }
                self.mm_struct.do_mmap(addr, size, perm, Some(&file), offset)
            }
            SyscallNumber::Munmap => {
                let id = abi.arg1;
                self.mm_struct.munmap(id)
            }
        });
        abi.set_return_value(return_val);
    }

    fn page_fault(&mut self, ec: PFErrorCode, cr2: Va) {
        let is_user = (ec & PFErrorCode::USER) == PFErrorCode::USER;
        if !is_user {
            panic!("unexpected page fault in kernel at {:?} because of {:?}", cr2, ec);
        }
        if self.mm_struct.resolve_fault(cr2, self.last_user_rsp).is_err() {
            exit_with_failure();
        }
    }

    fn access_ok(&self, addr: Range<Va>, is_write: bool) -> bool {
        self.mm_struct.access_ok(addr, is_write)
    }

    fn with_page_table_pa(&self, f: &fn(Pa)) {
        f(self.mm_struct.page_table.pa())
    }
}
