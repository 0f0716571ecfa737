//! System call ABI: extracting a call number and arguments from the trap
//! frame the `syscall` instruction leaves behind, and writing the result
//! back into `%rax`.
//!
//! Only [`Mmap`] and [`Munmap`] are dispatched from [`Process::syscall`] —
//! everything else a full kernel would expose (file descriptors, process
//! control) lives outside the memory-management core this crate implements.
//!
//! [`Mmap`]: SyscallNumber::Mmap
//! [`Munmap`]: SyscallNumber::Munmap
//! [`Process::syscall`]: crate::process::Process

use keos::{KernelError, syscall::Registers};

/// System call numbers this kernel understands.
#[repr(usize)]
pub enum SyscallNumber {
    /// Terminates the calling process.
    Exit = 0,
    /// Maps a file into the caller's address space.
    Mmap = 1,
    /// Unmaps a region previously created by [`SyscallNumber::Mmap`].
    Munmap = 2,
}

impl TryFrom<usize> for SyscallNumber {
    type Error = KernelError;
    fn try_from(no: usize) -> Result<SyscallNumber, Self::Error> {
        match no {
            0 => Ok(SyscallNumber::Exit),
            1 => Ok(SyscallNumber::Mmap),
            2 => Ok(SyscallNumber::Munmap),
            _ => Err(KernelError::NoSuchSyscall),
        }
    }
}

/// The arguments and register context of one system call.
pub struct SyscallAbi<'a> {
    pub sysno: usize,
    pub arg1: usize,
    pub arg2: usize,
    pub arg3: usize,
    pub arg4: usize,
    pub arg5: usize,
    pub arg6: usize,
    pub regs: &'a mut Registers,
}

impl<'a> SyscallAbi<'a> {
    /// Extracts the call number and arguments from the `syscall`-instruction
    /// calling convention: number in `rax`, arguments in `rdi`, `rsi`, `rdx`,
    /// `r10`, `r8`, `r9`.
    pub fn from_registers(regs: &'a mut Registers) -> Self {
        let gprs = regs.gprs;
        Self {
            sysno: gprs.rax,
            arg1: gprs.rdi,
            arg2: gprs.rsi,
            arg3: gprs.rdx,
            arg4: gprs.r10,
            arg5: gprs.r8,
            arg6: gprs.r9,
            regs,
        }
    }

    /// Writes the call's outcome back into `%rax`, translating an `Err` into
    /// its negative `KernelError` code the way a Unix syscall ABI does.
    pub fn set_return_value(self, return_val: Result<usize, KernelError>) {
        self.regs.gprs.rax = match return_val {
            Ok(v) => v,
            Err(e) => (-(e.into_usize() as isize)) as usize,
        };
    }
}
