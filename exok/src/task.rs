//! Page fault delivery to user space.
//!
//! When a user access violates its page table entry, the kernel does not
//! resolve the fault itself. It records the fault in a [`UTrapframe`],
//! pushes the frame onto the environment's exception stack and invokes the
//! environment's registered [`Upcall`]. Whatever policy the upcall
//! implements (copy-on-write, demand paging, ...) lives in user space.

use crate::{KernelError, addressing::Va};

bitflags::bitflags! {
    /// Hardware page fault error code.
    pub struct PFErrorCode: usize {
        /// The fault was caused by a protection violation on a present page.
        /// Cleared for a non-present page.
        const PRESENT = 1 << 0;
        /// The access causing the fault was a write.
        const WRITE_ACCESS = 1 << 1;
        /// The access causing the fault originated in user mode.
        const USER = 1 << 2;
    }
}

/// The frame the kernel pushes onto the user exception stack for each
/// fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UTrapframe {
    /// Faulting virtual address.
    pub fault_va: Va,
    /// Error code of the fault.
    pub err: PFErrorCode,
}

impl UTrapframe {
    /// Size of the encoded frame on the exception stack.
    pub const SIZE: usize = 16;

    /// Encodes the frame in the little-endian layout stored on the exception
    /// stack: the faulting address followed by the error code, 8 bytes
    /// each.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..8].copy_from_slice(&(self.fault_va.into_usize() as u64).to_le_bytes());
        buf[8..].copy_from_slice(&(self.err.bits() as u64).to_le_bytes());
        buf
    }

    /// Decodes a frame read back from the exception stack.
    pub fn decode(buf: &[u8; Self::SIZE]) -> Result<Self, KernelError> {
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[..8]);
        let fault_va = Va::new(u64::from_le_bytes(word) as usize).ok_or(KernelError::BadAddress)?;
        word.copy_from_slice(&buf[8..]);
        let err = PFErrorCode::from_bits(u64::from_le_bytes(word) as usize)
            .ok_or(KernelError::InvalidArgument)?;
        Ok(Self { fault_va, err })
    }
}

/// A user page fault handler entry point.
///
/// `S` is the system call interface the handler runs against; the kernel
/// calls the handler with the faulting environment's own interface. An
/// `Err` return is unrecoverable and the environment is destroyed.
pub struct Upcall<S>(pub fn(&S, &UTrapframe) -> Result<(), KernelError>);

impl<S> Upcall<S> {
    /// Entry address of the handler.
    pub fn addr(&self) -> usize {
        self.0 as usize
    }

    /// Runs the handler.
    pub fn call(&self, sys: &S, utf: &UTrapframe) -> Result<(), KernelError> {
        (self.0)(sys, utf)
    }
}

impl<S> Clone for Upcall<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Upcall<S> {}

impl<S> PartialEq for Upcall<S> {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl<S> Eq for Upcall<S> {}

impl<S> core::fmt::Debug for Upcall<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Upcall(0x{:x})", self.addr())
    }
}
