//! The `uaccess` module provides access to the calling environment's own
//! memory.
//!
//! Every access is checked against the caller's page table one page at a
//! time, as the MMU would. An access that the page table does not allow
//! raises a page fault, which is delivered to the registered upcall; once
//! the upcall returns, the access is retried. If the fault cannot be
//! delivered, or the upcall fails, the environment is destroyed and the
//! access never returns.
use crate::{KernelError, addressing::Va};

/// Loads and stores to user memory.
pub trait UserMemory {
    /// Reads `buf.len()` bytes starting at `va`.
    fn read(&self, va: Va, buf: &mut [u8]) -> Result<(), KernelError>;

    /// Writes `buf` starting at `va`.
    fn write(&self, va: Va, buf: &[u8]) -> Result<(), KernelError>;

    /// Copies `len` bytes from `src` to `dst`. The ranges may overlap.
    fn memmove(&self, dst: Va, src: Va, len: usize) -> Result<(), KernelError> {
        let mut buf = vec![0u8; len];
        self.read(src, &mut buf)?;
        self.write(dst, &buf)
    }

    /// Reads a little-endian `u32` at `va`.
    fn read_u32(&self, va: Va) -> Result<u32, KernelError> {
        let mut buf = [0u8; 4];
        self.read(va, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Writes `value` at `va` in little-endian order.
    fn write_u32(&self, va: Va, value: u32) -> Result<(), KernelError> {
        self.write(va, &value.to_le_bytes())
    }
}
