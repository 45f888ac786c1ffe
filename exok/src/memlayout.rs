//! Virtual memory layout of an environment.
//!
//! ```text
//!    4 Gig -------->  +------------------------------+
//!                     |                              |
//!                     |   Kernel (never user visible)|
//!                     |                              |
//!    ULIM     ------> +------------------------------+ 0xef800000
//!                     |   Cur. Page Table (User R-)  |
//!    UVPT      ---->  +------------------------------+ 0xef400000
//!                     |          RO PAGES            |
//!    UPAGES    ---->  +------------------------------+ 0xef000000
//!                     |           RO ENVS            |
//!    UTOP,UENVS ----> +------------------------------+ 0xeec00000
//!    UXSTACKTOP -/    |     User Exception Stack     | RW/RW  PGSIZE
//!                     +------------------------------+ 0xeebff000
//!                     |       Empty Memory (*)       |
//!                     +------------------------------+ 0xeebfe000
//!    USTACKTOP  --->  +------------------------------+ 0xeebfe000
//!                     |      Normal User Stack       | RW/RW  PGSIZE
//!                     +------------------------------+ 0xeebfd000
//!                     |                              |
//!                     ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//!                     .                              .
//!                     |     Program Data & Heap      |
//!    UTEXT -------->  +------------------------------+ 0x00800000
//!    PFTEMP ------->  |       Empty Memory (*)       |
//!                     |                              |
//!    UTEMP -------->  +------------------------------+ 0x00400000
//!                     |       Empty Memory (*)       |
//!                     +------------------------------+ 0x00000000
//! ```
//!
//! Only the range below [`UTOP`] can be touched through system calls. The
//! read-only windows above it are served by [`crate::syscall::KernelView`].

use crate::addressing::{PAGE_SIZE, PTSIZE, Va, va};

/// Top of the user-accessible read-only windows.
pub const ULIM: Va = va(0xef80_0000);

/// User read-only virtual page table window.
pub const UVPT: Va = va(ULIM.into_usize() - PTSIZE);

/// Read-only copy of the physical page descriptors.
pub const UPAGES: Va = va(UVPT.into_usize() - PTSIZE);

/// Read-only copy of the environment descriptors.
pub const UENVS: Va = va(UPAGES.into_usize() - PTSIZE);

/// Top of user-mappable memory. Every system call rejects addresses at or
/// above it.
pub const UTOP: Va = UENVS;

/// Top of the one-page user exception stack.
pub const UXSTACKTOP: Va = UTOP;

/// Top of the normal user stack. One guard page sits below the exception
/// stack.
pub const USTACKTOP: Va = va(UTOP.into_usize() - 2 * PAGE_SIZE);

/// Where user programs generally begin.
pub const UTEXT: Va = va(2 * PTSIZE);

/// Scratch range for temporary page mappings.
pub const UTEMP: Va = va(PTSIZE);

/// Scratch page used by the page fault handler to build private copies.
pub const PFTEMP: Va = va(UTEMP.into_usize() + PTSIZE - PAGE_SIZE);

/// log2 of the maximum number of environments.
pub const LOG2NENV: usize = 10;

/// Maximum number of environments.
pub const NENV: usize = 1 << LOG2NENV;

/// Shift of the generation counter inside an environment id.
pub const ENVGENSHIFT: usize = 12;

/// The page backing the user exception stack.
pub const fn uxstack_page() -> Va {
    va(UXSTACKTOP.into_usize() - PAGE_SIZE)
}
