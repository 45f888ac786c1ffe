//! # ufork: user-level `fork` with copy-on-write
//!
//! The exok kernel never duplicates an address space. This library builds
//! `fork` entirely in user space out of the kernel's primitives:
//!
//! - [`pgfault`]: the page fault handler. On a write to a copy-on-write
//!   page it makes a private writable copy of the page.
//! - [`duppage`]: shares one page of the caller with a child, turning
//!   writable pages copy-on-write in **both** address spaces.
//! - [`fork`]: registers the handler, creates the child, walks the user
//!   address space calling [`duppage`], gives the child its own exception
//!   stack and upcall, and finally lets it run.
//!
//! ## Copy-on-write invariant
//!
//! Whenever a physical page is shared writable or copy-on-write by more
//! than one environment, every one of those mappings carries
//! [`PteFlags::COW`] and none carries [`PteFlags::W`]. The first environment
//! to write takes a fault and moves to a private copy; the others keep the
//! original. The user exception stack is never shared: a fault on it could
//! not be handled.
//!
//! ## Example
//!
//! ```no_run
//! use exok::{EnvCtx, memlayout::UTEXT};
//! use ufork::{UserEnv, fork};
//!
//! fn user_main(env: &mut UserEnv<EnvCtx>) {
//!     env.sys_page_alloc(UTEXT).unwrap();
//!     env.write(UTEXT, &[0x00]).unwrap();
//!     let child = fork(env, |child| {
//!         child.write(UTEXT, &[0xff]).unwrap();
//!         0
//!     })
//!     .unwrap();
//!     env.wait(child);
//!     let mut byte = [0u8];
//!     env.read(UTEXT, &mut byte).unwrap();
//!     assert_eq!(byte, [0x00]);
//! }
//! ```
//!
//! [`PteFlags::COW`]: exok::mm::page_table::PteFlags::COW
//! [`PteFlags::W`]: exok::mm::page_table::PteFlags::W

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod fork;
pub mod pgfault;

pub use fork::{ForkError, duppage, fork, sfork};
pub use pgfault::{FaultError, PageFaultReason, pgfault, pgfault_upcall, set_pgfault_handler};

use crossbeam_utils::Backoff;
use exok::{
    EnvId, EnvInfo, EnvStatus, KernelError,
    addressing::Va,
    mm::page_table::PteFlags,
    syscall::{KernelView, Syscall, UserMemory},
};
use log::error;

/// Everything a user library needs from the kernel.
pub trait Environment: Syscall + KernelView + UserMemory {}

impl<S> Environment for S where S: Syscall + KernelView + UserMemory {}

/// Per-environment library state.
///
/// Holds the system call interface and `thisenv`, the slot of the calling
/// environment in the environment table.
pub struct UserEnv<S: Environment> {
    sys: S,
    thisenv: usize,
}

impl<S: Environment> UserEnv<S> {
    /// Initializes the library for the environment behind `sys`, fixing up
    /// `thisenv` from [`Syscall::getenvid`].
    pub fn new(sys: S) -> Self {
        let thisenv = sys.getenvid().envx();
        Self { sys, thisenv }
    }

    /// The system call interface.
    #[inline]
    pub fn sys(&self) -> &S {
        &self.sys
    }

    /// `envs[ENVX(sys_getenvid())]`: the descriptor of the calling
    /// environment.
    pub fn thisenv(&self) -> Option<EnvInfo<S>> {
        self.sys.env(self.thisenv)
    }

    /// Id of the calling environment.
    pub fn envid(&self) -> EnvId {
        self.thisenv()
            .map_or_else(|| self.sys.getenvid(), |info| info.id)
    }

    /// Allocates a private writable page at `va`.
    pub fn sys_page_alloc(&self, va: Va) -> Result<(), KernelError> {
        self.sys.page_alloc(
            EnvId::CURRENT,
            va,
            PteFlags::P | PteFlags::W | PteFlags::U,
        )
    }

    /// Reads `buf.len()` bytes at `va`.
    pub fn read(&self, va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        self.sys.read(va, buf)
    }

    /// Writes `buf` at `va`. Writes to copy-on-write pages fault into the
    /// registered handler.
    pub fn write(&self, va: Va, buf: &[u8]) -> Result<(), KernelError> {
        self.sys.write(va, buf)
    }

    /// Terminates the calling environment.
    ///
    /// # Panics
    /// Panics if destroying the caller fails or returns.
    pub fn exit(&self) -> ! {
        match self.sys.env_destroy(EnvId::CURRENT) {
            Ok(()) => panic!("env_destroy of {} returned", self.envid()),
            Err(e) => {
                error!("{}: exit failed with {}.", self.envid(), e);
                panic!("env_destroy of {} failed: {}", self.envid(), e)
            }
        }
    }

    /// Waits until `envid` has exited.
    ///
    /// Polls the environment table, yielding between polls, until the slot
    /// of `envid` is free or holds another environment.
    pub fn wait(&self, envid: EnvId) {
        let backoff = Backoff::new();
        loop {
            match self.sys.env(envid.envx()) {
                Some(info) if info.id == envid && info.status != EnvStatus::Free => {
                    self.sys.yield_now();
                    backoff.snooze();
                }
                _ => return,
            }
        }
    }
}

impl<S: Environment> From<S> for UserEnv<S> {
    fn from(sys: S) -> Self {
        Self::new(sys)
    }
}
