//! System call interface.
//!
//! The kernel's surface towards user space is split into three traits:
//! - [`Syscall`]: the primitive operations that change kernel state,
//! - [`KernelView`]: the read-only windows at [`UVPT`] and [`UENVS`] through
//!   which an environment inspects its own page table and the environment
//!   table,
//! - [`UserMemory`]: loads and stores to the environment's own memory, which
//!   fault like hardware accesses do.
//!
//! [`crate::EnvCtx`] implements all three for a running environment. User
//! libraries are written against the traits so that they run unchanged on
//! any implementation.
//!
//! In every call, [`EnvId::CURRENT`] stands for the caller. A target
//! environment must be the caller itself or one of its immediate children;
//! anything else fails with [`KernelError::NoSuchProcess`].
//!
//! [`UVPT`]: crate::memlayout::UVPT
//! [`UENVS`]: crate::memlayout::UENVS

pub mod uaccess;

pub use uaccess::UserMemory;

use crate::{
    KernelError,
    addressing::Va,
    env::{EnvId, EnvInfo, EnvStatus},
    mm::page_table::{Pde, Pte, PteFlags},
    task::Upcall,
};

/// The continuation a child starts with once it is first scheduled.
///
/// It receives the child's own system call interface and returns the child's
/// exit code.
pub type ChildEntry<S> = Box<dyn FnOnce(S) -> i32 + Send + 'static>;

/// Primitive system calls.
pub trait Syscall: Sized {
    /// Returns the id of the calling environment.
    fn getenvid(&self) -> EnvId;

    /// Creates an empty child environment.
    ///
    /// The child has no mappings, no upcall and is
    /// [`EnvStatus::NotRunnable`]. `entry` runs on the child's own thread
    /// once the child is made [`EnvStatus::Runnable`].
    ///
    /// # Errors
    /// - [`KernelError::NoFreeEnvironment`]: every slot is taken.
    fn exofork(&self, entry: ChildEntry<Self>) -> Result<EnvId, KernelError>;

    /// Allocates a zeroed page and maps it at `va` in `envid` with `perm`,
    /// replacing any page already mapped there.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`]: `va` is not a page aligned user
    ///   address, or `perm` is not a valid user permission.
    /// - [`KernelError::NoMemory`]: out of physical pages.
    fn page_alloc(&self, envid: EnvId, va: Va, perm: PteFlags) -> Result<(), KernelError>;

    /// Maps the page at `srcva` in `srcenv` at `dstva` in `dstenv` with
    /// `perm`.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`]: an address or `perm` is invalid,
    ///   nothing is mapped at `srcva`, or `perm` asks for
    ///   [`PteFlags::W`] on a source that is not writable.
    fn page_map(
        &self,
        srcenv: EnvId,
        srcva: Va,
        dstenv: EnvId,
        dstva: Va,
        perm: PteFlags,
    ) -> Result<(), KernelError>;

    /// Removes the mapping at `va` in `envid`. Unmapping an unmapped address
    /// silently succeeds.
    fn page_unmap(&self, envid: EnvId, va: Va) -> Result<(), KernelError>;

    /// Registers the page fault upcall of `envid`.
    fn env_set_pgfault_upcall(&self, envid: EnvId, upcall: Upcall<Self>)
    -> Result<(), KernelError>;

    /// Sets the run status of `envid` to [`EnvStatus::Runnable`] or
    /// [`EnvStatus::NotRunnable`].
    fn env_set_status(&self, envid: EnvId, status: EnvStatus) -> Result<(), KernelError>;

    /// Destroys `envid`. Destroying the caller does not return.
    fn env_destroy(&self, envid: EnvId) -> Result<(), KernelError>;

    /// Gives up the processor.
    fn yield_now(&self);
}

/// Read-only windows onto kernel data structures.
pub trait KernelView: Sized {
    /// Page directory entry `pdx` of the caller, `uvpd[pdx]`.
    fn uvpd(&self, pdx: usize) -> Pde;

    /// Page table entry of virtual page `pn` of the caller, `uvpt[pn]`.
    fn uvpt(&self, pn: usize) -> Pte;

    /// Descriptor in environment slot `envx`, `envs[envx]`. `None` when the
    /// slot does not exist.
    fn env(&self, envx: usize) -> Option<EnvInfo<Self>>;
}
