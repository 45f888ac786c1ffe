//! # `fork` with copy-on-write, in user space.
//!
//! `fork` creates a new environment by duplicating the calling one. The
//! child inherits the parent's entire user address space and starts running
//! as if the call had just returned in it. The parent receives the child's
//! id, and the child runs the closure handed to [`fork`], which plays the
//! role of the `== 0` branch.
//!
//! ### Copy-On-Write
//!
//! Copying every page up front is wasteful: most of them are never written
//! again by either side. Instead the parent and the child initially share
//! all of their pages. Writable pages are mapped read-only and marked
//! [`PteFlags::COW`] in **both** address spaces, so the first write from
//! either side faults into [`pgfault`], which gives the writer a private
//! copy. Pages that were read-only to begin with are simply shared.
//!
//! The exokernel knows nothing about this. It only offers the primitives in
//! [`exok::syscall`], and `fork` works as follows:
//! 1. Registers [`pgfault`] as the page fault upcall of the parent, which
//!    also provides the parent with an exception stack.
//! 2. Creates an empty child with [`Syscall::exofork`].
//! 3. Walks every present page below [`UTOP`] through the read-only page
//!    table window and hands it to [`duppage`]. The exception stack page is
//!    skipped: a fault on it could never be handled.
//! 4. Allocates a fresh exception stack for the child.
//! 5. Copies the parent's upcall into the child.
//! 6. Marks the child runnable.
//!
//! If anything fails after the child was created, the child is destroyed
//! before the error is returned. A child is never made runnable with a
//! partial address space.
//!
//! [`pgfault`]: crate::pgfault()
//! [`UTOP`]: exok::memlayout::UTOP

use crate::{Environment, UserEnv, pgfault::pgfault_upcall, set_pgfault_handler};
use exok::{
    EnvId, EnvStatus, KernelError,
    addressing::{NPTENTRIES, Va},
    memlayout::{UTOP, uxstack_page},
    mm::page_table::PteFlags,
    task::Upcall,
};
#[cfg(doc)]
use exok::syscall::Syscall;
use log::{debug, info, warn};

/// Failures of [`fork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
    /// Registering the page fault handler of the parent failed.
    RegisterHandler(KernelError),
    /// The kernel could not create the child.
    Exofork(KernelError),
    /// Sharing page `pn` with the child failed.
    DupPage {
        /// The virtual page number.
        pn: usize,
        /// The failed system call's error.
        source: KernelError,
    },
    /// Allocating the child's exception stack failed.
    ExceptionStack(KernelError),
    /// Installing the child's upcall failed.
    SetUpcall(KernelError),
    /// The parent has no upcall to hand down.
    MissingUpcall,
    /// Marking the child runnable failed.
    SetStatus(KernelError),
    /// The operation is not implemented.
    NotSupported,
}

impl ForkError {
    /// The negative error code `fork` would return in C.
    pub fn into_isize(self) -> isize {
        KernelError::from(self).into_isize()
    }
}

impl core::fmt::Display for ForkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ForkError::RegisterHandler(e) => write!(f, "set_pgfault_handler: {}", e),
            ForkError::Exofork(e) => write!(f, "exofork: {}", e),
            ForkError::DupPage { pn, source } => {
                write!(f, "duppage of page {:#x}: {}", pn, source)
            }
            ForkError::ExceptionStack(e) => write!(f, "child exception stack: {}", e),
            ForkError::SetUpcall(e) => write!(f, "env_set_pgfault_upcall: {}", e),
            ForkError::MissingUpcall => write!(f, "parent has no page fault upcall"),
            ForkError::SetStatus(e) => write!(f, "env_set_status: {}", e),
            ForkError::NotSupported => write!(f, "not supported"),
        }
    }
}

impl std::error::Error for ForkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ForkError::RegisterHandler(e)
            | ForkError::Exofork(e)
            | ForkError::ExceptionStack(e)
            | ForkError::SetUpcall(e)
            | ForkError::SetStatus(e)
            | ForkError::DupPage { source: e, .. } => Some(e),
            ForkError::MissingUpcall | ForkError::NotSupported => None,
        }
    }
}

impl From<ForkError> for KernelError {
    fn from(e: ForkError) -> Self {
        match e {
            ForkError::RegisterHandler(e)
            | ForkError::Exofork(e)
            | ForkError::ExceptionStack(e)
            | ForkError::SetUpcall(e)
            | ForkError::SetStatus(e)
            | ForkError::DupPage { source: e, .. } => e,
            ForkError::MissingUpcall => KernelError::InvalidArgument,
            ForkError::NotSupported => KernelError::NotSupportedOperation,
        }
    }
}

/// Map our virtual page `pn` into the target `envid` at the same virtual
/// address.
///
/// If the page is writable or copy-on-write, the new mapping is created
/// copy-on-write, and then our own mapping is marked copy-on-write as well.
/// Our mapping is re-marked even when it already was copy-on-write: after a
/// fault in between, it could have become writable again. Any other page is
/// shared with its current permissions.
///
/// The child is mapped first. Marking ourselves first would leave a window
/// in which a write of ours turns the page private, and the child would then
/// receive our modified copy.
///
/// # Errors
/// - [`ForkError::DupPage`] if a mapping call fails. Mappings made so far
///   are left in place.
pub fn duppage<S: Environment>(sys: &S, envid: EnvId, pn: usize) -> Result<(), ForkError> {
    let dup = |source| ForkError::DupPage { pn, source };
    let va = Va::from_pgnum(pn).ok_or(dup(KernelError::InvalidArgument))?;
    let flags = sys.uvpt(pn).flags();

    if flags.intersects(PteFlags::W | PteFlags::COW) {
        let perm = PteFlags::P | PteFlags::U | PteFlags::COW;
        sys.page_map(EnvId::CURRENT, va, envid, va, perm)
            .map_err(dup)?;
        sys.page_map(EnvId::CURRENT, va, EnvId::CURRENT, va, perm)
            .map_err(dup)?;
        debug!("duppage: {:?} shared copy-on-write with {:?}.", va, envid);
    } else {
        sys.page_map(EnvId::CURRENT, va, envid, va, flags & PteFlags::SYSCALL)
            .map_err(dup)?;
        debug!("duppage: {:?} shared read-only with {:?}.", va, envid);
    }
    Ok(())
}

/// Creates a new environment by duplicating the caller with copy-on-write.
///
/// # Behavior
/// - The parent receives the child's id.
/// - The child runs `child` with its own [`UserEnv`], whose `thisenv`
///   refers to the child. The value returned by `child` is the child's exit
///   code.
/// - Afterwards both sides run concurrently. Writes on either side to pages
///   that were writable at the time of the fork are private to the writer.
///
/// The child is not started before its address space, exception stack and
/// upcall are in place.
///
/// # Errors
/// Every failure of an underlying system call is reported through
/// [`ForkError`]. Once the child exists, any failure destroys it before
/// returning. Pages of the parent that were already marked copy-on-write
/// stay so; the first write to them makes a harmless private copy.
pub fn fork<S, F>(env: &mut UserEnv<S>, child: F) -> Result<EnvId, ForkError>
where
    S: Environment + 'static,
    F: FnOnce(&mut UserEnv<S>) -> i32 + Send + 'static,
{
    set_pgfault_handler(env.sys(), Upcall(pgfault_upcall::<S>))
        .map_err(ForkError::RegisterHandler)?;

    let envid = env
        .sys()
        .exofork(Box::new(move |sys: S| {
            let mut env = UserEnv::new(sys);
            child(&mut env)
        }))
        .map_err(ForkError::Exofork)?;

    match populate(env, envid) {
        Ok(()) => {
            info!("fork: {:?} -> {:?}.", env.envid(), envid);
            Ok(envid)
        }
        Err(e) => {
            warn!("fork: destroying half-built child {:?}: {}.", envid, e);
            let _ = env.sys().env_destroy(envid);
            Err(e)
        }
    }
}

/// Fills the address space of the freshly created `envid` and starts it.
fn populate<S: Environment>(env: &UserEnv<S>, envid: EnvId) -> Result<(), ForkError> {
    let sys = env.sys();
    let xstack = uxstack_page().pgnum();

    for pdx in 0..UTOP.pdx() {
        if !sys.uvpd(pdx).is_present() {
            continue;
        }
        for pn in pdx * NPTENTRIES..(pdx + 1) * NPTENTRIES {
            if pn != xstack && sys.uvpt(pn).is_present() {
                duppage(sys, envid, pn)?;
            }
        }
    }

    sys.page_alloc(envid, uxstack_page(), PteFlags::P | PteFlags::W | PteFlags::U)
        .map_err(ForkError::ExceptionStack)?;

    let upcall = env
        .thisenv()
        .and_then(|info| info.pgfault_upcall)
        .ok_or(ForkError::MissingUpcall)?;
    sys.env_set_pgfault_upcall(envid, upcall)
        .map_err(ForkError::SetUpcall)?;

    sys.env_set_status(envid, EnvStatus::Runnable)
        .map_err(ForkError::SetStatus)
}

/// Shared-memory fork: everything but the stack shared writable.
///
/// Not implemented; always fails with [`ForkError::NotSupported`] without
/// touching the caller.
pub fn sfork<S, F>(_env: &mut UserEnv<S>, _child: F) -> Result<EnvId, ForkError>
where
    S: Environment + 'static,
    F: FnOnce(&mut UserEnv<S>) -> i32 + Send + 'static,
{
    Err(ForkError::NotSupported)
}
