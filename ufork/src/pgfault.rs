//! # Copy-on-write page fault handler
//!
//! After [`fork`], parent and child share every writable page read-only
//! with [`PteFlags::COW`] set. The first write to such a page faults, and
//! the kernel delivers the fault to the upcall registered with
//! [`set_pgfault_handler`]. [`pgfault`] then gives the faulting environment
//! its own copy:
//!
//! 1. Allocate a fresh page at the scratch slot [`PFTEMP`].
//! 2. Copy the contents of the faulting page into it.
//! 3. Unmap the shared page from the faulting address.
//! 4. Map the copy at the faulting address, writable.
//! 5. Unmap [`PFTEMP`].
//!
//! The other sharers keep their copy-on-write mapping of the original page.
//! Any other fault is a bug in the faulting program and is fatal.
//!
//! [`fork`]: crate::fork()

use crate::Environment;
use exok::{
    EnvId, KernelError,
    addressing::{PAGE_SIZE, Va},
    memlayout::{PFTEMP, uxstack_page},
    mm::page_table::{Pte, PteFlags},
    task::{PFErrorCode, UTrapframe, Upcall},
};
use log::{debug, error};

/// Represents the reason for a page fault in a virtual memory system.
///
/// This struct is used to capture various details about a page fault, including
/// the faulting address, the type of access that caused the fault (read or
/// write), and the page table entry that covered the address at the time.
#[derive(Debug)]
pub struct PageFaultReason {
    /// The address that caused the page fault.
    pub fault_addr: Va,

    /// Indicates whether the fault was due to a write access violation.
    pub is_write_access: bool,

    /// Indicates whether the page that caused the fault is present in memory.
    ///
    /// A value of `true` means the fault is a protection violation on a
    /// mapped page. A value of `false` means the page is not mapped at all.
    pub is_present: bool,

    /// The faulting environment's entry for the faulting page.
    pub pte: Pte,
}

impl PageFaultReason {
    /// Probe the cause of page fault into a [`PageFaultReason`].
    ///
    /// Decodes the error code pushed by the kernel and looks up the current
    /// page table entry of the faulting page through `uvpd` and `uvpt`.
    pub fn new<S: Environment>(sys: &S, utf: &UTrapframe) -> Self {
        let fault_addr = utf.fault_va;
        let pte = if sys.uvpd(fault_addr.pdx()).is_present() {
            sys.uvpt(fault_addr.pgnum())
        } else {
            Pte(0)
        };
        PageFaultReason {
            fault_addr,
            is_write_access: utf.err.contains(PFErrorCode::WRITE_ACCESS),
            is_present: utf.err.contains(PFErrorCode::PRESENT),
            pte,
        }
    }

    /// Returns `true` if the fault is a **copy-on-write** violation.
    ///
    /// # Returns
    /// - `true` if this fault requires COW handling.
    /// - `false` otherwise.
    #[inline]
    pub fn is_cow_fault(&self) -> bool {
        self.is_write_access
            && self.pte.is_present()
            && self.pte.flags().contains(PteFlags::COW)
    }
}

/// Why the copy-on-write handler refused or failed to handle a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultError {
    /// The faulting access was a read.
    NotWrite {
        /// The faulting address.
        fault_addr: Va,
    },
    /// The faulting page is not a copy-on-write page.
    NotCopyOnWrite {
        /// The faulting address.
        fault_addr: Va,
        /// The entry of the faulting page.
        pte: Pte,
    },
    /// A system call failed while building the private copy.
    Kernel {
        /// The failing system call.
        op: &'static str,
        /// Its error.
        source: KernelError,
    },
}

impl core::fmt::Display for FaultError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FaultError::NotWrite { fault_addr } => {
                write!(f, "faulting access at {:?} is not a write", fault_addr)
            }
            FaultError::NotCopyOnWrite { fault_addr, pte } => write!(
                f,
                "faulting page at {:?} is not copy-on-write: {:?}",
                fault_addr, pte
            ),
            FaultError::Kernel { op, source } => write!(f, "{} failed: {}", op, source),
        }
    }
}

impl std::error::Error for FaultError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FaultError::Kernel { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<FaultError> for KernelError {
    fn from(e: FaultError) -> Self {
        match e {
            FaultError::Kernel { source, .. } => source,
            _ => KernelError::InvalidAccess,
        }
    }
}

fn kernel(op: &'static str) -> impl FnOnce(KernelError) -> FaultError {
    move |source| FaultError::Kernel { op, source }
}

/// Custom page fault handler.
///
/// If the faulting page is copy-on-write, map in a private writable copy.
///
/// # Errors
/// - [`FaultError::NotWrite`] and [`FaultError::NotCopyOnWrite`] before any
///   system call is made.
/// - [`FaultError::Kernel`] if a system call fails on the way.
pub fn pgfault<S: Environment>(sys: &S, utf: &UTrapframe) -> Result<(), FaultError> {
    let reason = PageFaultReason::new(sys, utf);
    if !reason.is_write_access {
        return Err(FaultError::NotWrite {
            fault_addr: reason.fault_addr,
        });
    }
    if !reason.is_cow_fault() {
        return Err(FaultError::NotCopyOnWrite {
            fault_addr: reason.fault_addr,
            pte: reason.pte,
        });
    }

    let addr = reason.fault_addr.page_down();
    let perm = PteFlags::P | PteFlags::W | PteFlags::U;
    sys.page_alloc(EnvId::CURRENT, PFTEMP, perm)
        .map_err(kernel("page_alloc"))?;
    sys.memmove(PFTEMP, addr, PAGE_SIZE)
        .map_err(kernel("memmove"))?;
    sys.page_unmap(EnvId::CURRENT, addr)
        .map_err(kernel("page_unmap"))?;
    sys.page_map(EnvId::CURRENT, PFTEMP, EnvId::CURRENT, addr, perm)
        .map_err(kernel("page_map"))?;
    sys.page_unmap(EnvId::CURRENT, PFTEMP)
        .map_err(kernel("page_unmap"))?;
    debug!("pgfault: private copy of {:?}.", addr);
    Ok(())
}

/// The upcall entry of [`pgfault`].
///
/// Logs the reason of a refused fault and reports it to the kernel, which
/// then destroys the faulting environment.
pub fn pgfault_upcall<S: Environment>(sys: &S, utf: &UTrapframe) -> Result<(), KernelError> {
    pgfault(sys, utf).map_err(|e| {
        error!("pgfault: {} ({:?}).", e, utf.err);
        KernelError::from(e)
    })
}

/// Set the page fault handler function.
///
/// The first time a handler is registered, the one-page user exception
/// stack below [`UXSTACKTOP`] is allocated if it is not mapped yet. The
/// handler then becomes the caller's upcall.
///
/// [`UXSTACKTOP`]: exok::memlayout::UXSTACKTOP
pub fn set_pgfault_handler<S: Environment>(sys: &S, handler: Upcall<S>) -> Result<(), KernelError> {
    let xstack = uxstack_page();
    if !sys.uvpd(xstack.pdx()).is_present() || !sys.uvpt(xstack.pgnum()).is_present() {
        sys.page_alloc(
            EnvId::CURRENT,
            xstack,
            PteFlags::P | PteFlags::W | PteFlags::U,
        )?;
    }
    sys.env_set_pgfault_upcall(EnvId::CURRENT, handler)
}
