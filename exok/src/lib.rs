//! # exok: a minimal exokernel for user-level process management
//!
//! **exok** exposes only the primitives a library operating system needs to
//! build its own process abstractions:
//! - allocate a physical page into an address space,
//! - map or unmap a page between address spaces,
//! - query the identity of the calling environment,
//! - create an empty child environment,
//! - register a page fault upcall,
//! - change the run status of an environment.
//!
//! The kernel itself never duplicates an address space. `fork`, copy-on-write
//! and friends live entirely in user space and talk to the kernel through the
//! traits in [`syscall`].
//!
//! ## Execution model
//!
//! Every environment runs on its own host thread. All kernel state sits
//! behind a single [`SpinLock`], so every system call is atomic with respect
//! to every other one. User memory is only reachable through
//! [`syscall::UserMemory`]; an access that violates the page table raises a
//! page fault which the kernel delivers to the environment's registered
//! upcall on its user exception stack, exactly like a hardware trampoline
//! would.
//!
//! ```
//! use exok::{Kernel, KernelConfig, syscall::Syscall};
//!
//! let kernel = Kernel::new(KernelConfig::new().quiet(true));
//! let id = kernel
//!     .spawn("hello", |ctx| {
//!         assert_ne!(ctx.getenvid().into_u32(), 0);
//!         7
//!     })
//!     .unwrap();
//! assert_eq!(kernel.join(id), Ok(7));
//! kernel.shutdown();
//! ```

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod addressing;
pub mod env;
pub mod kernel;
pub mod memlayout;
pub mod mm;
pub mod spinlock;
pub mod syscall;
pub mod task;

pub use env::{EnvId, EnvInfo, EnvStatus};
pub use kernel::{EnvCtx, Kernel};
pub use spinlock::{SpinLock, SpinLockGuard};

/// Enum representing errors that can occur during a kernel operation.
///
/// This enum is used to categorize errors encountered by the kernel operation.
/// Each variant corresponds to a specific type of error that might
/// occur during the handling of a kernel operation. These errors are
/// returned to the user program to indicate the nature of the failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such environment, or the caller may not touch it. (ESRCH)
    NoSuchProcess,
    /// Every environment slot is in use. (EAGAIN)
    NoFreeEnvironment,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding negative error
    /// code, the value a system call returns on failure.
    pub fn into_isize(self) -> isize {
        match self {
            KernelError::OperationNotPermitted => -1,
            KernelError::NoSuchProcess => -3,
            KernelError::NoFreeEnvironment => -11,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::InvalidArgument => -22,
            KernelError::NotSupportedOperation => -524,
        }
    }

    /// Same as [`KernelError::into_isize`], cast to `usize` the way a raw
    /// system call return register carries it.
    pub fn into_usize(self) -> usize {
        self.into_isize() as usize
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            KernelError::OperationNotPermitted => "operation not permitted",
            KernelError::NoSuchProcess => "no such environment",
            KernelError::NoFreeEnvironment => "out of environments",
            KernelError::NoMemory => "out of memory",
            KernelError::InvalidAccess => "permission denied",
            KernelError::BadAddress => "bad address",
            KernelError::Busy => "resource busy",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::NotSupportedOperation => "operation not supported",
        };
        write!(f, "{} ({})", msg, self.into_isize())
    }
}

impl std::error::Error for KernelError {}

/// The given `isize` does not indicate an [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFromError {
    /// The value that failed to convert.
    pub fn value(&self) -> isize {
        self.e
    }
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::OperationNotPermitted),
            -3 => Ok(Self::NoSuchProcess),
            -11 => Ok(Self::NoFreeEnvironment),
            -12 => Ok(Self::NoMemory),
            -13 => Ok(Self::InvalidAccess),
            -14 => Ok(Self::BadAddress),
            -16 => Ok(Self::Busy),
            -22 => Ok(Self::InvalidArgument),
            -524 => Ok(Self::NotSupportedOperation),
            e => Err(TryFromError { e }),
        }
    }
}

/// A builder for kernel configuration settings.
///
/// The [`KernelConfig`] struct configures a [`Kernel`] before it boots: how
/// many physical pages the frame allocator hands out, how many environment
/// slots exist, and whether lifecycle events are logged.
///
/// ```
/// use exok::KernelConfig;
///
/// let config = KernelConfig::new().max_pages(64).max_envs(8).quiet(true);
/// assert_eq!(config.pages(), 64);
/// assert_eq!(config.envs(), 8);
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KernelConfig {
    max_pages: usize,
    max_envs: usize,
    quiet: bool,
}

impl KernelConfig {
    /// Default number of physical frames.
    pub const DEFAULT_MAX_PAGES: usize = 4096;

    /// Creates the default configuration.
    pub const fn new() -> Self {
        Self {
            max_pages: Self::DEFAULT_MAX_PAGES,
            max_envs: memlayout::NENV,
            quiet: false,
        }
    }

    /// Limits the number of physical pages that can be allocated at once.
    pub const fn max_pages(mut self, pages: usize) -> Self {
        self.max_pages = pages;
        self
    }

    /// Limits the number of environment slots. Clamped to
    /// [`memlayout::NENV`].
    pub const fn max_envs(mut self, envs: usize) -> Self {
        self.max_envs = if envs > memlayout::NENV {
            memlayout::NENV
        } else {
            envs
        };
        self
    }

    /// Silences the kernel's lifecycle messages.
    pub const fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Configured frame limit.
    pub const fn pages(&self) -> usize {
        self.max_pages
    }

    /// Configured environment slot count.
    pub const fn envs(&self) -> usize {
        self.max_envs
    }

    /// Whether lifecycle messages are silenced.
    pub const fn is_quiet(&self) -> bool {
        self.quiet
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
