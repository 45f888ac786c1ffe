//! Physical and Virtual Memory Addressing Schemes.
//!
//! This module provides abstractions for user virtual addresses and physical
//! addresses of the exok machine. The machine has a 32-bit user address space
//! translated by a two-level page table: a page directory of
//! [`NPDENTRIES`] entries, each covering [`PTSIZE`] bytes through a page table
//! of [`NPTENTRIES`] entries.
//!
//! ```text
//! 31                   22 21                   12 11                   0
//! +----------------------+----------------------+----------------------+
//! | Page Directory Index |   Page Table Index   |  Offset within Page  |
//! +----------------------+----------------------+----------------------+
//!  \----- pdx(va) -----/ \----- ptx(va) -----/
//!  \------------ pgnum(va) ------------------/
//! ```
//!
//! Both [`Va`] and [`Pa`] support arithmetic operations (addition,
//! subtraction, bitwise operations), which allow straightforward address
//! arithmetic.
//!
//! ## Example Usage:
//!
//! ```
//! use exok::addressing::{Va, PAGE_SIZE};
//!
//! let va = Va::new(0x0080_0123).unwrap();
//! assert_eq!(va.page_down().into_usize(), 0x0080_0000);
//! assert_eq!(va.pgnum(), 0x800);
//! assert_eq!((va.page_down() + PAGE_SIZE).pgnum(), 0x801);
//! ```

/// The size of a single page in memory, in bytes.
///
/// This constant represents the size of a memory page, which is 4 KiB. It is
/// the granularity of every mapping made through the page table.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page number from a given address.
pub const PAGE_SHIFT: usize = 12; // 12 bits (log2 of 4 KB)

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// Page directory entries per page directory.
pub const NPDENTRIES: usize = 1024;

/// Page table entries per page table.
pub const NPTENTRIES: usize = 1024;

/// Bytes mapped by a single page directory entry.
pub const PTSIZE: usize = PAGE_SIZE * NPTENTRIES;

/// The shift amount to get the page directory index from a given address.
pub const PDX_SHIFT: usize = 22;

/// Represents a physical address.
///
/// The `Pa` (Physical Address) struct is a wrapper around the `usize` type,
/// which represents an address of a physical frame owned by the kernel. The
/// user never holds a physical address directly; it only observes one through
/// the page table view.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// The physical address `0`.
    ///
    /// No frame is ever allocated at this address.
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address if the address is valid.
    ///
    /// The physical address space of the machine is 32-bit wide, the same as
    /// the virtual one.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr <= u32::MAX as usize {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Returns the raw `usize` representation of the physical address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Returns the frame number of this physical address.
    #[inline]
    pub const fn frame(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Aligns the physical address down to the nearest page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Extracts the offset within the memory page from the physical address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a virtual address.
///
/// The [`Va`] (Virtual Address) struct represents an address in the 32-bit
/// virtual address space of an environment.
///
/// This abstraction provides utility methods for validation, alignment, and
/// address manipulation, ensuring safe and consistent handling of virtual
/// addresses.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is valid.
    ///
    /// # Returns
    /// - `Some(Va)`: If the address is within the 32-bit address space.
    /// - `None`: If the address is invalid.
    ///
    /// # Example
    /// ```
    /// use exok::addressing::Va;
    ///
    /// assert!(Va::new(0xeebf_f000).is_some());
    /// assert!(Va::new(0x1_0000_0000).is_none());
    /// ```
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr <= u32::MAX as usize {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Builds the address of the first byte of the page `pn`.
    #[inline]
    pub const fn from_pgnum(pn: usize) -> Option<Self> {
        Self::new(pn << PAGE_SHIFT)
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Aligns the virtual address down to the nearest page boundary.
    ///
    /// # Example
    /// ```
    /// use exok::addressing::Va;
    ///
    /// let va = Va::new(0x0080_0678).unwrap();
    /// assert_eq!(va.page_down().into_usize(), 0x0080_0000);
    /// ```
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns the virtual address up to the nearest page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the offset within the memory page from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Returns `true` if the address is the first byte of a page.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.offset() == 0
    }

    /// Virtual page number of this address.
    #[inline]
    pub const fn pgnum(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Page directory index of this address.
    #[inline]
    pub const fn pdx(self) -> usize {
        self.0 >> PDX_SHIFT
    }

    /// Page table index of this address.
    #[inline]
    pub const fn ptx(self) -> usize {
        (self.0 >> PAGE_SHIFT) & (NPTENTRIES - 1)
    }
}

/// Builds a [`Va`] in constant context.
///
/// Panics at compile time when `addr` does not fit the address space.
pub const fn va(addr: usize) -> Va {
    match Va::new(addr) {
        Some(va) => va,
        None => panic!("address out of the 32-bit address space"),
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 = self.0 - other
            }
        }
        impl core::ops::BitOr<usize> for $t {
            type Output = Self;

            fn bitor(self, other: usize) -> Self {
                Self(self.0 | other)
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
