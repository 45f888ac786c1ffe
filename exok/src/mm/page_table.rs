//! Two-level page tables of user address spaces.
//!
//! The kernel owns every page table. User code only ever observes entries
//! through the read-only [`Pde`] and [`Pte`] words that
//! [`crate::syscall::KernelView`] hands out, and changes them as a side
//! effect of `page_alloc`, `page_map` and `page_unmap`.
use crate::{
    addressing::{NPDENTRIES, NPTENTRIES, Pa, Va},
    mm::Page,
};

bitflags::bitflags! {
    /// Flags for page directory and page table entries.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page.
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page referenced by this entry.
        const W = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-KByte page referenced by this entry.
        const U = 1 << 2;
        /// Page-level write-through.
        const PWT = 1 << 3;
        /// Page-level cache disable.
        const PCD = 1 << 4;
        /// Accessed; indicates whether software has accessed the 4-KByte page referenced by this entry.
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 4-KByte page referenced by this entry.
        const D = 1 << 6;
        /// Page size; must be 0 in a page table entry.
        const PS = 1 << 7;
        /// Global; if CR4.PGE = 1, determines whether the translation is global.
        const G = 1 << 8;
        /// Bits available for software use. Never interpreted by the kernel.
        const AVAIL = 0b111 << 9;
        /// Copy-on-write. A software bit inside [`PteFlags::AVAIL`].
        const COW = 1 << 11;
        /// Every flag a system call may set on a user mapping.
        const SYSCALL = Self::P.bits | Self::W.bits | Self::U.bits | Self::AVAIL.bits;
    }
}

/// Page Table Entry (PTE).
///
/// A read-only snapshot of the entry that maps one virtual page: the
/// physical address of the frame together with its [`PteFlags`]. A non
/// present page reads as `Pte(0)`.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub usize);

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(pa) = self.pa() {
            write!(f, "Pte({:08x}, {:?})", pa.into_usize(), self.flags())
        } else {
            write!(f, ".")
        }
    }
}

impl Pte {
    /// Builds the entry for a frame.
    pub fn new(pa: Pa, flags: PteFlags) -> Self {
        Self(pa.page_down().into_usize() | flags.bits())
    }

    /// Get the physical address pointed to by this entry.
    ///
    /// # Returns
    /// - `Some(Pa)` if the entry is present.
    /// - `None` if the "P" flag is not set.
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Pa::new(self.0 & !PteFlags::all().bits())
        } else {
            None
        }
    }

    /// Get the flags associated with this page table entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Returns `true` if the entry maps a page.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::P)
    }
}

/// Page Directory Entry (PDE).
///
/// Covers [`NPTENTRIES`] consecutive pages. A non present directory entry
/// means none of those pages is mapped, so a walker may skip the whole
/// range.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pde(pub usize);

impl core::fmt::Debug for Pde {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pde({:?})", self.flags())
    }
}

impl Pde {
    /// Get the flags associated with this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Returns `true` if a page table hangs off this entry.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::P)
    }
}

/// Error types for page table mapping operations.
#[derive(Debug, PartialEq, Eq)]
pub enum PageTableMappingError {
    /// Unaligned address.
    ///
    /// This error is returned when an address provided for a page table entry
    /// is not aligned to the page size.
    Unaligned,

    /// Not exist.
    ///
    /// This error is returned when a requested page table entry does not exist.
    NotExist,
}

/// A single installed translation.
#[derive(Debug)]
pub struct Mapping {
    page: Page,
    flags: PteFlags,
}

impl Mapping {
    /// The frame backing this translation.
    #[inline]
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Permission of this translation.
    #[inline]
    pub fn flags(&self) -> PteFlags {
        self.flags
    }

    /// The entry word user space observes for this translation.
    #[inline]
    pub fn pte(&self) -> Pte {
        Pte::new(self.page.pa(), self.flags)
    }
}

/// Page table indices of a virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtIndices {
    /// Virtual address that these indices are derived from.
    pub va: Va,
    /// Page directory index.
    pub pdei: usize,
    /// Page table index.
    pub ptei: usize,
}

impl PtIndices {
    /// Extracts the indices of a page aligned `va`.
    pub fn from_va(va: Va) -> Result<Self, PageTableMappingError> {
        if va.is_page_aligned() {
            Ok(Self {
                va,
                pdei: va.pdx(),
                ptei: va.ptx(),
            })
        } else {
            Err(PageTableMappingError::Unaligned)
        }
    }
}

type Leaf = Box<[Option<Mapping>]>;

/// A page table of one environment.
///
/// Every [`Mapping`] owns a [`Page`] handle, so the reference count of a
/// frame equals the number of address spaces (and slots) mapping it. Leaf
/// tables are created on demand and stay around once created.
pub struct PageTable {
    dirs: Vec<Option<Leaf>>,
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    /// Create an empty page table.
    pub fn new() -> Self {
        Self {
            dirs: (0..NPDENTRIES).map(|_| None).collect(),
        }
    }

    /// Installs `page` at `va`, returning the page previously mapped there.
    pub fn map(
        &mut self,
        va: Va,
        page: Page,
        flags: PteFlags,
    ) -> Result<Option<Page>, PageTableMappingError> {
        let PtIndices { pdei, ptei, .. } = PtIndices::from_va(va)?;
        let leaf = self.dirs[pdei].get_or_insert_with(|| (0..NPTENTRIES).map(|_| None).collect());
        Ok(leaf[ptei]
            .replace(Mapping {
                page,
                flags: flags | PteFlags::P,
            })
            .map(|old| old.page))
    }

    /// Removes the translation of `va`, returning its page.
    pub fn unmap(&mut self, va: Va) -> Result<Page, PageTableMappingError> {
        let PtIndices { pdei, ptei, .. } = PtIndices::from_va(va)?;
        self.dirs[pdei]
            .as_mut()
            .and_then(|leaf| leaf[ptei].take())
            .map(|mapping| mapping.page)
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Finds the translation covering `va`. `va` need not be aligned.
    pub fn walk(&self, va: Va) -> Result<&Mapping, PageTableMappingError> {
        self.dirs
            .get(va.pdx())
            .and_then(|leaf| leaf.as_ref())
            .and_then(|leaf| leaf[va.ptx()].as_ref())
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Entry word of the page table entry for virtual page `pn`.
    pub fn pte(&self, pn: usize) -> Pte {
        Va::from_pgnum(pn)
            .and_then(|va| self.walk(va).ok())
            .map(Mapping::pte)
            .unwrap_or(Pte(0))
    }

    /// Entry word of the page directory entry `pdx`.
    pub fn pde(&self, pdx: usize) -> Pde {
        match self.dirs.get(pdx) {
            Some(Some(_)) => Pde((PteFlags::P | PteFlags::W | PteFlags::U).bits()),
            _ => Pde(0),
        }
    }

    /// Number of installed translations.
    pub fn mapped(&self) -> usize {
        self.dirs
            .iter()
            .flatten()
            .map(|leaf| leaf.iter().filter(|m| m.is_some()).count())
            .sum()
    }
}
