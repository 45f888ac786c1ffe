//! Environments: the unit of protection and scheduling.

use crate::{
    memlayout::{ENVGENSHIFT, NENV},
    task::Upcall,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// An environment id.
///
/// The low bits select the environment slot ([`EnvId::envx`]); the bits
/// from [`ENVGENSHIFT`] upwards carry a generation counter that changes
/// every time the slot is reused, so a stale id never resolves to a new
/// environment.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvId(u32);

impl EnvId {
    /// Refers to the calling environment in every system call.
    pub const CURRENT: EnvId = EnvId(0);

    /// Builds an id from its raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub(crate) const fn compose(generation: u32, envx: usize) -> Self {
        Self((generation << ENVGENSHIFT) | envx as u32)
    }

    /// Raw value of the id.
    pub const fn into_u32(self) -> u32 {
        self.0
    }

    /// Index of the environment slot, `ENVX(id)`.
    pub const fn envx(self) -> usize {
        self.0 as usize & (NENV - 1)
    }
}

impl core::fmt::Debug for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl core::fmt::Display for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{:08x}]", self.0)
    }
}

/// Run status of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum EnvStatus {
    /// The slot holds no environment.
    Free = 0,
    /// Destroyed while running; reaped at its next kernel entry.
    Dying = 1,
    /// Ready to run.
    Runnable = 2,
    /// Currently running.
    Running = 3,
    /// Created but not yet allowed to run.
    NotRunnable = 4,
}

/// Read-only descriptor of an environment, as exposed to user space.
pub struct EnvInfo<S> {
    /// Id of the environment. For a free slot, the id of its last occupant.
    pub id: EnvId,
    /// Id of the environment that created it.
    pub parent_id: EnvId,
    /// Run status.
    pub status: EnvStatus,
    /// Registered page fault upcall.
    pub pgfault_upcall: Option<Upcall<S>>,
}

impl<S> Clone for EnvInfo<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            parent_id: self.parent_id,
            status: self.status,
            pgfault_upcall: self.pgfault_upcall,
        }
    }
}

impl<S> core::fmt::Debug for EnvInfo<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EnvInfo")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("status", &self.status)
            .field("pgfault_upcall", &self.pgfault_upcall)
            .finish()
    }
}
