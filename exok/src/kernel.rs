//! The kernel: environment table, system calls and fault delivery.
//!
//! ## Scheduling
//!
//! Each environment that becomes [`EnvStatus::Runnable`] gets its own host
//! thread, which runs the continuation the environment was created with.
//! When the continuation returns, or the environment is destroyed, the
//! thread frees the environment and records its exit code.
//!
//! Destroying an environment unwinds its thread back to the scheduler. An
//! environment destroyed by someone else while it runs is marked
//! [`EnvStatus::Dying`] and unwinds at its next kernel entry.
//!
//! ## Page faults
//!
//! An access through [`UserMemory`] that the page table does not permit is
//! a page fault. The kernel pushes a [`UTrapframe`] onto the user exception
//! stack (the page below [`UXSTACKTOP`]) and calls the environment's upcall
//! without holding the kernel lock, so the upcall may issue system calls and
//! take nested faults of its own. The faulting environment is destroyed with
//! [`EXIT_KILLED`] if:
//! - it has no upcall,
//! - its exception stack is unmapped, not writable, or full,
//! - the upcall fails,
//! - the access faults again in the same way right after the upcall.

use crate::{
    KernelConfig, KernelError,
    addressing::{PAGE_SIZE, Va},
    env::{EnvId, EnvInfo, EnvStatus},
    memlayout::{ENVGENSHIFT, UTOP, UXSTACKTOP},
    mm::{
        FrameAllocator, Page,
        page_table::{Pde, PageTable, Pte, PteFlags},
    },
    spinlock::SpinLock,
    syscall::{ChildEntry, KernelView, Syscall, UserMemory},
    task::{PFErrorCode, UTrapframe, Upcall},
};
use crossbeam_utils::Backoff;
use log::{debug, error, info, warn};
use std::{
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::JoinHandle,
};

/// Exit code of an environment destroyed by the kernel or by its parent.
pub const EXIT_KILLED: i32 = -1;

/// Exit code of an environment whose code panicked.
pub const EXIT_PANICKED: i32 = -255;

const MAX_GENERATION: u32 = (1 << (31 - ENVGENSHIFT)) - 1;

/// Unwinding payload that carries an environment's exit code back to its
/// scheduler thread.
struct EnvExit(i32);

struct Env {
    id: EnvId,
    parent_id: EnvId,
    status: EnvStatus,
    name: String,
    pgdir: PageTable,
    pgfault_upcall: Option<Upcall<EnvCtx>>,
    entry: Option<ChildEntry<EnvCtx>>,
    xstack_depth: usize,
}

#[derive(Default)]
struct EnvSlot {
    generation: u32,
    last_id: Option<EnvId>,
    env: Option<Env>,
}

impl EnvSlot {
    fn info(&self) -> EnvInfo<EnvCtx> {
        match &self.env {
            Some(env) => EnvInfo {
                id: env.id,
                parent_id: env.parent_id,
                status: env.status,
                pgfault_upcall: env.pgfault_upcall,
            },
            None => EnvInfo {
                id: self.last_id.unwrap_or(EnvId::CURRENT),
                parent_id: EnvId::CURRENT,
                status: EnvStatus::Free,
                pgfault_upcall: None,
            },
        }
    }
}

struct KernelState {
    envs: Vec<EnvSlot>,
    /// Exit codes not yet collected by [`Kernel::join`].
    exit_codes: BTreeMap<EnvId, i32>,
}

impl KernelState {
    fn get(&self, id: EnvId) -> Option<&Env> {
        self.envs
            .get(id.envx())?
            .env
            .as_ref()
            .filter(|env| env.id == id)
    }

    fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.envs
            .get_mut(id.envx())?
            .env
            .as_mut()
            .filter(|env| env.id == id)
    }

    /// Converts `envid` into the id of a live environment. With `checkperm`,
    /// the target must be the caller or the caller's immediate child.
    fn resolve(&self, caller: EnvId, envid: EnvId, checkperm: bool) -> Result<EnvId, KernelError> {
        if envid == EnvId::CURRENT {
            return Ok(caller);
        }
        let env = self.get(envid).ok_or(KernelError::NoSuchProcess)?;
        if checkperm && env.id != caller && env.parent_id != caller {
            return Err(KernelError::NoSuchProcess);
        }
        Ok(env.id)
    }

    fn alloc(
        &mut self,
        parent_id: EnvId,
        name: Option<&str>,
        entry: ChildEntry<EnvCtx>,
    ) -> Result<EnvId, KernelError> {
        let envx = self
            .envs
            .iter()
            .position(|slot| slot.env.is_none())
            .ok_or(KernelError::NoFreeEnvironment)?;
        let slot = &mut self.envs[envx];
        slot.generation = slot.generation % MAX_GENERATION + 1;
        let id = EnvId::compose(slot.generation, envx);
        slot.last_id = Some(id);
        slot.env = Some(Env {
            id,
            parent_id,
            status: EnvStatus::NotRunnable,
            name: name.map_or_else(|| format!("env{:08x}", id.into_u32()), str::to_string),
            pgdir: PageTable::new(),
            pgfault_upcall: None,
            entry: Some(entry),
            xstack_depth: 0,
        });
        Ok(id)
    }

    /// Removes the environment from its slot and records its exit code. The
    /// caller drops the returned environment, releasing its pages.
    fn free(&mut self, id: EnvId, code: i32) -> Option<Env> {
        let env = self
            .envs
            .get_mut(id.envx())?
            .env
            .take_if(|env| env.id == id)?;
        self.exit_codes.insert(id, code);
        Some(env)
    }
}

struct KernelInner {
    state: SpinLock<KernelState>,
    threads: SpinLock<BTreeMap<EnvId, JoinHandle<()>>>,
    frames: Arc<FrameAllocator>,
    config: KernelConfig,
}

/// A handle to a running kernel.
///
/// Cloning the handle does not create a new kernel. The handle also serves
/// as the host-side harness: it creates root environments, collects exit
/// codes and reports page usage.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    /// Boots a kernel with `config`.
    pub fn new(config: KernelConfig) -> Self {
        let kernel = Self {
            inner: Arc::new(KernelInner {
                state: SpinLock::new(KernelState {
                    envs: (0..config.envs()).map(|_| EnvSlot::default()).collect(),
                    exit_codes: BTreeMap::new(),
                }),
                threads: SpinLock::new(BTreeMap::new()),
                frames: FrameAllocator::new(config.pages()),
                config,
            }),
        };
        kernel.lifecycle(format_args!(
            "Kernel: {} pages, {} environments.",
            config.pages(),
            config.envs()
        ));
        kernel
    }

    /// The configuration the kernel was booted with.
    pub fn config(&self) -> KernelConfig {
        self.inner.config
    }

    fn lifecycle(&self, args: core::fmt::Arguments<'_>) {
        if !self.inner.config.is_quiet() {
            info!("{}", args);
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let mut state = self.inner.state.lock();
        let r = f(&mut state);
        state.unlock();
        r
    }

    /// Creates a runnable root environment that runs `entry`.
    ///
    /// Root environments have no parent, so no other environment may
    /// operate on them.
    pub fn spawn<F>(&self, name: &str, entry: F) -> Result<EnvId, KernelError>
    where
        F: FnOnce(EnvCtx) -> i32 + Send + 'static,
    {
        let (result, orphan) = self.with_state(|state| {
            let id = match state.alloc(EnvId::CURRENT, Some(name), Box::new(entry)) {
                Ok(id) => id,
                Err(e) => return (Err(e), None),
            };
            match self.start(state, id) {
                Ok(()) => (Ok(id), None),
                Err(e) => (Err(e), state.free(id, EXIT_KILLED)),
            }
        });
        drop(orphan);
        if let Ok(id) = result {
            self.lifecycle(format_args!("Env {}: spawned \"{}\".", id, name));
        }
        result
    }

    /// Hands the environment's continuation to a fresh thread.
    ///
    /// Called with the kernel lock held; the new thread blocks on the lock
    /// until the caller releases it.
    fn start(&self, state: &mut KernelState, id: EnvId) -> Result<(), KernelError> {
        let env = state.get_mut(id).ok_or(KernelError::NoSuchProcess)?;
        let Some(entry) = env.entry.take() else {
            return Ok(());
        };
        env.status = EnvStatus::Runnable;
        let kernel = self.clone();
        match std::thread::Builder::new()
            .name(env.name.clone())
            .spawn(move || kernel.run(id, entry))
        {
            Ok(handle) => {
                let mut threads = self.inner.threads.lock();
                threads.insert(id, handle);
                threads.unlock();
                Ok(())
            }
            Err(e) => {
                error!("Kernel: failed to start {}: {}.", id, e);
                env.status = EnvStatus::NotRunnable;
                Err(KernelError::NoMemory)
            }
        }
    }

    fn run(self, id: EnvId, entry: ChildEntry<EnvCtx>) {
        let ctx = EnvCtx {
            kernel: self.clone(),
            id,
        };
        self.with_state(|state| {
            if let Some(env) = state.get_mut(id) {
                if env.status == EnvStatus::Runnable {
                    env.status = EnvStatus::Running;
                }
            }
        });

        let code = match panic::catch_unwind(AssertUnwindSafe(move || entry(ctx))) {
            Ok(code) => code,
            Err(payload) => match payload.downcast::<EnvExit>() {
                Ok(exit) => exit.0,
                Err(_) => {
                    error!("Env {}: panicked.", id);
                    EXIT_PANICKED
                }
            },
        };

        // Pages go back to the allocator before the exit code is visible to
        // joiners.
        let exited = self.with_state(|state| {
            let code = match state.get(id) {
                Some(env) if env.status == EnvStatus::Dying => EXIT_KILLED,
                _ => code,
            };
            state.free(id, code).map(|env| {
                drop(env);
                code
            })
        });
        if let Some(code) = exited {
            self.lifecycle(format_args!("Env {}: exited with {}.", id, code));
        }
    }

    /// Waits for environment `id` to exit and returns its exit code.
    ///
    /// # Errors
    /// - [`KernelError::NoSuchProcess`]: no such environment ever existed.
    /// - [`KernelError::Busy`]: the environment was never made runnable, so
    ///   it would never exit.
    ///
    /// The exit code is handed out once. Joining the same environment again
    /// fails with [`KernelError::NoSuchProcess`].
    pub fn join(&self, id: EnvId) -> Result<i32, KernelError> {
        let backoff = Backoff::new();
        loop {
            let mut state = self.inner.state.lock();
            if let Some(code) = state.exit_codes.remove(&id) {
                let mut threads = self.inner.threads.lock();
                let handle = threads.remove(&id);
                threads.unlock();
                state.unlock();
                if let Some(handle) = handle {
                    if handle.join().is_err() {
                        error!("Kernel: scheduler thread of {} panicked.", id);
                    }
                }
                return Ok(code);
            }
            let status = state.get(id).map(|env| env.status);
            let mut threads = self.inner.threads.lock();
            let handle = threads.remove(&id);
            threads.unlock();
            state.unlock();

            match (handle, status) {
                (Some(handle), _) => {
                    if handle.join().is_err() {
                        error!("Kernel: scheduler thread of {} panicked.", id);
                    }
                }
                (None, None) => return Err(KernelError::NoSuchProcess),
                (None, Some(EnvStatus::NotRunnable)) => return Err(KernelError::Busy),
                // Another joiner owns the handle.
                (None, Some(_)) => backoff.snooze(),
            }
        }
    }

    /// Waits for every started environment, then reaps the environments
    /// that were never made runnable.
    pub fn shutdown(&self) {
        loop {
            let mut threads = self.inner.threads.lock();
            let handles = core::mem::take(&mut *threads);
            threads.unlock();
            if handles.is_empty() {
                break;
            }
            for (id, handle) in handles {
                if handle.join().is_err() {
                    error!("Kernel: scheduler thread of {} panicked.", id);
                }
            }
        }

        let reaped = self.with_state(|state| {
            let idle = state
                .envs
                .iter()
                .filter_map(|slot| slot.env.as_ref())
                .filter(|env| env.status == EnvStatus::NotRunnable)
                .map(|env| env.id)
                .collect::<Vec<_>>();
            idle.into_iter()
                .filter_map(|id| state.free(id, EXIT_KILLED))
                .collect::<Vec<_>>()
        });
        if !reaped.is_empty() {
            warn!("Kernel: reaped {} environments that never ran.", reaped.len());
        }
        self.lifecycle(format_args!("Kernel: shutdown."));
    }

    /// Number of physical pages currently allocated.
    pub fn pages_in_use(&self) -> usize {
        self.inner.frames.in_use()
    }

    /// Number of environment slots currently occupied.
    pub fn envs_in_use(&self) -> usize {
        self.with_state(|state| state.envs.iter().filter(|slot| slot.env.is_some()).count())
    }
}

/// The system call interface of one running environment.
///
/// Every environment thread receives its own `EnvCtx`. All operations act
/// on behalf of that environment.
#[derive(Clone)]
pub struct EnvCtx {
    kernel: Kernel,
    id: EnvId,
}

impl core::fmt::Debug for EnvCtx {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EnvCtx({})", self.id)
    }
}

enum Destroyed {
    Myself,
    Reaped(Option<Env>),
    Marked,
}

fn check_va(va: Va) -> Result<(), KernelError> {
    if va >= UTOP || !va.is_page_aligned() {
        Err(KernelError::InvalidArgument)
    } else {
        Ok(())
    }
}

fn check_perm(perm: PteFlags) -> Result<(), KernelError> {
    if perm.contains(PteFlags::P | PteFlags::U) && PteFlags::SYSCALL.contains(perm) {
        Ok(())
    } else {
        Err(KernelError::InvalidArgument)
    }
}

impl EnvCtx {
    /// The id of this environment, without entering the kernel.
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// The kernel this environment runs on.
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Waits for `child` to exit and returns its exit code.
    pub fn join(&self, child: EnvId) -> Result<i32, KernelError> {
        self.kernel.join(child)
    }

    /// Terminates this environment with `code`.
    pub fn exit(&self, code: i32) -> ! {
        self.die(code)
    }

    fn die(&self, code: i32) -> ! {
        panic::resume_unwind(Box::new(EnvExit(code)))
    }

    fn kill(&self, fault_va: Va, err: PFErrorCode, reason: &str) -> ! {
        warn!(
            "Env {}: unhandled page fault at {:?} ({:?}): {}.",
            self.id, fault_va, err, reason
        );
        self.die(EXIT_KILLED)
    }

    /// Runs `f` under the kernel lock. A dying environment unwinds here.
    fn enter<R>(&self, f: impl FnOnce(&mut KernelState, EnvId) -> R) -> R {
        let mut state = self.kernel.inner.state.lock();
        if !matches!(state.get(self.id), Some(env) if env.status != EnvStatus::Dying) {
            state.unlock();
            self.die(EXIT_KILLED);
        }
        let r = f(&mut state, self.id);
        state.unlock();
        r
    }

    /// Performs one access within a single page, retrying after each fault
    /// is delivered.
    fn access(&self, va: Va, write: bool, op: &mut dyn FnMut(&Page, usize)) {
        let mut last_fault = None;
        loop {
            let result = self.enter(|state, me| {
                let mut err = PFErrorCode::USER;
                if write {
                    err |= PFErrorCode::WRITE_ACCESS;
                }
                let Some(env) = state.get(me) else {
                    return Err(err);
                };
                match env.pgdir.walk(va) {
                    Ok(mapping) if !write || mapping.flags().contains(PteFlags::W) => {
                        op(mapping.page(), va.offset());
                        Ok(())
                    }
                    Ok(_) => Err(err | PFErrorCode::PRESENT),
                    Err(_) => Err(err),
                }
            });
            match result {
                Ok(()) => return,
                Err(err) if last_fault == Some(err) => {
                    self.kill(va, err, "fault persists after upcall")
                }
                Err(err) => {
                    last_fault = Some(err);
                    self.page_fault(va, err);
                }
            }
        }
    }

    fn page_fault(&self, fault_va: Va, err: PFErrorCode) {
        let utf = UTrapframe { fault_va, err };
        let pushed = self.enter(|state, me| -> Result<(Upcall<EnvCtx>, Va), &'static str> {
            let env = state.get_mut(me).ok_or("no environment")?;
            let upcall = env.pgfault_upcall.ok_or("no page fault upcall")?;
            let depth = env.xstack_depth + 1;
            if depth * UTrapframe::SIZE > PAGE_SIZE {
                return Err("user exception stack overflow");
            }
            let frame_va = UXSTACKTOP - depth * UTrapframe::SIZE;
            let mapping = env
                .pgdir
                .walk(frame_va)
                .map_err(|_| "user exception stack is not mapped")?;
            if !mapping.flags().contains(PteFlags::P | PteFlags::W | PteFlags::U) {
                return Err("user exception stack is not writable");
            }
            mapping.page().write(frame_va.offset(), &utf.encode());
            env.xstack_depth = depth;
            Ok((upcall, frame_va))
        });
        let (upcall, frame_va) = match pushed {
            Ok(pushed) => pushed,
            Err(reason) => self.kill(fault_va, err, reason),
        };
        debug!("Env {}: page fault at {:?} ({:?}).", self.id, fault_va, err);

        let mut raw = [0u8; UTrapframe::SIZE];
        let result = self
            .read(frame_va, &mut raw)
            .and_then(|_| UTrapframe::decode(&raw))
            .and_then(|utf| upcall.call(self, &utf));

        self.enter(|state, me| {
            if let Some(env) = state.get_mut(me) {
                env.xstack_depth = env.xstack_depth.saturating_sub(1);
            }
        });
        if let Err(e) = result {
            self.kill(fault_va, err, &format!("upcall failed with {}", e));
        }
    }

    fn check_range(va: Va, len: usize) -> Result<(), KernelError> {
        match va.into_usize().checked_add(len) {
            Some(end) if end <= u32::MAX as usize + 1 => Ok(()),
            _ => Err(KernelError::BadAddress),
        }
    }
}

impl Syscall for EnvCtx {
    fn getenvid(&self) -> EnvId {
        self.enter(|_, me| me)
    }

    fn exofork(&self, entry: ChildEntry<Self>) -> Result<EnvId, KernelError> {
        let child = self.enter(|state, me| state.alloc(me, None, entry))?;
        self.kernel
            .lifecycle(format_args!("Env {}: created {}.", self.id, child));
        Ok(child)
    }

    fn page_alloc(&self, envid: EnvId, va: Va, perm: PteFlags) -> Result<(), KernelError> {
        self.enter(|state, me| {
            let target = state.resolve(me, envid, true)?;
            check_va(va)?;
            check_perm(perm)?;
            let page = self.kernel.inner.frames.alloc()?;
            debug!("Env {}: page_alloc {:?} at {:?} in {}.", me, page.pa(), va, target);
            state
                .get_mut(target)
                .ok_or(KernelError::NoSuchProcess)?
                .pgdir
                .map(va, page, perm)
                .map_err(|_| KernelError::InvalidArgument)
                .map(drop)
        })
    }

    fn page_map(
        &self,
        srcenv: EnvId,
        srcva: Va,
        dstenv: EnvId,
        dstva: Va,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        self.enter(|state, me| {
            let src = state.resolve(me, srcenv, true)?;
            let dst = state.resolve(me, dstenv, true)?;
            check_va(srcva)?;
            check_va(dstva)?;
            check_perm(perm)?;
            let (page, flags) = {
                let mapping = state
                    .get(src)
                    .ok_or(KernelError::NoSuchProcess)?
                    .pgdir
                    .walk(srcva)
                    .map_err(|_| KernelError::InvalidArgument)?;
                (mapping.page().clone(), mapping.flags())
            };
            if perm.contains(PteFlags::W) && !flags.contains(PteFlags::W) {
                return Err(KernelError::InvalidArgument);
            }
            state
                .get_mut(dst)
                .ok_or(KernelError::NoSuchProcess)?
                .pgdir
                .map(dstva, page, perm)
                .map_err(|_| KernelError::InvalidArgument)
                .map(drop)
        })
    }

    fn page_unmap(&self, envid: EnvId, va: Va) -> Result<(), KernelError> {
        self.enter(|state, me| {
            let target = state.resolve(me, envid, true)?;
            check_va(va)?;
            if let Some(env) = state.get_mut(target) {
                let _ = env.pgdir.unmap(va);
            }
            Ok(())
        })
    }

    fn env_set_pgfault_upcall(
        &self,
        envid: EnvId,
        upcall: Upcall<Self>,
    ) -> Result<(), KernelError> {
        self.enter(|state, me| {
            let target = state.resolve(me, envid, true)?;
            let env = state.get_mut(target).ok_or(KernelError::NoSuchProcess)?;
            env.pgfault_upcall = Some(upcall);
            Ok(())
        })
    }

    fn env_set_status(&self, envid: EnvId, status: EnvStatus) -> Result<(), KernelError> {
        let target = self.enter(|state, me| -> Result<EnvId, KernelError> {
            let target = state.resolve(me, envid, true)?;
            let started = state
                .get(target)
                .map(|env| env.entry.is_none())
                .ok_or(KernelError::NoSuchProcess)?;
            match status {
                EnvStatus::Runnable => self.kernel.start(state, target).map(|_| target),
                // A started environment cannot be stopped.
                EnvStatus::NotRunnable if started => Err(KernelError::Busy),
                EnvStatus::NotRunnable => Ok(target),
                _ => Err(KernelError::InvalidArgument),
            }
        })?;
        if status == EnvStatus::Runnable {
            self.kernel
                .lifecycle(format_args!("Env {}: {} is runnable.", self.id, target));
        }
        Ok(())
    }

    fn env_destroy(&self, envid: EnvId) -> Result<(), KernelError> {
        let destroyed = self.enter(|state, me| -> Result<Destroyed, KernelError> {
            let target = state.resolve(me, envid, true)?;
            if target == me {
                return Ok(Destroyed::Myself);
            }
            let status = state
                .get(target)
                .map(|env| env.status)
                .ok_or(KernelError::NoSuchProcess)?;
            if status == EnvStatus::NotRunnable {
                return Ok(Destroyed::Reaped(state.free(target, EXIT_KILLED)));
            }
            if let Some(env) = state.get_mut(target) {
                env.status = EnvStatus::Dying;
            }
            Ok(Destroyed::Marked)
        })?;
        match destroyed {
            Destroyed::Myself => self.die(0),
            Destroyed::Reaped(env) => {
                self.kernel
                    .lifecycle(format_args!("Env {}: destroyed {}.", self.id, envid));
                drop(env);
            }
            Destroyed::Marked => {
                self.kernel
                    .lifecycle(format_args!("Env {}: {} is dying.", self.id, envid));
            }
        }
        Ok(())
    }

    fn yield_now(&self) {
        self.enter(|_, _| ());
        std::thread::yield_now();
    }
}

impl KernelView for EnvCtx {
    fn uvpd(&self, pdx: usize) -> Pde {
        self.enter(|state, me| state.get(me).map_or(Pde(0), |env| env.pgdir.pde(pdx)))
    }

    fn uvpt(&self, pn: usize) -> Pte {
        self.enter(|state, me| state.get(me).map_or(Pte(0), |env| env.pgdir.pte(pn)))
    }

    fn env(&self, envx: usize) -> Option<EnvInfo<Self>> {
        self.enter(|state, _| state.envs.get(envx).map(EnvSlot::info))
    }
}

impl UserMemory for EnvCtx {
    fn read(&self, va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        Self::check_range(va, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let cur = va + done;
            let len = (PAGE_SIZE - cur.offset()).min(buf.len() - done);
            let chunk = &mut buf[done..done + len];
            self.access(cur, false, &mut |page, offset| page.read(offset, chunk));
            done += len;
        }
        Ok(())
    }

    fn write(&self, va: Va, buf: &[u8]) -> Result<(), KernelError> {
        Self::check_range(va, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let cur = va + done;
            let len = (PAGE_SIZE - cur.offset()).min(buf.len() - done);
            let chunk = &buf[done..done + len];
            self.access(cur, true, &mut |page, offset| page.write(offset, chunk));
            done += len;
        }
        Ok(())
    }
}
