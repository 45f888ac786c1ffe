//! A kernel that records the calls it receives instead of carrying them out.

use exok::{
    EnvId, EnvInfo, EnvStatus, KernelError,
    addressing::{NPTENTRIES, PAGE_SIZE, Pa, Va},
    memlayout::{PFTEMP, UTEXT, uxstack_page},
    mm::page_table::{Pde, Pte, PteFlags},
    syscall::{ChildEntry, KernelView, Syscall, UserMemory},
    task::{PFErrorCode, UTrapframe, Upcall},
};
use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
};
use ufork::{FaultError, ForkError, UserEnv, duppage, fork, pgfault, pgfault_upcall};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Exofork,
    PageAlloc(EnvId, Va, PteFlags),
    PageMap(EnvId, Va, EnvId, Va, PteFlags),
    PageUnmap(EnvId, Va),
    SetUpcall(EnvId),
    SetStatus(EnvId, EnvStatus),
    Destroy(EnvId),
    Memmove(Va, Va, usize),
}

struct MockSys {
    id: EnvId,
    child: EnvId,
    ptes: BTreeMap<usize, Pte>,
    upcall: Cell<Option<Upcall<MockSys>>>,
    calls: RefCell<Vec<Call>>,
    fail: Option<(fn(&Call) -> bool, KernelError)>,
    forget_upcall: bool,
}

impl MockSys {
    fn new() -> Self {
        Self {
            id: EnvId::new(0x1001),
            child: EnvId::new(0x1002),
            ptes: BTreeMap::new(),
            upcall: Cell::new(None),
            calls: RefCell::new(Vec::new()),
            fail: None,
            forget_upcall: false,
        }
    }

    fn with_page(mut self, va: Va, frame: usize, flags: PteFlags) -> Self {
        let pa = Pa::new(frame * PAGE_SIZE).unwrap();
        self.ptes.insert(va.pgnum(), Pte::new(pa, flags));
        self
    }

    fn failing(mut self, on: fn(&Call) -> bool, err: KernelError) -> Self {
        self.fail = Some((on, err));
        self
    }

    fn record(&self, call: Call) -> Result<(), KernelError> {
        let result = match self.fail {
            Some((on, err)) if on(&call) => Err(err),
            _ => Ok(()),
        };
        self.calls.borrow_mut().push(call);
        result
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }
}

impl Syscall for MockSys {
    fn getenvid(&self) -> EnvId {
        self.id
    }

    fn exofork(&self, _entry: ChildEntry<Self>) -> Result<EnvId, KernelError> {
        self.record(Call::Exofork).map(|_| self.child)
    }

    fn page_alloc(&self, envid: EnvId, va: Va, perm: PteFlags) -> Result<(), KernelError> {
        self.record(Call::PageAlloc(envid, va, perm))
    }

    fn page_map(
        &self,
        srcenv: EnvId,
        srcva: Va,
        dstenv: EnvId,
        dstva: Va,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        self.record(Call::PageMap(srcenv, srcva, dstenv, dstva, perm))
    }

    fn page_unmap(&self, envid: EnvId, va: Va) -> Result<(), KernelError> {
        self.record(Call::PageUnmap(envid, va))
    }

    fn env_set_pgfault_upcall(
        &self,
        envid: EnvId,
        upcall: Upcall<Self>,
    ) -> Result<(), KernelError> {
        self.record(Call::SetUpcall(envid))?;
        if envid == EnvId::CURRENT && !self.forget_upcall {
            self.upcall.set(Some(upcall));
        }
        Ok(())
    }

    fn env_set_status(&self, envid: EnvId, status: EnvStatus) -> Result<(), KernelError> {
        self.record(Call::SetStatus(envid, status))
    }

    fn env_destroy(&self, envid: EnvId) -> Result<(), KernelError> {
        self.record(Call::Destroy(envid))
    }

    fn yield_now(&self) {}
}

impl KernelView for MockSys {
    fn uvpd(&self, pdx: usize) -> Pde {
        let range = pdx * NPTENTRIES..(pdx + 1) * NPTENTRIES;
        if self.ptes.range(range).next().is_some() {
            Pde((PteFlags::P | PteFlags::W | PteFlags::U).bits())
        } else {
            Pde(0)
        }
    }

    fn uvpt(&self, pn: usize) -> Pte {
        self.ptes.get(&pn).copied().unwrap_or(Pte(0))
    }

    fn env(&self, envx: usize) -> Option<EnvInfo<Self>> {
        (envx == self.id.envx()).then(|| EnvInfo {
            id: self.id,
            parent_id: EnvId::CURRENT,
            status: EnvStatus::Running,
            pgfault_upcall: self.upcall.get(),
        })
    }
}

impl UserMemory for MockSys {
    fn read(&self, _va: Va, _buf: &mut [u8]) -> Result<(), KernelError> {
        Ok(())
    }

    fn write(&self, _va: Va, _buf: &[u8]) -> Result<(), KernelError> {
        Ok(())
    }

    fn memmove(&self, dst: Va, src: Va, len: usize) -> Result<(), KernelError> {
        self.record(Call::Memmove(dst, src, len))
    }
}

const ME: EnvId = EnvId::CURRENT;
const RO: PteFlags = PteFlags::from_bits_truncate(0b101);
const RW: PteFlags = PteFlags::from_bits_truncate(0b111);
const COW: PteFlags = PteFlags::from_bits_truncate(0b1000_0000_0101);

#[test]
fn duppage_writable() {
    let sys = MockSys::new().with_page(UTEXT, 1, RW);
    duppage(&sys, sys.child, UTEXT.pgnum()).unwrap();
    assert_eq!(
        sys.calls(),
        [
            Call::PageMap(ME, UTEXT, sys.child, UTEXT, COW),
            Call::PageMap(ME, UTEXT, ME, UTEXT, COW),
        ]
    );
}

#[test]
fn duppage_already_cow() {
    let sys = MockSys::new().with_page(UTEXT, 1, COW);
    duppage(&sys, sys.child, UTEXT.pgnum()).unwrap();
    assert_eq!(
        sys.calls(),
        [
            Call::PageMap(ME, UTEXT, sys.child, UTEXT, COW),
            Call::PageMap(ME, UTEXT, ME, UTEXT, COW),
        ]
    );
}

#[test]
fn duppage_read_only() {
    // Hardware bits are dropped, software bits survive.
    let flags = RO | PteFlags::A | PteFlags::D | PteFlags::from_bits_truncate(1 << 9);
    let sys = MockSys::new().with_page(UTEXT, 1, flags);
    duppage(&sys, sys.child, UTEXT.pgnum()).unwrap();
    assert_eq!(
        sys.calls(),
        [Call::PageMap(
            ME,
            UTEXT,
            sys.child,
            UTEXT,
            RO | PteFlags::from_bits_truncate(1 << 9)
        )]
    );
}

#[test]
fn duppage_failure() {
    let sys = MockSys::new()
        .with_page(UTEXT, 1, RW)
        .failing(|call| matches!(call, Call::PageMap(_, _, ME, _, _)), KernelError::NoMemory);
    assert_eq!(
        duppage(&sys, sys.child, UTEXT.pgnum()),
        Err(ForkError::DupPage {
            pn: UTEXT.pgnum(),
            source: KernelError::NoMemory
        })
    );
    // The child's mapping is already in place.
    assert_eq!(sys.calls().len(), 2);
}

#[test]
fn fork_sequence() {
    let sys = MockSys::new()
        .with_page(UTEXT, 1, RW)
        .with_page(UTEXT + PAGE_SIZE, 2, RO)
        .with_page(uxstack_page(), 3, RW);
    let mut env = UserEnv::new(sys);
    let child = fork(&mut env, |_| 0).unwrap();
    let sys = env.sys();
    assert_eq!(child, sys.child);
    assert_eq!(
        sys.calls(),
        [
            Call::SetUpcall(ME),
            Call::Exofork,
            Call::PageMap(ME, UTEXT, child, UTEXT, COW),
            Call::PageMap(ME, UTEXT, ME, UTEXT, COW),
            Call::PageMap(ME, UTEXT + PAGE_SIZE, child, UTEXT + PAGE_SIZE, RO),
            Call::PageAlloc(child, uxstack_page(), RW),
            Call::SetUpcall(child),
            Call::SetStatus(child, EnvStatus::Runnable),
        ]
    );
}

#[test]
fn fork_allocates_missing_exception_stack() {
    let mut env = UserEnv::new(MockSys::new());
    let child = fork(&mut env, |_| 0).unwrap();
    let calls = env.sys().calls();
    assert_eq!(calls[0], Call::PageAlloc(ME, uxstack_page(), RW));
    assert_eq!(calls[1], Call::SetUpcall(ME));
    assert_eq!(calls[2], Call::Exofork);
    assert_eq!(calls[3], Call::PageAlloc(child, uxstack_page(), RW));
}

#[test]
fn fork_failure_destroys_child() {
    let sys = MockSys::new().with_page(UTEXT, 1, RW).failing(
        |call| matches!(call, Call::SetStatus(..)),
        KernelError::Busy,
    );
    let mut env = UserEnv::new(sys);
    assert_eq!(
        fork(&mut env, |_| 0),
        Err(ForkError::SetStatus(KernelError::Busy))
    );
    let calls = env.sys().calls();
    assert_eq!(calls.last(), Some(&Call::Destroy(env.sys().child)));
}

#[test]
fn fork_without_inheritable_upcall() {
    let mut sys = MockSys::new().with_page(uxstack_page(), 3, RW);
    sys.forget_upcall = true;
    let mut env = UserEnv::new(sys);
    let err = fork(&mut env, |_| 0).unwrap_err();
    assert_eq!(err, ForkError::MissingUpcall);
    assert_eq!(KernelError::from(err), KernelError::InvalidArgument);

    let child = env.sys().child;
    let calls = env.sys().calls();
    assert!(!calls.contains(&Call::SetUpcall(child)));
    assert!(!calls.iter().any(|call| matches!(call, Call::SetStatus(..))));
    assert_eq!(calls.last(), Some(&Call::Destroy(child)));
}

#[test]
fn fork_exofork_failure_leaves_nothing_to_destroy() {
    let sys = MockSys::new().failing(
        |call| matches!(call, Call::Exofork),
        KernelError::NoFreeEnvironment,
    );
    let mut env = UserEnv::new(sys);
    assert_eq!(
        fork(&mut env, |_| 0),
        Err(ForkError::Exofork(KernelError::NoFreeEnvironment))
    );
    assert_eq!(env.sys().calls().last(), Some(&Call::Exofork));
}

#[test]
fn pgfault_sequence() {
    let sys = MockSys::new().with_page(UTEXT, 1, COW);
    let utf = UTrapframe {
        fault_va: UTEXT + 0x10,
        err: PFErrorCode::USER | PFErrorCode::WRITE_ACCESS | PFErrorCode::PRESENT,
    };
    pgfault(&sys, &utf).unwrap();
    assert_eq!(
        sys.calls(),
        [
            Call::PageAlloc(ME, PFTEMP, RW),
            Call::Memmove(PFTEMP, UTEXT, PAGE_SIZE),
            Call::PageUnmap(ME, UTEXT),
            Call::PageMap(ME, PFTEMP, ME, UTEXT, RW),
            Call::PageUnmap(ME, PFTEMP),
        ]
    );
}

#[test]
fn pgfault_checks_come_first() {
    let sys = MockSys::new().with_page(UTEXT, 1, RW);
    let read = UTrapframe {
        fault_va: UTEXT,
        err: PFErrorCode::USER | PFErrorCode::PRESENT,
    };
    let write = UTrapframe {
        fault_va: UTEXT,
        err: PFErrorCode::USER | PFErrorCode::WRITE_ACCESS | PFErrorCode::PRESENT,
    };
    assert!(matches!(pgfault(&sys, &read), Err(FaultError::NotWrite { .. })));
    assert!(matches!(
        pgfault(&sys, &write),
        Err(FaultError::NotCopyOnWrite { .. })
    ));
    assert_eq!(pgfault_upcall(&sys, &write), Err(KernelError::InvalidAccess));
    assert!(sys.calls().is_empty());
}

#[test]
fn pgfault_kernel_failure() {
    let sys = MockSys::new().with_page(UTEXT, 1, COW).failing(
        |call| matches!(call, Call::PageAlloc(..)),
        KernelError::NoMemory,
    );
    let utf = UTrapframe {
        fault_va: UTEXT,
        err: PFErrorCode::USER | PFErrorCode::WRITE_ACCESS | PFErrorCode::PRESENT,
    };
    assert_eq!(
        pgfault(&sys, &utf),
        Err(FaultError::Kernel {
            op: "page_alloc",
            source: KernelError::NoMemory
        })
    );
    assert_eq!(pgfault_upcall(&sys, &utf), Err(KernelError::NoMemory));
    assert_eq!(sys.calls().len(), 2);
}

#[test]
fn exit_that_returns_aborts() {
    let refused = MockSys::new().failing(
        |call| matches!(call, Call::Destroy(_)),
        KernelError::NoSuchProcess,
    );
    for sys in [MockSys::new(), refused] {
        let env = UserEnv::new(sys);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            env.exit();
        }));
        assert!(result.is_err());
        assert_eq!(env.sys().calls(), vec![Call::Destroy(EnvId::CURRENT)]);
    }
}
