use crate::{fill, holds, pte};
use exok::{
    EnvCtx, EnvId, KernelError,
    addressing::{PAGE_SIZE, Va},
    memlayout::{PFTEMP, UTEXT, uxstack_page},
    mm::page_table::{Pte, PteFlags},
    syscall::Syscall,
    task::{PFErrorCode, UTrapframe, Upcall},
};
use grading::assert_exit_code;
use ufork::{FaultError, PageFaultReason, UserEnv, pgfault, pgfault_upcall, set_pgfault_handler};

const RO: PteFlags = PteFlags::from_bits_truncate(0b101);
const RW: PteFlags = PteFlags::from_bits_truncate(0b111);
const COW: PteFlags = PteFlags::from_bits_truncate(0b1000_0000_0101);

fn write_fault(va: Va, present: bool) -> UTrapframe {
    let mut err = PFErrorCode::USER | PFErrorCode::WRITE_ACCESS;
    if present {
        err |= PFErrorCode::PRESENT;
    }
    UTrapframe { fault_va: va, err }
}

fn install(env: &UserEnv<EnvCtx>) {
    set_pgfault_handler(env.sys(), Upcall(pgfault_upcall::<EnvCtx>)).unwrap();
}

#[assert_exit_code(0)]
fn read_fault_is_rejected(env: &mut UserEnv<EnvCtx>) {
    env.sys()
        .page_alloc(EnvId::CURRENT, UTEXT, COW)
        .unwrap();
    let pages = env.sys().kernel().pages_in_use();
    let utf = UTrapframe {
        fault_va: UTEXT + 3,
        err: PFErrorCode::USER | PFErrorCode::PRESENT,
    };
    assert_eq!(
        pgfault(env.sys(), &utf),
        Err(FaultError::NotWrite {
            fault_addr: UTEXT + 3
        })
    );
    assert_eq!(env.sys().kernel().pages_in_use(), pages);
    assert_eq!(pte(env, UTEXT).flags(), COW);
}

#[assert_exit_code(0)]
fn write_to_plain_page_is_rejected(env: &mut UserEnv<EnvCtx>) {
    env.sys_page_alloc(UTEXT).unwrap();
    env.sys()
        .page_alloc(EnvId::CURRENT, UTEXT + PAGE_SIZE, RO)
        .unwrap();
    let pages = env.sys().kernel().pages_in_use();

    for va in [UTEXT, UTEXT + PAGE_SIZE] {
        let entry = pte(env, va);
        assert_eq!(
            pgfault(env.sys(), &write_fault(va, true)),
            Err(FaultError::NotCopyOnWrite {
                fault_addr: va,
                pte: entry
            })
        );
    }
    assert_eq!(env.sys().kernel().pages_in_use(), pages);
}

#[assert_exit_code(0)]
fn write_to_unmapped_page_is_rejected(env: &mut UserEnv<EnvCtx>) {
    let err = pgfault(env.sys(), &write_fault(UTEXT, false)).unwrap_err();
    assert_eq!(
        err,
        FaultError::NotCopyOnWrite {
            fault_addr: UTEXT,
            pte: Pte(0)
        }
    );
    assert_eq!(KernelError::from(err), KernelError::InvalidAccess);
    assert_eq!(env.sys().kernel().pages_in_use(), 0);
}

#[assert_exit_code(0)]
fn reason_of_fault(env: &mut UserEnv<EnvCtx>) {
    env.sys()
        .page_alloc(EnvId::CURRENT, UTEXT, COW)
        .unwrap();
    let reason = PageFaultReason::new(env.sys(), &write_fault(UTEXT + 9, true));
    assert!(reason.is_cow_fault());
    assert!(reason.is_present);
    assert_eq!(reason.pte, pte(env, UTEXT));

    let reason = PageFaultReason::new(env.sys(), &write_fault(UTEXT + PAGE_SIZE, false));
    assert!(!reason.is_cow_fault());
    assert_eq!(reason.pte, Pte(0));
}

#[assert_exit_code(0)]
fn cow_fault_makes_private_copy(env: &mut UserEnv<EnvCtx>) {
    env.sys_page_alloc(UTEXT).unwrap();
    fill(env, UTEXT, 0x3c).unwrap();
    env.sys()
        .page_map(EnvId::CURRENT, UTEXT, EnvId::CURRENT, UTEXT, COW)
        .unwrap();
    let original = pte(env, UTEXT).pa();
    let pages = env.sys().kernel().pages_in_use();

    pgfault(env.sys(), &write_fault(UTEXT + 0x123, true)).unwrap();

    assert_eq!(pte(env, UTEXT).flags(), RW);
    assert_ne!(pte(env, UTEXT).pa(), original);
    assert!(!pte(env, PFTEMP).is_present());
    assert!(holds(env, UTEXT, 0x3c).unwrap());
    // The original had no other sharer and went back to the allocator.
    assert_eq!(env.sys().kernel().pages_in_use(), pages);
}

#[assert_exit_code(0)]
fn handler_registration(env: &mut UserEnv<EnvCtx>) {
    assert!(!pte(env, uxstack_page()).is_present());
    install(env);
    assert_eq!(pte(env, uxstack_page()).flags(), RW);
    assert!(env.thisenv().unwrap().pgfault_upcall.is_some());

    // A second registration keeps the stack.
    env.write(uxstack_page(), &[0x42]).unwrap();
    install(env);
    let mut byte = [0];
    env.read(uxstack_page(), &mut byte).unwrap();
    assert_eq!(byte, [0x42]);
    assert_eq!(env.sys().kernel().pages_in_use(), 1);
}

#[assert_exit_code(0)]
fn transparent_cow_write(env: &mut UserEnv<EnvCtx>) {
    install(env);
    env.sys()
        .page_alloc(EnvId::CURRENT, UTEXT, COW)
        .unwrap();
    env.write(UTEXT + 10, &[1, 2, 3, 4]).unwrap();
    assert_eq!(pte(env, UTEXT).flags(), RW);
    let mut buf = [0u8; 4];
    env.read(UTEXT + 10, &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4]);
}

#[assert_exit_code(-1)]
fn write_to_read_only_page_kills(env: &mut UserEnv<EnvCtx>) {
    install(env);
    env.sys()
        .page_alloc(EnvId::CURRENT, UTEXT, RO)
        .unwrap();
    let _ = env.write(UTEXT, &[1]);
    unreachable!("write to a read-only page returned");
}

#[assert_exit_code(-1)]
fn read_of_unmapped_page_kills(env: &mut UserEnv<EnvCtx>) {
    install(env);
    let mut byte = [0];
    let _ = env.read(UTEXT, &mut byte);
    unreachable!("read of an unmapped page returned");
}

#[assert_exit_code(-1)]
fn fault_without_handler_kills(env: &mut UserEnv<EnvCtx>) {
    env.sys()
        .page_alloc(EnvId::CURRENT, UTEXT, COW)
        .unwrap();
    let _ = env.write(UTEXT, &[1]);
    unreachable!("write without a handler returned");
}
