use crate::{fill, holds, pte};
use exok::{
    EnvCtx, EnvId,
    addressing::PAGE_SIZE,
    memlayout::{UTEXT, uxstack_page},
    mm::page_table::PteFlags,
    syscall::{KernelView, Syscall},
    task::Upcall,
};
use grading::assert_exit_code;
use std::sync::mpsc;
use ufork::{UserEnv, fork, pgfault_upcall, set_pgfault_handler};

const COW: PteFlags = PteFlags::from_bits_truncate(0b1000_0000_0101);
const RO: PteFlags = PteFlags::from_bits_truncate(0b101);
const RW: PteFlags = PteFlags::from_bits_truncate(0b111);

#[assert_exit_code(0)]
fn both_sides_copy_on_write(env: &mut UserEnv<EnvCtx>) {
    set_pgfault_handler(env.sys(), Upcall(pgfault_upcall::<EnvCtx>)).unwrap();
    env.sys_page_alloc(UTEXT).unwrap();
    fill(env, UTEXT, 0x5a).unwrap();
    env.sys()
        .page_alloc(EnvId::CURRENT, UTEXT + PAGE_SIZE, RO)
        .unwrap();

    let data = pte(env, UTEXT).pa();
    let rodata = pte(env, UTEXT + PAGE_SIZE).pa();
    let xstack = pte(env, uxstack_page()).pa();
    assert!(data.is_some() && rodata.is_some() && xstack.is_some());

    let (tx, rx) = mpsc::channel();
    let child = fork(env, move |child| {
        assert_eq!(pte(child, UTEXT).flags(), COW);
        assert_eq!(pte(child, UTEXT).pa(), data);
        assert_eq!(pte(child, UTEXT + PAGE_SIZE).flags(), RO);
        assert_eq!(pte(child, UTEXT + PAGE_SIZE).pa(), rodata);

        let own = pte(child, uxstack_page());
        assert_eq!(own.flags(), RW);
        assert_ne!(own.pa(), xstack);
        rx.recv().unwrap();
        0
    })
    .unwrap();

    assert_eq!(pte(env, UTEXT).flags(), COW);
    assert_eq!(pte(env, UTEXT).pa(), data);
    assert_eq!(pte(env, UTEXT + PAGE_SIZE).flags(), RO);
    assert_eq!(pte(env, uxstack_page()).flags(), RW);
    assert_eq!(pte(env, uxstack_page()).pa(), xstack);

    tx.send(()).unwrap();
    assert_eq!(env.sys().join(child), Ok(0));
}

#[assert_exit_code(0)]
fn first_write_takes_a_private_copy(env: &mut UserEnv<EnvCtx>) {
    env.sys_page_alloc(UTEXT).unwrap();
    fill(env, UTEXT, 0x11).unwrap();
    let shared = pte(env, UTEXT).pa();

    let (tx, rx) = mpsc::channel();
    let child = fork(env, move |child| {
        rx.recv().unwrap();
        // The parent moved out; the original stays with the child.
        assert_eq!(pte(child, UTEXT).flags(), COW);
        assert_eq!(pte(child, UTEXT).pa(), shared);
        if holds(child, UTEXT, 0x11).unwrap() { 0 } else { 1 }
    })
    .unwrap();

    env.write(UTEXT + 7, &[0x22]).unwrap();
    assert_eq!(pte(env, UTEXT).flags(), RW);
    assert_ne!(pte(env, UTEXT).pa(), shared);
    let mut page = [0u8; PAGE_SIZE];
    env.read(UTEXT, &mut page).unwrap();
    assert_eq!(page[7], 0x22);
    assert!(page.iter().enumerate().all(|(i, b)| i == 7 || *b == 0x11));

    tx.send(()).unwrap();
    assert_eq!(env.sys().join(child), Ok(0));
}

#[assert_exit_code(0)]
fn refork_remarks_parent(env: &mut UserEnv<EnvCtx>) {
    env.sys_page_alloc(UTEXT).unwrap();
    fill(env, UTEXT, 0x01).unwrap();

    let (tx_a, rx_a) = mpsc::channel();
    let a = fork(env, move |a| {
        rx_a.recv().unwrap();
        if holds(a, UTEXT, 0x01).unwrap() { 0 } else { 1 }
    })
    .unwrap();

    // Already copy-on-write: a second fork shares the same page three ways.
    let shared = pte(env, UTEXT).pa();
    let (tx_b, rx_b) = mpsc::channel();
    let b = fork(env, move |b| {
        assert_eq!(pte(b, UTEXT).pa(), shared);
        rx_b.recv().unwrap();
        if holds(b, UTEXT, 0x01).unwrap() { 0 } else { 1 }
    })
    .unwrap();
    assert_eq!(pte(env, UTEXT).flags(), COW);
    assert_eq!(pte(env, UTEXT).pa(), shared);

    // Writable again after a private copy: the next fork marks it again.
    fill(env, UTEXT, 0x02).unwrap();
    assert_eq!(pte(env, UTEXT).flags(), RW);
    let c = fork(env, |c| if holds(c, UTEXT, 0x02).unwrap() { 0 } else { 1 }).unwrap();
    assert_eq!(pte(env, UTEXT).flags(), COW);

    tx_a.send(()).unwrap();
    tx_b.send(()).unwrap();
    assert_eq!(env.sys().join(a), Ok(0));
    assert_eq!(env.sys().join(b), Ok(0));
    assert_eq!(env.sys().join(c), Ok(0));
    assert!(holds(env, UTEXT, 0x02).unwrap());
}

#[assert_exit_code(0)]
fn child_inherits_upcall(env: &mut UserEnv<EnvCtx>) {
    let (tx, rx) = mpsc::channel();
    let child = fork(env, move |child| {
        let upcall = child.thisenv().and_then(|info| info.pgfault_upcall);
        assert!(upcall.is_some());
        rx.recv().unwrap();
        0
    })
    .unwrap();

    let mine = env.thisenv().and_then(|info| info.pgfault_upcall);
    let info = env.sys().env(child.envx()).unwrap();
    assert_eq!(info.id, child);
    assert_eq!(info.parent_id, env.envid());
    assert!(mine.is_some());
    assert_eq!(info.pgfault_upcall, mine);

    tx.send(()).unwrap();
    assert_eq!(env.sys().join(child), Ok(0));
}
