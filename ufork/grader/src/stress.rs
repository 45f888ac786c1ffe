use crate::{fill, holds};
use exok::{
    EnvCtx,
    addressing::{PAGE_SIZE, Va},
    memlayout::UTEXT,
};
use grading::assert_exit_code;
use std::sync::{Arc, Barrier};
use ufork::{UserEnv, fork};

const PAGES: usize = 16;

fn page(i: usize) -> Va {
    UTEXT + i * PAGE_SIZE
}

#[assert_exit_code(0)]
fn cow_cleanup_stress(env: &mut UserEnv<EnvCtx>) {
    for i in 0..PAGES {
        env.sys_page_alloc(page(i)).unwrap();
        fill(env, page(i), i as u8).unwrap();
    }

    let mut baseline = None;
    for round in 0..12u8 {
        let child = fork(env, move |child| {
            for i in (0..PAGES).step_by(2) {
                fill(child, page(i), 0x80 | round).unwrap();
            }
            let intact = (0..PAGES).all(|i| {
                let expected = if i % 2 == 0 { 0x80 | round } else { i as u8 };
                holds(child, page(i), expected).unwrap()
            });
            if intact { 0 } else { 1 }
        })
        .unwrap();
        assert_eq!(env.sys().join(child), Ok(0));

        // Whatever the child copied is gone with it.
        let in_use = env.sys().kernel().pages_in_use();
        assert_eq!(*baseline.get_or_insert(in_use), in_use);
        for i in 0..PAGES {
            assert!(holds(env, page(i), i as u8).unwrap());
        }
    }
}

#[assert_exit_code(0)]
fn concurrent_writers(env: &mut UserEnv<EnvCtx>) {
    const CHILDREN: u8 = 4;
    for i in 0..PAGES {
        env.sys_page_alloc(page(i)).unwrap();
    }

    let start = Arc::new(Barrier::new(CHILDREN as usize + 1));
    let mut children = Vec::new();
    for id in 1..=CHILDREN {
        let start = start.clone();
        children.push(
            fork(env, move |child| {
                start.wait();
                for _ in 0..8 {
                    for i in 0..PAGES {
                        fill(child, page(i), id).unwrap();
                    }
                    if !(0..PAGES).all(|i| holds(child, page(i), id).unwrap()) {
                        return 1;
                    }
                }
                0
            })
            .unwrap(),
        );
    }

    start.wait();
    for _ in 0..8 {
        for i in 0..PAGES {
            fill(env, page(i), 0xff).unwrap();
        }
        assert!((0..PAGES).all(|i| holds(env, page(i), 0xff).unwrap()));
    }
    for child in children {
        assert_eq!(env.sys().join(child), Ok(0));
    }
}

#[assert_exit_code(0)]
fn fork_bomb_releases_everything(env: &mut UserEnv<EnvCtx>) {
    env.sys_page_alloc(UTEXT).unwrap();
    fill(env, UTEXT, 0x01).unwrap();
    let children = (0..32u8)
        .map(|n| {
            fork(env, move |child| {
                fill(child, UTEXT, n).unwrap();
                if holds(child, UTEXT, n).unwrap() { 0 } else { 1 }
            })
            .unwrap()
        })
        .collect::<Vec<_>>();
    for child in children {
        assert_eq!(env.sys().join(child), Ok(0));
    }
    assert!(holds(env, UTEXT, 0x01).unwrap());
    assert_eq!(env.sys().kernel().envs_in_use(), 1);
}
