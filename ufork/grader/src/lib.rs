//! Scenario tests of `ufork` running on the exok kernel.
//!
//! - `fork`: end-to-end forks and their failure paths.
//! - `cow`: the copy-on-write state of both address spaces.
//! - `pgfault`: the fault handler and its delivery.
//! - `stress`: repeated and concurrent forks, page leaks.
//! - `mock`: call sequences against a recording kernel.
//!
//! The helpers below are shared by the scenarios.

#[cfg(test)]
mod cow;
#[cfg(test)]
mod mock;
#[cfg(test)]
mod pgfault;
#[cfg(test)]
mod stress;

use exok::{
    EnvCtx, KernelConfig, KernelError,
    addressing::{PAGE_SIZE, Va},
    mm::page_table::Pte,
};
use grading::Outcome;
use log::debug;
use ufork::{Environment, UserEnv};

/// Runs `body` as the root environment `name` of a kernel booted with
/// `config`. The environment exits with `0` when `body` returns.
pub fn run<F>(config: KernelConfig, name: &str, body: F) -> Outcome
where
    F: FnOnce(&mut UserEnv<EnvCtx>) + Send + 'static,
{
    grading::run(config, name, move |ctx| {
        body(&mut UserEnv::new(ctx));
        0
    })
}

/// The caller's current entry for the page at `va`.
pub fn pte<S: Environment>(env: &UserEnv<S>, va: Va) -> Pte {
    let sys = env.sys();
    if sys.uvpd(va.pdx()).is_present() {
        sys.uvpt(va.pgnum())
    } else {
        Pte(0)
    }
}

/// Fills the page at `va` with `byte`.
pub fn fill<S: Environment>(env: &UserEnv<S>, va: Va, byte: u8) -> Result<(), KernelError> {
    env.write(va.page_down(), &[byte; PAGE_SIZE])
}

/// Whether every byte of the page at `va` equals `byte`.
pub fn holds<S: Environment>(env: &UserEnv<S>, va: Va, byte: u8) -> Result<bool, KernelError> {
    let mut buf = [0u8; PAGE_SIZE];
    env.read(va.page_down(), &mut buf)?;
    match buf.iter().position(|b| *b != byte) {
        Some(offset) => {
            debug!(
                "{:?}: expected {:#04x}, found {:#04x} at +{:#x}.",
                va, byte, buf[offset], offset
            );
            Ok(false)
        }
        None => Ok(true),
    }
}
