//! Test support for programs running on exok.
//!
//! [`run`] boots a kernel, runs a closure as its root environment and
//! reports how the environment ended. The `#[assert_exit_code(N)]`
//! attribute wraps it into a `#[test]`. The annotated function takes any
//! user-side state built from an [`EnvCtx`]:
//!
//! ```ignore
//! #[assert_exit_code(0)]
//! fn hello(env: &mut UserEnv<EnvCtx>) {
//!     env.sys_page_alloc(UTEXT).unwrap();
//! }
//! ```
extern crate grading_derive;

pub use grading_derive::*;

use exok::{EnvCtx, Kernel, KernelConfig};
use log::{info, warn};

/// How a root environment and its descendants ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Exit code of the root environment.
    pub exit_code: i32,
    /// Physical pages still allocated after every environment exited.
    pub pages_leaked: usize,
    /// Environment slots still occupied after every environment exited.
    pub envs_leaked: usize,
}

/// Installs the test logger. `RUST_LOG` selects the level.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Runs `entry` as the root environment `name` of a new kernel booted with
/// `config`, and waits for it and everything it started.
pub fn run<F>(config: KernelConfig, name: &str, entry: F) -> Outcome
where
    F: FnOnce(EnvCtx) -> i32 + Send + 'static,
{
    init_logger();
    let kernel = Kernel::new(config);
    let id = kernel
        .spawn(name, entry)
        .unwrap_or_else(|e| panic!("{}: failed to spawn the root environment: {}", name, e));
    let exit_code = kernel
        .join(id)
        .unwrap_or_else(|e| panic!("{}: failed to join the root environment: {}", name, e));
    kernel.shutdown();

    let outcome = Outcome {
        exit_code,
        pages_leaked: kernel.pages_in_use(),
        envs_leaked: kernel.envs_in_use(),
    };
    if outcome.pages_leaked != 0 || outcome.envs_leaked != 0 {
        warn!("{}: {:?}.", name, outcome);
    } else {
        info!("{}: exited with {}.", name, exit_code);
    }
    outcome
}
