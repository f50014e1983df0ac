//! Interrupt handling shared by the coordinator and every worker.
//!
//! `Running -> Draining` on the first interrupt: loops stop submitting new
//! work and let in-flight jobs finish. A second interrupt while draining moves
//! to `ForceExit` and the process terminates at once.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const FORCE_EXIT: u8 = 2;

/// Exit code used for a forced termination (128 + SIGINT).
pub const FORCE_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    ForceExit,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            RUNNING => ShutdownState::Running,
            DRAINING => ShutdownState::Draining,
            _ => ShutdownState::ForceExit,
        }
    }
}

/// Cloneable handle onto one process-wide shutdown state.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    state: Arc<AtomicU8>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Record one interrupt and return the state it led to.
    pub fn signal(&self) -> ShutdownState {
        let previous = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                Some((s + 1).min(FORCE_EXIT))
            })
            .unwrap_or(FORCE_EXIT);
        ShutdownState::from_u8((previous + 1).min(FORCE_EXIT))
    }

    /// Cooperative stop flag checked once per loop iteration.
    pub fn is_stopping(&self) -> bool {
        self.state.load(Ordering::SeqCst) != RUNNING
    }

    pub fn is_forced(&self) -> bool {
        self.state.load(Ordering::SeqCst) == FORCE_EXIT
    }
}

/// Route Ctrl-C to `shutdown`, exiting the process on the second interrupt.
pub fn install_signal_handler(shutdown: Shutdown) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::Builder::new()
        .name("diffscan-signal".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    match shutdown.signal() {
                        ShutdownState::Draining => {
                            warn!("Interrupt received, draining in-flight work (interrupt again to exit now)");
                        }
                        ShutdownState::ForceExit => {
                            error!("Second interrupt received, exiting immediately");
                            std::process::exit(FORCE_EXIT_CODE);
                        }
                        ShutdownState::Running => {}
                    }
                }
            });
        })?;

    Ok(())
}
