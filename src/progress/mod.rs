//! Progress Driver, §4.G.
//!
//! Grounded on `Fam_Memory_Registration_Libfabric::progress_thread`/
//! `Fam_Memory_Service_Direct`'s manual-progress loop in
//! `examples/original_source/src/memory_service/fam_memory_registration_libfabric.cpp`
//! and `fam_memory_service_direct.cpp`: when the fabric provider reports manual control
//! or data progress, a dedicated thread calls into it in a tight loop until a halt flag
//! is set at shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::fabric::{FabricProvider, ProgressMode};

/// Drives a [`FabricProvider`]'s manual progress, if it needs one. Constructing a
/// driver against an `Auto`-progress provider is a no-op: no thread is spawned.
pub struct ProgressDriver {
    halt: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressDriver {
    pub fn start<F: FabricProvider + 'static>(fabric: Arc<F>) -> Self {
        if fabric.progress_mode() != ProgressMode::Manual {
            return Self {
                halt: Arc::new(AtomicBool::new(true)),
                handle: None,
            };
        }
        let halt = Arc::new(AtomicBool::new(false));
        let thread_halt = halt.clone();
        let handle = std::thread::Builder::new()
            .name("fam-progress".to_string())
            .spawn(move || {
                while !thread_halt.load(Ordering::Acquire) {
                    fabric.poll_progress();
                }
            })
            .expect("failed to spawn progress driver thread");
        Self {
            halt,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.halt.load(Ordering::Acquire)
    }

    /// Signal the driver thread to stop and join it. Idempotent.
    pub fn stop(&mut self) {
        self.halt.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::testing::LoopbackFabric;

    #[test]
    fn manual_progress_provider_spawns_a_thread() {
        let fabric = Arc::new(LoopbackFabric::new(true));
        let mut driver = ProgressDriver::start(fabric);
        assert!(driver.is_running());
        driver.stop();
        assert!(!driver.is_running());
    }

    #[test]
    fn auto_progress_provider_spawns_nothing() {
        let fabric = Arc::new(LoopbackFabric::new(false));
        let driver = ProgressDriver::start(fabric);
        assert!(!driver.is_running());
    }
}
