//! Resident memory measurement for the current process

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::warn;

use crate::renderer::Renderer;

/// Measures how much memory a worker is using after a job
pub struct MemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Memory probe unavailable on this platform: {}", e);
                None
            }
        };

        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }

    /// Resident set size of this process in bytes
    pub fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|process| process.memory())
    }

    /// Usage to compare against a job's budget: the renderer's own report
    /// when it has one, otherwise process RSS. Unmeasurable usage reads as
    /// zero so a missing probe never forces recycling.
    pub fn current_usage<R: Renderer + ?Sized>(&self, renderer: &R) -> u64 {
        renderer
            .memory_usage()
            .or_else(|| self.resident_bytes())
            .unwrap_or(0)
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}
