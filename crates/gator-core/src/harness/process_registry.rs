//! Tracks PIDs of in-flight agent processes so orchestrator shutdown can
//! terminate them even after their owning task has been dropped or
//! cancelled.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashSet<u32>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, pid: u32) {
        self.inner.lock().await.insert(pid);
    }

    pub async fn unregister(&self, pid: u32) {
        self.inner.lock().await.remove(&pid);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// SIGTERM every registered process, wait the grace window, then
    /// SIGKILL anything still alive. Called once, on orchestrator shutdown.
    pub async fn shutdown_all(&self) {
        let pids: Vec<u32> = self.inner.lock().await.iter().copied().collect();
        if pids.is_empty() {
            return;
        }
        info!(count = pids.len(), "sending SIGTERM to registered agent processes");

        #[cfg(unix)]
        {
            for pid in &pids {
                if unsafe { libc::kill(*pid as i32, libc::SIGTERM) } != 0 {
                    warn!(pid, "SIGTERM failed during shutdown sweep");
                }
            }
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            for pid in &pids {
                let _ = unsafe { libc::kill(*pid as i32, libc::SIGKILL) };
            }
        }

        self.inner.lock().await.clear();
    }
}
