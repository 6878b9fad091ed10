use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held for as long as an instance serves its port.
pub type PortGuard = OwnedMutexGuard<()>;

/// One async mutex per port, so a port is served by at most one instance.
#[derive(Debug, Default)]
pub struct PortLocks {
    ports: Mutex<HashMap<u16, Arc<AsyncMutex<()>>>>,
}

impl PortLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, port: u16) -> Arc<AsyncMutex<()>> {
        let mut ports = self.ports.lock();
        Arc::clone(ports.entry(port).or_default())
    }

    /// Waits until `port` is free and claims it.
    pub async fn acquire(&self, port: u16) -> PortGuard {
        self.slot(port).lock_owned().await
    }

    pub fn try_acquire(&self, port: u16) -> Option<PortGuard> {
        self.slot(port).try_lock_owned().ok()
    }

    pub fn is_held(&self, port: u16) -> bool {
        let ports = self.ports.lock();
        ports
            .get(&port)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }
}
