//! Serves buckets on a pool of ports, one proxy instance per `run_srv` call.

pub mod lock;
pub mod ports;

use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::info;

use crate::proxy::listener::{self, Instance};
use crate::scope::Scope;
use crate::settings::Settings;

use lock::PortLocks;
use ports::PortRange;

pub struct Manager {
    ports: PortRange,
    prototype: RwLock<Settings>,
    locks: Arc<PortLocks>,
}

impl Manager {
    pub fn new(from: u16, to: u16, prototype: Settings) -> Self {
        Self::with_locks(from, to, prototype, Arc::new(PortLocks::new()))
    }

    /// Shares port locks with other managers in the same process.
    pub fn with_locks(from: u16, to: u16, prototype: Settings, locks: Arc<PortLocks>) -> Self {
        Self {
            ports: PortRange::new(from, to),
            prototype: RwLock::new(prototype),
            locks,
        }
    }

    pub fn set_prototype(&self, settings: Settings) {
        *self.prototype.write() = settings;
    }

    pub fn ports(&self) -> &[u16] {
        self.ports.ports()
    }

    pub fn locks(&self) -> &Arc<PortLocks> {
        &self.locks
    }

    /// Starts an instance serving `bucket` on the next port and returns that
    /// port. The instance stops when `scope` is cancelled.
    pub async fn run_srv(&self, scope: &Scope, bucket: &str) -> Result<u16> {
        let instance = self.start(scope, bucket).await?;
        Ok(instance.port())
    }

    /// Like [`Manager::run_srv`] but hands back the running instance.
    pub async fn start(&self, scope: &Scope, bucket: &str) -> Result<Instance> {
        let port = self.ports.next_port();
        let settings = self.prototype.read().for_instance(bucket, port);
        let instance = listener::start_instance(settings, scope.clone(), &self.locks).await?;
        info!(bucket, port, "bucket instance started");
        Ok(instance)
    }
}
