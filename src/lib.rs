pub mod cli;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod proxy;
pub mod record;
pub mod scope;
pub mod settings;
pub mod storage;
pub mod util;

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::info;

use crate::{
    manager::{Manager, lock::PortLocks},
    proxy::listener,
    scope::Scope,
    settings::Settings,
};

/// Serves until `scope` is cancelled, then waits for every instance to
/// release its port and close its storage.
pub async fn run(settings: Settings, scope: Scope) -> Result<()> {
    if let Some(addr) = settings.metrics_listen {
        let metrics_scope = scope.clone();
        tokio::spawn(async move {
            info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, metrics_scope).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let locks = Arc::new(PortLocks::new());
    let mut instances = Vec::new();
    if settings.buckets.is_empty() {
        instances.push(listener::start_instance(settings, scope.clone(), &locks).await?);
    } else {
        let (from, to) = settings
            .port_range()
            .ok_or_else(|| anyhow!("buckets require port_from and port_to"))?;
        let buckets = settings.buckets.clone();
        let manager = Manager::with_locks(from, to, settings, locks);
        for bucket in &buckets {
            match manager.start(&scope, bucket).await {
                Ok(instance) => instances.push(instance),
                Err(err) => {
                    scope.cancel();
                    for instance in instances {
                        instance.stopped().await;
                    }
                    return Err(err.context(format!("failed to start bucket '{bucket}'")));
                }
            }
        }
    }

    scope.cancelled().await;
    info!("shutting down");
    for instance in instances {
        instance.stopped().await;
    }
    Ok(())
}
