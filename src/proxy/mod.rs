pub mod codec;
pub mod handler;
pub mod listener;
pub mod tls;
pub mod upstream;

use std::sync::Arc;

use crate::fingerprint::{BucketNaming, FingerprintOptions};
use crate::settings::Settings;
use crate::storage::StorageBackend;

use codec::Limits;
use upstream::UpstreamClient;

/// Everything one proxy instance needs to answer a request.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub backend: Arc<StorageBackend>,
    pub upstream: Arc<UpstreamClient>,
    pub naming: BucketNaming,
    pub fingerprint_options: FingerprintOptions,
}

impl AppContext {
    pub fn new(settings: Settings, backend: StorageBackend, upstream: UpstreamClient) -> Self {
        Self {
            naming: settings.bucket_naming(),
            fingerprint_options: settings.fingerprint_options(),
            settings: Arc::new(settings),
            backend: Arc::new(backend),
            upstream: Arc::new(upstream),
        }
    }

    pub fn client_limits(&self) -> Limits {
        let timeout = self.settings.client_timeout();
        Limits {
            idle_timeout: timeout,
            read_timeout: timeout,
            max_header_bytes: self.settings.max_header_size,
            max_body_bytes: self.settings.max_body_size,
        }
    }
}
