//! Cache-aside request handling: answer from the backend when a record exists,
//! otherwise ask the upstream, persist the exchange and answer with it.

use std::sync::Arc;

use http::{HeaderMap, StatusCode};
use tracing::{debug, info, warn};

use crate::error::{CacheError, CacheResult};
use crate::fingerprint::{self, Fingerprint};
use crate::logging::CacheOutcome;
use crate::metrics;
use crate::record::{self, Record};
use crate::storage::StorageBackend;

use super::AppContext;
use super::codec::{self, InboundRequest};

#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub outcome: CacheOutcome,
    pub bucket: Option<String>,
    pub error: Option<String>,
}

impl Reply {
    fn from_record(record: Record, outcome: CacheOutcome, bucket: String) -> Self {
        Self {
            status: record.status,
            headers: record.response_headers,
            body: record.response_body,
            outcome,
            bucket: Some(bucket),
            error: None,
        }
    }

    fn failure(message: String, bucket: Option<String>) -> Self {
        let (headers, body) = codec::text_response(StatusCode::SERVICE_UNAVAILABLE, &message);
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            headers,
            body,
            outcome: CacheOutcome::Error,
            bucket,
            error: Some(message),
        }
    }
}

pub async fn handle(app: &AppContext, request: &InboundRequest) -> Reply {
    let uri = match app.upstream.upstream().rewrite(&request.uri) {
        Ok(uri) => uri,
        Err(err) => return Reply::failure(err.to_string(), None),
    };
    let dump = request.dump();
    let Fingerprint { bucket, key } = fingerprint::derive(
        &request.uri,
        &uri,
        &dump,
        &app.naming,
        app.fingerprint_options,
    );
    if app.settings.verbose {
        info!(%uri, bucket, key, "looking up record");
    } else {
        debug!(%uri, bucket, key, "looking up record");
    }

    if !app.settings.force_save {
        match read_blocking(&app.backend, &bucket, &key).await {
            Ok(Some(payload)) => {
                metrics::record_cache_lookup(true);
                return match record::decode(&payload, false) {
                    Ok(record) => Reply::from_record(record, CacheOutcome::Hit, bucket),
                    Err(err) => {
                        warn!(bucket, key, error = %err, "stored record is unreadable");
                        Reply::failure(err.to_string(), Some(bucket))
                    }
                };
            }
            Ok(None) => metrics::record_cache_lookup(false),
            Err(err) => {
                warn!(bucket, key, error = %err, "record lookup failed");
                return Reply::failure(err.to_string(), Some(bucket));
            }
        }
    }

    let response = match app.upstream.send(request).await {
        Ok(response) => response,
        Err(failure) => {
            metrics::record_upstream_error(failure.kind.as_str());
            warn!(%uri, kind = failure.kind.as_str(), error = %failure, "upstream request failed");
            let err = CacheError::Upstream(failure.to_string());
            return Reply::failure(err.to_string(), Some(bucket));
        }
    };

    let record = Record::new(dump, response.body, response.headers, response.status);
    let payload = match record::encode(&record) {
        Ok(payload) => payload,
        Err(err) => return Reply::failure(err.to_string(), Some(bucket)),
    };
    if let Err(err) = save_blocking(&app.backend, &bucket, &key, payload).await {
        metrics::record_cache_store_error();
        warn!(bucket, key, error = %err, "failed to persist record");
        return Reply::failure(err.to_string(), Some(bucket));
    }
    metrics::record_cache_store();
    if app.settings.verbose {
        info!(bucket, key, status = record.status.as_u16(), "recorded upstream response");
    }

    let outcome = if app.settings.force_save {
        CacheOutcome::Refresh
    } else {
        CacheOutcome::Miss
    };
    Reply::from_record(record, outcome, bucket)
}

async fn read_blocking(
    backend: &Arc<StorageBackend>,
    bucket: &str,
    key: &str,
) -> CacheResult<Option<Vec<u8>>> {
    let backend = Arc::clone(backend);
    let bucket = bucket.to_string();
    let key = key.to_string();
    tokio::task::spawn_blocking(move || backend.read(&bucket, &key))
        .await
        .map_err(|err| CacheError::io("record lookup task", std::io::Error::other(err)))?
}

async fn save_blocking(
    backend: &Arc<StorageBackend>,
    bucket: &str,
    key: &str,
    payload: Vec<u8>,
) -> CacheResult<()> {
    let backend = Arc::clone(backend);
    let bucket = bucket.to_string();
    let key = key.to_string();
    tokio::task::spawn_blocking(move || backend.save(&bucket, &key, &payload))
        .await
        .map_err(|err| CacheError::io("record save task", std::io::Error::other(err)))?
}
