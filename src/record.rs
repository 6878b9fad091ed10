//! Persisted capture of one request/response exchange.
//!
//! Records are stored as zlib-compressed JSON. The content hash is computed
//! over the compressed payload on demand and is never written back.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub request: Vec<u8>,
    pub response_body: Vec<u8>,
    pub response_headers: HeaderMap,
    pub status: StatusCode,
    pub hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRecord {
    request: Vec<u8>,
    response_body: Vec<u8>,
    response_headers: Vec<(String, Vec<u8>)>,
    status_code: u16,
}

impl Record {
    pub fn new(
        request: Vec<u8>,
        response_body: Vec<u8>,
        response_headers: HeaderMap,
        status: StatusCode,
    ) -> Self {
        Self {
            request,
            response_body,
            response_headers,
            status,
            hash: None,
        }
    }

    fn to_persisted(&self) -> PersistedRecord {
        PersistedRecord {
            request: self.request.clone(),
            response_body: self.response_body.clone(),
            response_headers: headermap_to_vec(&self.response_headers),
            status_code: self.status.as_u16(),
        }
    }

    fn from_persisted(persisted: PersistedRecord) -> CacheResult<Self> {
        let status = StatusCode::from_u16(persisted.status_code).map_err(|_| {
            CacheError::CorruptPayload(format!("invalid status code {}", persisted.status_code))
        })?;
        Ok(Self {
            request: persisted.request,
            response_body: persisted.response_body,
            response_headers: to_headermap(&persisted.response_headers)?,
            status,
            hash: None,
        })
    }
}

pub fn encode(record: &Record) -> CacheResult<Vec<u8>> {
    let json = serde_json::to_vec(&record.to_persisted())
        .map_err(|err| CacheError::CorruptPayload(format!("failed to serialize record: {err}")))?;
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|err| CacheError::io("compressing record", err))?;
    encoder
        .finish()
        .map_err(|err| CacheError::io("finishing record compression", err))
}

pub fn decode(payload: &[u8], need_hash: bool) -> CacheResult<Record> {
    let mut json = Vec::new();
    ZlibDecoder::new(payload)
        .read_to_end(&mut json)
        .map_err(|err| CacheError::CorruptPayload(format!("failed to inflate record: {err}")))?;
    let persisted: PersistedRecord = serde_json::from_slice(&json)
        .map_err(|err| CacheError::CorruptPayload(format!("failed to parse record: {err}")))?;
    let mut record = Record::from_persisted(persisted)?;
    if need_hash {
        record.hash = Some(content_hash(payload));
    }
    Ok(record)
}

pub fn content_hash(payload: &[u8]) -> String {
    blake3::hash(payload).to_hex().to_string()
}

fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, Vec<u8>)> {
    map.iter()
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect()
}

fn to_headermap(items: &[(String, Vec<u8>)]) -> CacheResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(items.len());
    for (name, value) in items {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| CacheError::CorruptPayload(format!("invalid header name '{name}'")))?;
        let value = HeaderValue::from_bytes(value)
            .map_err(|_| CacheError::CorruptPayload(format!("invalid value for header '{name}'")))?;
        map.append(name, value);
    }
    Ok(map)
}
