use http::Uri;
use once_cell::sync::Lazy;
use regex::Regex;

static BUCKET_STRIP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^-_a-zA-Z0-9]+").expect("static bucket regex"));

const EMPTY_BUCKET: &str = "root";

pub const MAX_BUCKET_LEN: usize = 160;
const BUCKET_HASH_LEN: usize = 16;

/// Which parts of the request URL participate in the cache identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FingerprintOptions {
    pub strip_host: bool,
    pub strip_user_info: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketNaming {
    pub fixed: Option<String>,
    pub dynamic: bool,
}

impl BucketNaming {
    pub fn fixed(name: impl Into<String>) -> Self {
        Self {
            fixed: Some(name.into()),
            dynamic: false,
        }
    }

    pub fn dynamic() -> Self {
        Self {
            fixed: None,
            dynamic: true,
        }
    }

    fn fixed_name(&self) -> Option<&str> {
        if self.dynamic {
            return None;
        }
        self.fixed.as_deref().filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub bucket: String,
    pub key: String,
}

/// Derives the (bucket, key) pair for a buffered request.
///
/// The key comes from `inbound`, the target as the client sent it, so records
/// survive a change of upstream. Dynamic bucket names come from `forwarded`,
/// the target after it was pointed at the upstream. `request_dump` is the full
/// wire form of the request; only the bytes after the header/body separator
/// feed the key.
pub fn derive(
    inbound: &Uri,
    forwarded: &Uri,
    request_dump: &[u8],
    naming: &BucketNaming,
    options: FingerprintOptions,
) -> Fingerprint {
    let key = cache_key(&canonical_url(inbound, options), request_body(request_dump));
    let bucket = match naming.fixed_name() {
        Some(name) => name.to_string(),
        None => bucket_from_url(&canonical_url(forwarded, options)),
    };
    Fingerprint { bucket, key }
}

/// Renders `[userinfo@][host[:port]]path[?query]`. The scheme never participates.
pub fn canonical_url(uri: &Uri, options: FingerprintOptions) -> String {
    let mut out = String::new();
    if let Some(authority) = uri.authority() {
        let (user_info, host_port) = match authority.as_str().rsplit_once('@') {
            Some((user_info, host_port)) => (Some(user_info), host_port),
            None => (None, authority.as_str()),
        };
        if let Some(user_info) = user_info
            && !options.strip_user_info
        {
            out.push_str(user_info);
            out.push('@');
        }
        if !options.strip_host {
            out.push_str(host_port);
        }
    }
    match uri.path_and_query() {
        Some(path_and_query) => out.push_str(path_and_query.as_str()),
        None => out.push('/'),
    }
    out
}

pub fn cache_key(canonical_url: &str, body: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(canonical_url.as_bytes());
    hasher.update(body);
    hasher.finalize().to_hex().to_string()
}

/// Bucket name for a canonical URL. Names longer than [`MAX_BUCKET_LEN`] keep
/// a prefix and gain a hash suffix so the file name stays within OS limits.
pub fn bucket_from_url(canonical_url: &str) -> String {
    let stripped = BUCKET_STRIP.replace_all(canonical_url, "");
    if stripped.is_empty() {
        return EMPTY_BUCKET.to_string();
    }
    if stripped.len() <= MAX_BUCKET_LEN {
        return stripped.into_owned();
    }
    // Only ASCII survives the strip, so byte slicing stays on char boundaries.
    let digest = blake3::hash(stripped.as_bytes()).to_hex();
    let prefix = MAX_BUCKET_LEN - BUCKET_HASH_LEN - 1;
    format!("{}-{}", &stripped[..prefix], &digest.as_str()[..BUCKET_HASH_LEN])
}

pub fn request_body(dump: &[u8]) -> &[u8] {
    dump.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|idx| &dump[idx + 4..])
        .unwrap_or_default()
}
