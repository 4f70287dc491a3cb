//! Multi-tenant S3 client cache (spec.md §4.B).
//!
//! Deduplicates connections across destinations sharing credentials and an
//! endpoint. `acquire` is read-preferring with double-checked insertion so
//! concurrent callers for the same key observe at most one construction.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use tokio::runtime::Runtime;
use tracing::{debug, warn};

use crate::config::DestinationSpec;
use crate::error::{AdapterError, ErrorKind};

/// Hash over `(endpoint, access_key, secret_key, tls_enabled, region)`.
/// Not security sensitive — purely an in-process dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct S3ClientKey(u64);

impl S3ClientKey {
    pub fn for_spec(spec: &DestinationSpec) -> Option<Self> {
        let (endpoint, access_key, secret_key, tls_enabled, region) = spec.s3_identity()?;
        let mut hasher = DefaultHasher::new();
        endpoint.hash(&mut hasher);
        access_key.hash(&mut hasher);
        secret_key.hash(&mut hasher);
        tls_enabled.hash(&mut hasher);
        region.hash(&mut hasher);
        Some(S3ClientKey(hasher.finish()))
    }
}

/// A live S3 client paired with the tokio runtime used to drive it.
///
/// Scoped to connection identity only (endpoint/credentials/region) — never
/// a bucket or prefix. Two `DestinationSpec::S3` entries sharing one
/// `S3ClientKey` may still target different buckets, so the bucket/prefix a
/// given `put`/`delete` operates on lives on `S3Adapter`, not here (spec.md
/// §3: the key dedupes connections, not data targets).
///
/// The SDK is async; everything else in this daemon is blocking threads
/// (spec.md §5), so each client bridges onto its own current-thread runtime
/// the way `conserve::transport::s3::S3Transport` bridges theirs.
pub struct SharedS3Client {
    pub client: aws_sdk_s3::Client,
    pub runtime: Runtime,
}

impl SharedS3Client {
    pub fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }
}

#[derive(Default)]
pub struct S3ClientCache {
    clients: RwLock<HashMap<S3ClientKey, Arc<SharedS3Client>>>,
}

impl S3ClientCache {
    pub fn new() -> Self {
        S3ClientCache { clients: RwLock::new(HashMap::new()) }
    }

    /// Current number of live clients, exposed as-is on the health surface
    /// (spec.md §4.G).
    pub fn active_count(&self) -> usize {
        self.clients.read().expect("s3 cache lock poisoned").len()
    }

    /// Acquire the client for `spec`'s credentials/endpoint, constructing and
    /// probing a new one on first use. `spec` must be an S3 destination.
    pub fn acquire(&self, spec: &DestinationSpec) -> Result<Arc<SharedS3Client>, AdapterError> {
        let key = S3ClientKey::for_spec(spec)
            .ok_or_else(|| AdapterError::new(ErrorKind::ConfigInvalid, "not an s3 destination"))?;

        if let Some(existing) = self.clients.read().expect("s3 cache lock poisoned").get(&key) {
            return Ok(existing.clone());
        }

        let DestinationSpec::S3 { endpoint, access_key, secret_key, tls_enabled, region, .. } = spec else {
            unreachable!("s3_identity() returned Some for a non-S3 spec");
        };

        let mut guard = self.clients.write().expect("s3 cache lock poisoned");
        // Double-checked: another acquirer may have raced us to the write lock.
        if let Some(existing) = guard.get(&key) {
            return Ok(existing.clone());
        }

        let shared = build_and_probe(endpoint, access_key, secret_key, *tls_enabled, region)?;
        let shared = Arc::new(shared);
        guard.insert(key, shared.clone());
        debug!(endpoint, "constructed new s3 client");
        Ok(shared)
    }

    /// Drop all cached clients. The SDK has no explicit close; releasing
    /// references is sufficient (spec.md §4.B).
    pub fn close(&self) {
        self.clients.write().expect("s3 cache lock poisoned").clear();
    }
}

fn build_and_probe(
    endpoint: &str,
    access_key: &str,
    secret_key: &str,
    tls_enabled: bool,
    region: &str,
) -> Result<SharedS3Client, AdapterError> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|e| {
        AdapterError::new(ErrorKind::PermanentOther, format!("failed to start s3 runtime: {e}"))
    })?;

    let endpoint_url = if tls_enabled && !endpoint.starts_with("https://") && !endpoint.starts_with("http://") {
        format!("https://{endpoint}")
    } else if !endpoint.starts_with("https://") && !endpoint.starts_with("http://") {
        format!("http://{endpoint}")
    } else {
        endpoint.to_string()
    };

    let credentials = aws_sdk_s3::config::Credentials::new(access_key, secret_key, None, None, "replicatord");
    let s3_config = aws_sdk_s3::config::Builder::new()
        .region(aws_sdk_s3::config::Region::new(region.to_string()))
        .endpoint_url(endpoint_url)
        .credentials_provider(credentials)
        .force_path_style(true)
        .build();
    let client = aws_sdk_s3::Client::from_conf(s3_config);

    // Liveness probe: list buckets. On failure nothing is inserted into the
    // cache (spec.md §4.B).
    runtime.block_on(client.list_buckets().send()).map_err(|e| {
        warn!(endpoint, "s3 liveness probe failed: {e}");
        AdapterError::new(ErrorKind::NetTransient, format!("s3 liveness probe failed: {e}"))
    })?;

    Ok(SharedS3Client { client, runtime })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(endpoint: &str, access_key: &str) -> DestinationSpec {
        spec_with_bucket(endpoint, access_key, "bucket")
    }

    fn spec_with_bucket(endpoint: &str, access_key: &str, bucket: &str) -> DestinationSpec {
        DestinationSpec::S3 {
            endpoint: endpoint.to_string(),
            bucket: bucket.to_string(),
            prefix: "prefix".to_string(),
            access_key: access_key.to_string(),
            secret_key: "secret".to_string(),
            tls_enabled: true,
            region: "us-east-1".to_string(),
        }
    }

    #[test]
    fn identical_credentials_share_a_key() {
        let a = S3ClientKey::for_spec(&spec("http://localhost:9000", "AK")).unwrap();
        let b = S3ClientKey::for_spec(&spec("http://localhost:9000", "AK")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn key_ignores_bucket_so_different_buckets_share_one_client() {
        // spec.md §3: the key hashes (endpoint, access_key, secret_key,
        // tls_enabled, region) only — bucket is deliberately excluded so two
        // destinations pointed at different buckets on the same
        // account/endpoint still dedupe to one connection.
        let a = S3ClientKey::for_spec(&spec_with_bucket("http://localhost:9000", "AK", "bucket-a")).unwrap();
        let b = S3ClientKey::for_spec(&spec_with_bucket("http://localhost:9000", "AK", "bucket-b")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_credentials_have_different_keys() {
        let a = S3ClientKey::for_spec(&spec("http://localhost:9000", "AK1")).unwrap();
        let b = S3ClientKey::for_spec(&spec("http://localhost:9000", "AK2")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn non_s3_spec_has_no_key() {
        let fs_spec = DestinationSpec::Filesystem { base_path: PathBuf::from("/tmp") };
        assert!(S3ClientKey::for_spec(&fs_spec).is_none());
    }
}
