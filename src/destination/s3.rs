use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use super::DestinationAdapter;
use crate::config::DestinationSpec;
use crate::error::{AdapterError, ErrorKind};
use crate::s3_cache::{S3ClientCache, SharedS3Client};

/// One S3 destination: a client shared (by endpoint/credentials/region) with
/// any other destination pointed at the same account, paired with this
/// destination's own bucket/prefix. The bucket and prefix are *not* part of
/// the cache key (spec.md §3) — two `S3Adapter`s can share one
/// `SharedS3Client` while writing to entirely different buckets.
pub struct S3Adapter {
    client: Arc<SharedS3Client>,
    bucket: String,
    prefix: String,
    spec_describe: String,
}

impl S3Adapter {
    pub fn new(spec: DestinationSpec, cache: Arc<S3ClientCache>) -> Result<Self, AdapterError> {
        let describe = spec.describe();
        let DestinationSpec::S3 { bucket, prefix, .. } = &spec else {
            return Err(AdapterError::new(ErrorKind::ConfigInvalid, "not an s3 destination"));
        };
        let bucket = sanitize_bucket_name(bucket);
        let prefix = prefix.clone();
        let client = cache.acquire(&spec)?;
        Ok(S3Adapter { client, bucket, prefix, spec_describe: describe })
    }

    fn key_for(&self, rel_path: &str) -> String {
        let rel = super::normalize_separators(rel_path);
        if self.prefix.is_empty() {
            rel
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), rel)
        }
    }
}

/// Sanitise a bucket name per spec.md §4.A: lowercase, `_`/space -> `-`,
/// strip anything outside `[a-z0-9-]`.
fn sanitize_bucket_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c == '_' || c == ' ' { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

impl DestinationAdapter for S3Adapter {
    fn ensure(&self) -> Result<(), AdapterError> {
        let exists = self
            .client
            .block_on(self.client.client.head_bucket().bucket(&self.bucket).send())
            .is_ok();
        if exists {
            return Ok(());
        }
        self.client
            .block_on(self.client.client.create_bucket().bucket(&self.bucket).send())
            .map(|_| ())
            .or_else(|e| {
                // Another concurrent `ensure` may have created it first.
                let msg = e.to_string();
                if msg.contains("BucketAlreadyOwnedByYou") || msg.contains("BucketAlreadyExists") {
                    debug!(bucket = %self.bucket, "bucket already exists, treating as success");
                    Ok(())
                } else {
                    Err(AdapterError::new(ErrorKind::NetTransient, format!("create_bucket failed: {msg}")))
                }
            })
    }

    fn put(&self, source_path: &Path, rel_path: &str) -> Result<(), AdapterError> {
        let key = self.key_for(rel_path);
        let body = self
            .client
            .runtime
            .block_on(aws_sdk_s3::primitives::ByteStream::from_path(source_path))
            .map_err(|e| AdapterError::new(ErrorKind::IntegrityRead, format!("reading {}: {}", source_path.display(), e)))?;
        let content_type = super::content_type_for(&key);
        self.client
            .block_on(
                self.client
                    .client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .content_type(content_type)
                    .body(body)
                    .send(),
            )
            .map(|_| ())
            .map_err(|e| classify_sdk_error(&e.to_string()))
    }

    fn delete(&self, rel_path: &str) -> Result<(), AdapterError> {
        let key = self.key_for(rel_path);
        match self.client.block_on(self.client.client.delete_object().bucket(&self.bucket).key(&key).send()) {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = classify_sdk_error(&e.to_string());
                if err.is_not_found() { Ok(()) } else { Err(err) }
            }
        }
    }

    fn describe(&self) -> String {
        self.spec_describe.clone()
    }
}

fn classify_sdk_error(message: &str) -> AdapterError {
    let kind = if message.contains("NoSuchKey") || message.contains("NotFound") || message.contains("404") {
        ErrorKind::IoNotFound
    } else if message.contains("AccessDenied") || message.contains("InvalidAccessKeyId") || message.contains("SignatureDoesNotMatch") {
        ErrorKind::Auth
    } else if message.contains("timed out") || message.contains("timeout") || message.contains("connect") {
        ErrorKind::NetTransient
    } else {
        ErrorKind::PermanentOther
    };
    AdapterError::new(kind, message.to_string())
}
