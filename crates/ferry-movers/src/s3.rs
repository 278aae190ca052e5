//! S3 mover over `object_store`.
//!
//! The bucket is the destination host; connection parameters from the chain
//! config become builder options. A trailing `/` in the destination path
//! appends the source basename; without it the path is the object key.

use std::path::Path;

use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;
use serde_json::Value;
use url::Url;

use crate::{MoverError, Mover, Params};

pub struct S3Mover;

impl Mover for S3Mover {
    fn copy(
        &self,
        origin: &Path,
        destination: &Url,
        params: &Params,
        _backup_targets: &[String],
    ) -> Result<Url, MoverError> {
        let bucket = destination
            .host_str()
            .ok_or_else(|| MoverError::Transfer("s3 destination has no bucket".into()))?;
        let key = object_key(origin, destination)?;

        let store = build_store(bucket, params)?;
        let bytes = std::fs::read(origin)?;
        let path = object_store::path::Path::from(key.as_str());

        block_on(async move {
            store
                .put(&path, bytes.into())
                .await
                .map_err(|e| MoverError::Transfer(format!("s3 put: {e}")))
        })?;
        Ok(destination.clone())
    }
}

fn object_key(origin: &Path, destination: &Url) -> Result<String, MoverError> {
    let path = destination.path();
    let trimmed = path.trim_start_matches('/');
    if !path.ends_with('/') && !trimmed.is_empty() {
        return Ok(trimmed.to_owned());
    }
    let name = origin
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| MoverError::Transfer("origin has no usable name".into()))?;
    if trimmed.is_empty() {
        Ok(name.to_owned())
    } else {
        Ok(format!("{}{}", trimmed, name))
    }
}

fn build_store(bucket: &str, params: &Params) -> Result<impl ObjectStore, MoverError> {
    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
    for (key, value) in flatten(params) {
        builder = match (key.as_str(), value) {
            ("endpoint_url", Value::String(v)) => builder.with_endpoint(v),
            ("key", Value::String(v)) => builder.with_access_key_id(v),
            ("secret", Value::String(v)) => builder.with_secret_access_key(v),
            ("token", Value::String(v)) => builder.with_token(v),
            ("region", Value::String(v)) => builder.with_region(v),
            ("allow_http", Value::Bool(v)) => builder.with_allow_http(v),
            _ => builder,
        };
    }
    builder
        .build()
        .map_err(|e| MoverError::Connect(bucket.to_owned(), e.to_string()))
}

/// Flatten nested parameter maps (`client_kwargs.endpoint_url` and friends)
/// into leaf key/value pairs.
fn flatten(params: &Params) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    for (key, value) in params {
        match value {
            Value::Object(nested) => out.extend(flatten(nested)),
            other => out.push((key.clone(), other.clone())),
        }
    }
    out
}

/// Run an object-store future from blocking mover context.
fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.block_on(fut),
        Err(_) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("building fallback runtime")
            .block_on(fut),
    }
}
