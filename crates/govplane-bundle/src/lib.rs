// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON, revision hashing, and tar.gz archive construction for
//! policy bundles.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::io::Write;

use chrono::{DateTime, Utc};
use govplane_model::{BundleManifest, BundleManifestMetadata, BundleMetadata, PolicyDocument};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Errors raised while building a bundle.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// The policy document could not be converted to JSON.
    #[error("serializing policy document: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The tar/gzip archive could not be written.
    #[error("writing archive: {0}")]
    Archive(#[from] std::io::Error),
}

/// A freshly built bundle: the gzip-compressed tar bytes, its ETag, and the
/// revision identifier embedded in that ETag.
#[derive(Debug, Clone)]
pub struct BuiltBundle {
    /// Gzip-compressed tar archive containing `data.json` and `.manifest`.
    pub bytes: Vec<u8>,
    /// `"<revision>"`, including the surrounding quotes.
    pub etag: String,
    /// First 16 hex characters of the SHA-256 of the canonical, pre-metadata document.
    pub revision: String,
}

/// A value tree that always serializes object keys in sorted order,
/// independent of whether some other dependency in the build enables
/// `serde_json`'s `preserve_order` feature on `serde_json::Map`.
#[derive(Serialize)]
#[serde(untagged)]
enum CanonicalValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<CanonicalValue>),
    Object(BTreeMap<String, CanonicalValue>),
}

impl CanonicalValue {
    fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => CanonicalValue::Null,
            serde_json::Value::Bool(b) => CanonicalValue::Bool(*b),
            serde_json::Value::Number(n) => CanonicalValue::Number(n.clone()),
            serde_json::Value::String(s) => CanonicalValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                CanonicalValue::Array(items.iter().map(CanonicalValue::from_json).collect())
            }
            serde_json::Value::Object(map) => CanonicalValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), CanonicalValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Serialize `value` as canonical JSON: object keys sorted lexicographically,
/// no insignificant whitespace, UTF-8.
pub fn canonical_json(value: &serde_json::Value) -> Result<String, BundleError> {
    Ok(serde_json::to_string(&CanonicalValue::from_json(value))?)
}

/// SHA-256 the canonical JSON and take the first 16 hex characters.
pub fn compute_revision(canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    let hex = format!("{digest:x}");
    hex[..16].to_string()
}

/// Build the served bundle archive from a policy document.
///
/// The revision is computed over the document *before* `_bundle_metadata` is
/// injected, so a rebuild that observes identical upstream data produces an
/// unchanged revision regardless of `built_at` or `sse_event_id` churn.
pub fn build_bundle(
    document: &PolicyDocument,
    built_at: DateTime<Utc>,
    last_event_id: Option<&str>,
) -> Result<BuiltBundle, BundleError> {
    let mut pre_metadata = document.clone();
    pre_metadata.bundle_metadata = None;

    let hashed_value = serde_json::to_value(&pre_metadata)?;
    let canonical = canonical_json(&hashed_value)?;
    let revision = compute_revision(&canonical);

    let roots: Vec<String> = match &hashed_value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            keys
        }
        _ => Vec::new(),
    };

    let mut with_metadata = pre_metadata;
    with_metadata.bundle_metadata = Some(BundleMetadata {
        built_at,
        revision: revision.clone(),
        sse_event_id: last_event_id.map(str::to_string),
    });
    let archive_value = serde_json::to_value(&with_metadata)?;
    let data_json = canonical_json(&archive_value)?;

    let manifest = BundleManifest {
        revision: revision.clone(),
        roots,
        metadata: BundleManifestMetadata { built_at },
    };
    let manifest_json = canonical_json(&serde_json::to_value(&manifest)?)?;

    let bytes = write_archive(data_json.as_bytes(), manifest_json.as_bytes())?;
    let etag = format!("\"{revision}\"");

    Ok(BuiltBundle { bytes, etag, revision })
}

fn write_archive(data_json: &[u8], manifest_json: &[u8]) -> Result<Vec<u8>, BundleError> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    append_entry(&mut builder, "data.json", data_json)?;
    append_entry(&mut builder, ".manifest", manifest_json)?;

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    contents: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, contents)
}
