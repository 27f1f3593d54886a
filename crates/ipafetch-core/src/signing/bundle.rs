//! Signature bundle loading and metadata encoding

use crate::error::IpaError;
use base64::Engine;
use ipafetch_types::{BundleFile, SignatureBundle};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::debug;

/// Metadata keys that carry the purchasing account identifier
pub const ACCOUNT_KEYS: [&str; 3] = ["apple-id", "appleId", "userName"];

/// Signature id used for the main app binary
const PRIMARY_SINF_ID: u64 = 0;

/// Read a [`BundleFile`] from JSON on disk and convert it
pub async fn load_bundle(path: &Path) -> Result<SignatureBundle, IpaError> {
    let content = tokio::fs::read(path).await?;
    let file: BundleFile = serde_json::from_slice(&content)
        .map_err(|e| IpaError::Serialization(format!("{:?}: {}", path, e)))?;
    bundle_from_file(file)
}

/// Pick the primary signature, decode it and merge the account into the metadata
pub fn bundle_from_file(file: BundleFile) -> Result<SignatureBundle, IpaError> {
    let sinf = file
        .sinfs
        .iter()
        .find(|sinf| sinf.id == PRIMARY_SINF_ID)
        .ok_or_else(|| {
            IpaError::InvalidSignature(format!("no signature with id {}", PRIMARY_SINF_ID))
        })?;

    let encoded: String = sinf.sinf.chars().filter(|c| !c.is_whitespace()).collect();
    let signature = base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| IpaError::InvalidSignature(format!("signature is not base64: {}", e)))?;
    if signature.is_empty() {
        return Err(IpaError::InvalidSignature("signature is empty".to_string()));
    }

    let mut metadata = file.metadata;
    if let Some(account) = file.account.as_deref() {
        merge_account(&mut metadata, account);
    }

    debug!(
        "Loaded signature bundle: {} metadata keys, {} signature bytes",
        metadata.len(),
        signature.len()
    );

    Ok(SignatureBundle {
        metadata,
        signature,
        expected_checksum: file.md5.filter(|sum| !sum.trim().is_empty()),
    })
}

/// Record `account` under every recognized account key
pub fn merge_account(metadata: &mut Map<String, Value>, account: &str) {
    for key in ACCOUNT_KEYS {
        metadata.insert(key.to_string(), Value::String(account.to_string()));
    }
}

/// Encode metadata as an XML property list
///
/// JSON `null` values have no plist counterpart and are dropped.
pub fn metadata_plist(metadata: &Map<String, Value>) -> Result<Vec<u8>, IpaError> {
    let mut out = Vec::new();
    plist::Value::Dictionary(to_plist_dict(metadata)).to_writer_xml(&mut out)?;
    Ok(out)
}

fn to_plist_dict(map: &Map<String, Value>) -> plist::Dictionary {
    let mut dict = plist::Dictionary::new();
    for (key, value) in map {
        if let Some(value) = to_plist(value) {
            dict.insert(key.clone(), value);
        }
    }
    dict
}

fn to_plist(value: &Value) -> Option<plist::Value> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(plist::Value::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(plist::Value::Integer(i.into()))
            } else if let Some(u) = n.as_u64() {
                Some(plist::Value::Integer(u.into()))
            } else {
                n.as_f64().map(plist::Value::Real)
            }
        }
        Value::String(s) => Some(plist::Value::String(s.clone())),
        Value::Array(items) => Some(plist::Value::Array(
            items.iter().filter_map(to_plist).collect(),
        )),
        Value::Object(map) => Some(plist::Value::Dictionary(to_plist_dict(map))),
    }
}
