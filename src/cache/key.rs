//! Cache key construction and hashing.

use sha2::{Digest, Sha256};

use crate::value::Params;

/// An immutable `(plugin_name, operation, parameters)` triple plus its
/// derived 256-bit content hash. Equality and hashing are defined solely on
/// the hash, per the data model: two keys built from semantically equal
/// parameter mappings are bit-identical regardless of insertion order,
/// because [`Params`] is a `BTreeMap` and [`crate::value::Value::canonical_bytes`]
/// renders deterministically.
#[derive(Clone, Debug)]
pub struct CacheKey {
    pub plugin_name: String,
    pub operation: String,
    pub parameters: Params,
    hash: [u8; 32],
}

impl CacheKey {
    pub fn new(plugin_name: impl Into<String>, operation: impl Into<String>, parameters: Params) -> Self {
        let plugin_name = plugin_name.into();
        let operation = operation.into();
        let hash = Self::compute_hash(&plugin_name, &operation, &parameters);
        CacheKey {
            plugin_name,
            operation,
            parameters,
            hash,
        }
    }

    fn compute_hash(plugin_name: &str, operation: &str, parameters: &Params) -> [u8; 32] {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(plugin_name.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(operation.as_bytes());
        bytes.push(0);
        crate::value::Value::Map(parameters.clone()).canonical_bytes(&mut bytes);

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.finalize().into()
    }

    /// The 32-byte SHA-256 digest of the canonicalized triple.
    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }

    /// Lowercase hex rendition of [`CacheKey::hash`], used as the on-disk
    /// file stem (`<cache_dir>/<hex_sha256>.cache`).
    pub fn hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Combined `"plugin:operation"` key used for per-operation overrides.
    pub fn plugin_operation(&self) -> String {
        format!("{}:{}", self.plugin_name, self.operation)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}
impl Eq for CacheKey {}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}
