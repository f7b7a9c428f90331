//! Cache key construction and project context digests

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Deterministic digest of normalized project context
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextHash(String);

impl ContextHash {
    /// Digest of a framework/tool version tag
    pub fn of_version(tag: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"version\0");
        hasher.update(tag.trim().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The parts of a project that change what an analysis would conclude
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    /// Normalized path -> content signature (hash, mtime, size...)
    pub files: BTreeMap<String, String>,
    pub tool_version: Option<String>,
    pub config: BTreeMap<String, String>,
}

impl ProjectContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl AsRef<str>, signature: impl Into<String>) -> Self {
        self.files
            .insert(normalize_path(path.as_ref()), signature.into());
        self
    }

    pub fn with_tool_version(mut self, version: impl Into<String>) -> Self {
        self.tool_version = Some(version.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.tool_version.is_none() && self.config.is_empty()
    }

    /// Same context always yields the same hash; any change yields a new one
    pub fn hash(&self) -> ContextHash {
        let mut hasher = Sha256::new();

        hasher.update(b"files\0");
        for (path, signature) in &self.files {
            // Paths inserted directly into the map may not be normalized yet
            hasher.update(normalize_path(path).as_bytes());
            hasher.update(b"\0");
            hasher.update(signature.trim().as_bytes());
            hasher.update(b"\n");
        }

        hasher.update(b"tool\0");
        if let Some(version) = &self.tool_version {
            hasher.update(version.trim().as_bytes());
        }
        hasher.update(b"\n");

        hasher.update(b"config\0");
        for (key, value) in &self.config {
            hasher.update(key.trim().as_bytes());
            hasher.update(b"\0");
            hasher.update(value.trim().as_bytes());
            hasher.update(b"\n");
        }

        ContextHash(hex::encode(hasher.finalize()))
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    let mut normalized = path.as_str();
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest;
    }
    normalized.to_string()
}

/// Collapse runs of whitespace so formatting noise doesn't split cache entries
fn collapse_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut last_was_space = false;

    for c in text.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                result.push(' ');
                last_was_space = true;
            }
        } else {
            result.push(c);
            last_was_space = false;
        }
    }

    result.trim().to_string()
}

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

/// Key of an entry within one cache tier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    key: String,
    context_hash: Option<ContextHash>,
}

impl CacheKey {
    /// Spec digest combined with the project context
    pub fn analysis(spec: &str, context: &ContextHash) -> Self {
        let digest = sha256_hex(&[collapse_whitespace(spec).as_bytes()]);
        Self {
            key: format!("{}.{}", digest, context),
            context_hash: Some(context.clone()),
        }
    }

    /// Command + arguments digest combined with the framework version tag
    pub fn command<A: AsRef<str>>(name: &str, args: &[A], version: &str) -> Self {
        let mut parts: Vec<&[u8]> = vec![name.trim().as_bytes()];
        parts.extend(args.iter().map(|a| a.as_ref().as_bytes()));
        let digest = sha256_hex(&parts);
        let version_hash = ContextHash::of_version(version);
        Self {
            key: format!("{}.{}", digest, version_hash),
            context_hash: Some(version_hash),
        }
    }

    /// Capability query digest; no context
    pub fn capability(query: &str) -> Self {
        Self {
            key: sha256_hex(&[collapse_whitespace(query).as_bytes()]),
            context_hash: None,
        }
    }

    /// A key used verbatim
    pub fn raw(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            context_hash: None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn context_hash(&self) -> Option<&ContextHash> {
        self.context_hash.as_ref()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}
