//! Object key mapping
//!
//! The uploader assigns both keys up front: the source key the upload lands
//! under and the derived key the processing pipeline will write. The derived
//! key travels with the session so that watchers never recompute it.

use crate::config::KeyConfig;
use serde::{Deserialize, Serialize};

/// Longest file-name extension carried over into generated keys
const MAX_EXTENSION_LEN: usize = 8;

/// Keys assigned to one upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKeys {
    pub source_key: String,
    pub derived_key: String,
}

/// Key mapping contract between uploader and processing pipeline
#[derive(Debug, Clone)]
pub struct KeyMapping {
    queue_prefix: String,
    processed_prefix: String,
    default_extension: String,
}

impl KeyMapping {
    pub fn new(config: &KeyConfig) -> Self {
        Self {
            queue_prefix: config.queue_prefix.clone(),
            processed_prefix: config.processed_prefix.clone(),
            default_extension: config.default_extension.to_ascii_lowercase(),
        }
    }

    /// Assign fresh keys for an upload of `file_name`
    ///
    /// The object name is a random UUID; only the extension of `file_name`
    /// survives, so user-supplied names never reach the key space.
    pub fn assign(&self, file_name: Option<&str>) -> ObjectKeys {
        let id = uuid::Uuid::new_v4();
        let ext = file_name
            .and_then(extension_of)
            .unwrap_or_else(|| self.default_extension.clone());
        let name = format!("{}.{}", id, ext);

        ObjectKeys {
            source_key: format!("{}{}", self.queue_prefix, name),
            derived_key: format!("{}{}", self.processed_prefix, name),
        }
    }

    /// Derived key for a source key under the queue prefix
    ///
    /// Only used for keys this mapping did not assign itself (CLI watches on
    /// a bare source key). Returns `None` for keys outside the queue prefix.
    pub fn derive(&self, source_key: &str) -> Option<String> {
        source_key
            .strip_prefix(&self.queue_prefix)
            .filter(|name| !name.is_empty())
            .map(|name| format!("{}{}", self.processed_prefix, name))
    }

    pub fn queue_prefix(&self) -> &str {
        &self.queue_prefix
    }

    pub fn processed_prefix(&self) -> &str {
        &self.processed_prefix
    }
}

impl Default for KeyMapping {
    fn default() -> Self {
        Self::new(&KeyConfig::default())
    }
}

fn extension_of(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty()
        || ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_shares_object_name() {
        let keys = KeyMapping::default().assign(Some("Holiday.MOV"));

        let source_name = keys.source_key.strip_prefix("queue/").unwrap();
        let derived_name = keys.derived_key.strip_prefix("processed/").unwrap();
        assert_eq!(source_name, derived_name);
        assert!(source_name.ends_with(".mov"));
    }

    #[test]
    fn test_assign_falls_back_to_default_extension() {
        let mapping = KeyMapping::default();
        assert!(mapping.assign(None).source_key.ends_with(".mp4"));
        assert!(mapping.assign(Some("clip")).source_key.ends_with(".mp4"));
        assert!(mapping.assign(Some(".hidden")).source_key.ends_with(".mp4"));
        assert!(mapping
            .assign(Some("clip.tar/../../x"))
            .source_key
            .ends_with(".mp4"));
        assert!(mapping
            .assign(Some("clip.averyverylongext"))
            .source_key
            .ends_with(".mp4"));
    }

    #[test]
    fn test_assign_is_unique() {
        let mapping = KeyMapping::default();
        let a = mapping.assign(Some("a.mp4"));
        let b = mapping.assign(Some("a.mp4"));
        assert_ne!(a.source_key, b.source_key);
    }

    #[test]
    fn test_derive() {
        let mapping = KeyMapping::default();
        assert_eq!(
            mapping.derive("queue/abc.mp4").as_deref(),
            Some("processed/abc.mp4")
        );
        assert_eq!(mapping.derive("other/abc.mp4"), None);
        assert_eq!(mapping.derive("queue/"), None);
    }
}
