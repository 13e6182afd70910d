//! Typed access to the GGUF key-value section

use crate::error::{Error, Result};
use crate::formats::gguf::MetadataValue;
use std::collections::BTreeMap;

/// Immutable metadata map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelMetadata {
    entries: BTreeMap<String, MetadataValue>,
}

impl ModelMetadata {
    /// Build from parsed entries; a repeated key is a format error
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, MetadataValue)>,
    {
        let mut map = BTreeMap::new();
        for (key, value) in entries {
            if map.contains_key(&key) {
                return Err(Error::Format(format!("Duplicate metadata key: {}", key)));
            }
            map.insert(key, value);
        }
        Ok(Self { entries: map })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn require(&self, key: &str) -> Result<&MetadataValue> {
        self.get(key)
            .ok_or_else(|| Error::Format(format!("Missing required metadata key: {}", key)))
    }

    /// `general.architecture`
    pub fn architecture(&self) -> Result<&str> {
        self.require_str("general.architecture")
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get(key)
            .map(|v| v.as_u64().ok_or_else(|| mismatch(key, "unsigned integer", v)))
            .transpose()
    }

    pub fn get_usize(&self, key: &str) -> Result<Option<usize>> {
        self.get_u64(key)?
            .map(|v| {
                usize::try_from(v)
                    .map_err(|_| Error::Format(format!("{} = {} overflows usize", key, v)))
            })
            .transpose()
    }

    pub fn get_f32(&self, key: &str) -> Result<Option<f32>> {
        self.get(key)
            .map(|v| v.as_f64().map(|f| f as f32).ok_or_else(|| mismatch(key, "number", v)))
            .transpose()
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        self.get(key).map(|v| v.as_str().ok_or_else(|| mismatch(key, "string", v))).transpose()
    }

    pub fn get_array(&self, key: &str) -> Result<Option<&[MetadataValue]>> {
        self.get(key).map(|v| v.as_array().ok_or_else(|| mismatch(key, "array", v))).transpose()
    }

    pub fn require_usize(&self, key: &str) -> Result<usize> {
        self.get_usize(key)?
            .ok_or_else(|| Error::Format(format!("Missing required metadata key: {}", key)))
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key)?
            .ok_or_else(|| Error::Format(format!("Missing required metadata key: {}", key)))
    }
}

fn mismatch(key: &str, expected: &str, found: &MetadataValue) -> Error {
    Error::Format(format!(
        "Metadata key '{}' should be a {}, found {:?}",
        key,
        expected,
        found.value_type()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModelMetadata {
        ModelMetadata::from_entries(vec![
            ("general.architecture".to_string(), MetadataValue::String("llama".into())),
            ("llama.block_count".to_string(), MetadataValue::U32(2)),
            ("llama.rope.freq_base".to_string(), MetadataValue::F32(500000.0)),
            ("signed".to_string(), MetadataValue::I32(-4)),
        ])
        .unwrap()
    }

    #[test]
    fn test_integer_widths_coerce() {
        let meta = sample();
        assert_eq!(meta.get_usize("llama.block_count").unwrap(), Some(2));
        assert_eq!(meta.get_f32("llama.block_count").unwrap(), Some(2.0));
        assert_eq!(meta.get_u64("missing").unwrap(), None);
    }

    #[test]
    fn test_type_mismatch_is_format_error() {
        let meta = sample();
        assert!(matches!(meta.get_u64("general.architecture"), Err(Error::Format(_))));
        assert!(matches!(meta.get_u64("signed"), Err(Error::Format(_))));
        assert!(matches!(meta.get_str("llama.block_count"), Err(Error::Format(_))));
    }

    #[test]
    fn test_require_reports_key() {
        let err = sample().require_usize("llama.embedding_length").unwrap_err();
        assert!(err.to_string().contains("llama.embedding_length"));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let dup = ModelMetadata::from_entries(vec![
            ("a".to_string(), MetadataValue::U8(1)),
            ("a".to_string(), MetadataValue::U8(2)),
        ]);
        assert!(matches!(dup, Err(Error::Format(_))));
    }
}
