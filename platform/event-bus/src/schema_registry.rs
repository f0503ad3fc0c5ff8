//! Schema registry lookups for Avro-encoded envelopes
//!
//! The validator only needs to know whether a subject is registered; schema
//! bodies are the concern of the (de)serializer on either side of the broker.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

/// Subject under which the value schema of an event type is registered.
pub fn value_subject(event_type: &str) -> String {
    format!("{event_type}-value")
}

/// Read-only view of a schema registry
pub trait SchemaRegistry: Send + Sync {
    /// True when a schema is registered under `subject`.
    fn is_registered(&self, subject: &str) -> bool;
}

/// In-process registry, loaded at startup or populated by tests.
#[derive(Debug, Default)]
pub struct InMemorySchemaRegistry {
    subjects: RwLock<HashSet<String>>,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subject verbatim
    pub fn register(&self, subject: impl Into<String>) {
        if let Ok(mut subjects) = self.subjects.write() {
            subjects.insert(subject.into());
        }
    }

    /// Register the value schema subject of an event type
    pub fn register_event_type(&self, event_type: &str) {
        self.register(value_subject(event_type));
    }

    pub fn unregister(&self, subject: &str) -> bool {
        self.subjects
            .write()
            .map(|mut subjects| subjects.remove(subject))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.subjects.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load every `*.avsc` file in `schema_dir`; the file stem is the subject
    /// (e.g. `thing.created-value.avsc`).
    pub fn load_from_dir(schema_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let registry = Self::new();
        for entry in fs::read_dir(schema_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("avsc") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                registry.register(stem);
            }
        }
        tracing::info!(subjects = registry.len(), "schema registry loaded");
        Ok(registry)
    }
}

impl SchemaRegistry for InMemorySchemaRegistry {
    fn is_registered(&self, subject: &str) -> bool {
        self.subjects
            .read()
            .map(|subjects| subjects.contains(subject))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_event_type_uses_value_subject() {
        let registry = InMemorySchemaRegistry::new();
        registry.register_event_type("y.created");
        assert!(registry.is_registered("y.created-value"));
        assert!(!registry.is_registered("y.created"));
    }

    #[test]
    fn test_unregister() {
        let registry = InMemorySchemaRegistry::new();
        registry.register("a.b-value");
        assert!(registry.unregister("a.b-value"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_from_dir_only_reads_avsc() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("thing.created-value.avsc"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = InMemorySchemaRegistry::load_from_dir(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.is_registered("thing.created-value"));
    }
}
