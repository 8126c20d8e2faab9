use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::backends::{MemoryBackend, StorageBackend};

/// JSON key/value store that never fails towards its caller.
///
/// Writes report success as a `bool`, reads return `None` for anything that
/// cannot be produced (missing, unreadable, corrupt). Every failure is
/// logged. Clone is cheap; clones share the same backend.
#[derive(Clone)]
pub struct PersistentStore {
    backend: Arc<dyn StorageBackend>,
}

impl PersistentStore {
    pub fn new(backend: impl StorageBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn from_shared(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Store backed by process memory only.
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    pub fn set_item<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let encoded = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(e) => {
                warn!(key, error = %e, "Failed to encode storage value");
                return false;
            }
        };

        match self.backend.write(key, &encoded) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Failed to write storage value");
                false
            }
        }
    }

    /// Read and decode a value.
    ///
    /// Values that are not valid JSON are retried as a bare string so plain
    /// strings written by older app versions still load. A slot that decodes
    /// neither way is corrupt and gets purged.
    pub fn get_item<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_raw(key)?;

        match serde_json::from_str::<T>(&raw) {
            Ok(value) => Some(value),
            Err(json_err) => match serde_json::from_value::<T>(serde_json::Value::String(raw)) {
                Ok(value) => {
                    debug!(key, "Loaded legacy plain-string value");
                    Some(value)
                }
                Err(_) => {
                    warn!(key, error = %json_err, "Discarding corrupt storage value");
                    self.remove_item(key);
                    None
                }
            },
        }
    }

    pub fn remove_item(&self, key: &str) -> bool {
        match self.backend.delete(key) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Failed to remove storage value");
                false
            }
        }
    }

    /// Undecoded contents of a slot.
    pub fn get_raw(&self, key: &str) -> Option<String> {
        match self.backend.read(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Failed to read storage value");
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get_raw(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        age: u32,
        tags: Vec<String>,
    }

    /// Backend whose every operation fails, like a disabled or full medium.
    struct BrokenBackend;

    impl StorageBackend for BrokenBackend {
        fn read(&self, _key: &str) -> anyhow::Result<Option<String>> {
            Err(anyhow!("storage disabled"))
        }
        fn write(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            Err(anyhow!("quota exceeded"))
        }
        fn delete(&self, _key: &str) -> anyhow::Result<()> {
            Err(anyhow!("storage disabled"))
        }
    }

    #[test]
    fn test_set_then_get_returns_equal_value() {
        let store = PersistentStore::in_memory();
        let profile = Profile {
            name: "Ana".to_string(),
            age: 51,
            tags: vec!["sleep".to_string(), "hot-flushes".to_string()],
        };

        assert!(store.set_item("profile", &profile));
        assert_eq!(store.get_item::<Profile>("profile"), Some(profile));

        assert!(store.set_item("n", &42u64));
        assert_eq!(store.get_item::<u64>("n"), Some(42));

        let value = serde_json::json!({"a": [1, 2, {"b": null}]});
        assert!(store.set_item("v", &value));
        assert_eq!(store.get_item::<serde_json::Value>("v"), Some(value));
    }

    #[test]
    fn test_get_missing_key() {
        let store = PersistentStore::in_memory();
        assert_eq!(store.get_item::<String>("nope"), None);
        assert!(!store.contains("nope"));
    }

    #[test]
    fn test_legacy_plain_string_is_readable() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write("theme", "dark").unwrap();
        let store = PersistentStore::from_shared(backend);

        assert_eq!(store.get_item::<String>("theme"), Some("dark".to_string()));
    }

    #[test]
    fn test_corrupt_value_is_purged() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write("profile", "{not json").unwrap();
        let store = PersistentStore::from_shared(backend.clone());

        assert_eq!(store.get_item::<Profile>("profile"), None);
        assert_eq!(backend.read("profile").unwrap(), None);
    }

    #[test]
    fn test_broken_backend_never_errors() {
        let store = PersistentStore::new(BrokenBackend);

        assert!(!store.set_item("k", &"v"));
        assert_eq!(store.get_item::<String>("k"), None);
        assert_eq!(store.get_raw("k"), None);
        assert!(!store.remove_item("k"));
    }

    #[test]
    fn test_clones_share_backend() {
        let store = PersistentStore::in_memory();
        let other = store.clone();

        store.set_item("k", &1u8);
        assert_eq!(other.get_item::<u8>("k"), Some(1));

        other.remove_item("k");
        assert!(!store.contains("k"));
    }
}
