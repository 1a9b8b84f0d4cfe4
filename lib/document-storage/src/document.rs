//! Identity traits for stored documents.
//!
//! Types implementing `Document` can be stored in any engine that implements
//! [`DocumentBackend`](crate::DocumentBackend). Add
//! `#[document(collection = "...")]` and a `#[key]` field to a
//! `#[derive(Document)]` type to generate the implementation.

use std::fmt::Debug;
use std::hash::Hash;

use uuid::Uuid;

/// An identifier for a stored document.
///
/// Engines address documents by [`storage_id`](Key::storage_id), so two keys
/// that compare equal must produce the same storage id.
pub trait Key: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// The string form the engine stores and looks the document up by.
    fn storage_id(&self) -> String;

    /// Whether this key identifies nothing (e.g. an empty string).
    ///
    /// Lookups and removals with an empty key never reach the engine.
    fn is_empty(&self) -> bool {
        false
    }
}

impl Key for String {
    fn storage_id(&self) -> String {
        self.clone()
    }

    fn is_empty(&self) -> bool {
        String::is_empty(self)
    }
}

impl Key for Uuid {
    fn storage_id(&self) -> String {
        self.to_string()
    }

    fn is_empty(&self) -> bool {
        self.is_nil()
    }
}

macro_rules! integer_key {
    ($($t:ty),*) => {
        $(
            impl Key for $t {
                fn storage_id(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

integer_key!(i32, i64, u32, u64);

/// Trait for types that can be stored as documents.
///
/// Generated automatically by `#[derive(Document)]`.
///
/// # Example
///
/// ```text
/// #[derive(Clone, Serialize, Deserialize, Document)]
/// #[document(collection = "widgets")]
/// pub struct Widget {
///     #[key]
///     pub id: String,
///     pub name: String,
///     pub weight: i64,
/// }
/// ```
pub trait Document: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static {
    /// The key type identifying documents of this type.
    type Key: Key;

    /// The logical collection documents of this type are stored in.
    fn collection() -> &'static str;

    /// Extract the key. Must be deterministic and pure.
    fn key(&self) -> Self::Key;
}

/// Strategy producing fresh keys for new documents.
pub trait KeyGenerator<K: Key>: Send + Sync {
    /// Produce a new key for documents of type `T`.
    fn new_key_for<T: Document<Key = K>>(&self) -> Option<K> {
        self.new_key_for_type(std::any::type_name::<T>())
    }

    /// Produce a new key for a runtime type name.
    fn new_key_for_type(&self, type_name: &str) -> Option<K>;
}

/// Random 128-bit identifiers formatted as hyphenated strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomStringKeys;

impl KeyGenerator<String> for RandomStringKeys {
    fn new_key_for_type(&self, _type_name: &str) -> Option<String> {
        Some(Uuid::new_v4().to_string())
    }
}

/// Random version 4 UUID keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomUuidKeys;

impl KeyGenerator<Uuid> for RandomUuidKeys {
    fn new_key_for_type(&self, _type_name: &str) -> Option<Uuid> {
        Some(Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_keys() {
        assert!(Key::is_empty(&String::new()));
        assert!(!Key::is_empty(&"a".to_string()));
        assert!(Key::is_empty(&Uuid::nil()));
        assert!(!Key::is_empty(&7_i64));
    }

    #[test]
    fn test_random_string_keys_are_distinct_uuids() {
        let keys = RandomStringKeys;
        let a = keys.new_key_for_type("a").unwrap();
        let b = keys.new_key_for_type("a").unwrap();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }
}
