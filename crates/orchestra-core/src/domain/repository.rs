//! Document store traits for the Orchestra core
//!
//! Every persisted entity is a [`Document`] living in a named collection,
//! addressed by id, optionally by a unique business key and by any number of
//! non-unique secondary indexes. Stores keep a revision per document so
//! callers can perform compare-and-swap updates.

use async_trait::async_trait;

use crate::CoreError;

/// A persisted entity
pub trait Document: Clone + Send + Sync + 'static {
    /// Collection name
    const COLLECTION: &'static str;

    /// Name of the business key field, used in duplicate key errors
    const KEY_FIELD: &'static str = "domain";

    /// Document id
    fn id(&self) -> String;

    /// Unique business key, if the collection has one
    fn business_key(&self) -> Option<String> {
        None
    }

    /// Non-unique secondary index entries as `(index, value)` pairs
    fn indexes(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

/// A document together with its store revision
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// Incremented on every write
    pub revision: u64,
    /// The stored document
    pub document: T,
}

/// CRUD surface over one collection
#[async_trait]
pub trait DocumentRepository<T: Document>: Send + Sync {
    /// Find a document by id
    async fn find_by_id(&self, id: &str) -> Result<Option<Versioned<T>>, CoreError>;

    /// Find a document by its business key
    async fn find_by_business_key(&self, key: &str) -> Result<Option<Versioned<T>>, CoreError>;

    /// Documents whose business key (or id, if keyless) starts with `prefix`
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<T>, CoreError>;

    /// Every document, in insertion order
    async fn find_all(&self) -> Result<Vec<T>, CoreError>;

    /// Documents whose secondary index `index` holds `value`, in insertion order
    async fn find_by_index(&self, index: &str, value: &str) -> Result<Vec<T>, CoreError>;

    /// Insert a new document; fails with `DuplicateKey` on id or business key collision
    async fn insert(&self, document: &T) -> Result<u64, CoreError>;

    /// Insert or overwrite by id; fails with `DuplicateKey` if another document owns the business key
    async fn save(&self, document: &T) -> Result<u64, CoreError>;

    /// Overwrite only if the stored revision equals `expected`
    async fn replace_if_revision(&self, document: &T, expected: u64) -> Result<u64, CoreError>;

    /// Delete by id, returning whether a document was removed
    async fn delete(&self, id: &str) -> Result<bool, CoreError>;
}

/// Memory implementations
#[cfg(feature = "memory")]
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{PoisonError, RwLock};

    struct Slot<T> {
        sequence: u64,
        revision: u64,
        document: T,
    }

    struct Collection<T> {
        documents: HashMap<String, Slot<T>>,
        business_keys: HashMap<String, String>,
        indexes: HashMap<(String, String), HashSet<String>>,
        next_sequence: u64,
    }

    impl<T: Document> Collection<T> {
        fn duplicate(field: &str, value: &str) -> CoreError {
            CoreError::DuplicateKey {
                collection: T::COLLECTION.to_string(),
                field: field.to_string(),
                value: value.to_string(),
            }
        }

        fn check_business_key(&self, id: &str, key: Option<&str>) -> Result<(), CoreError> {
            match key.and_then(|k| self.business_keys.get(k).map(|owner| (k, owner))) {
                Some((key, owner)) if owner != id => Err(Self::duplicate(T::KEY_FIELD, key)),
                _ => Ok(()),
            }
        }

        fn store(&mut self, document: &T) -> u64 {
            let id = document.id();
            let key = document.business_key();

            let (sequence, revision, old_key, old_entries) = match self.documents.get(&id) {
                Some(slot) => (
                    slot.sequence,
                    slot.revision + 1,
                    slot.document.business_key(),
                    slot.document.indexes(),
                ),
                None => {
                    self.next_sequence += 1;
                    (self.next_sequence, 1, None, Vec::new())
                }
            };

            self.unindex(&id, old_entries);
            for (index, value) in document.indexes() {
                self.indexes
                    .entry((index.to_string(), value))
                    .or_default()
                    .insert(id.clone());
            }

            if let Some(old_key) = old_key {
                if Some(&old_key) != key.as_ref() {
                    self.business_keys.remove(&old_key);
                }
            }
            if let Some(key) = key {
                self.business_keys.insert(key, id.clone());
            }

            self.documents.insert(
                id,
                Slot {
                    sequence,
                    revision,
                    document: document.clone(),
                },
            );
            revision
        }

        fn unindex(&mut self, id: &str, entries: Vec<(&'static str, String)>) {
            for (index, value) in entries {
                let entry = (index.to_string(), value);
                if let Some(ids) = self.indexes.get_mut(&entry) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.indexes.remove(&entry);
                    }
                }
            }
        }

        fn versioned(slot: &Slot<T>) -> Versioned<T> {
            Versioned {
                revision: slot.revision,
                document: slot.document.clone(),
            }
        }

        fn ordered(&self) -> Vec<&Slot<T>> {
            let mut slots: Vec<&Slot<T>> = self.documents.values().collect();
            slots.sort_by_key(|slot| slot.sequence);
            slots
        }
    }

    /// In-memory document store for one collection
    ///
    /// A single lock guards documents and the business key index together so
    /// uniqueness checks and writes are atomic.
    pub struct MemoryDocumentRepository<T: Document> {
        inner: RwLock<Collection<T>>,
    }

    impl<T: Document> MemoryDocumentRepository<T> {
        /// Create an empty collection
        pub fn new() -> Self {
            Self {
                inner: RwLock::new(Collection {
                    documents: HashMap::with_capacity(64),
                    business_keys: HashMap::with_capacity(64),
                    indexes: HashMap::new(),
                    next_sequence: 0,
                }),
            }
        }

        /// Number of stored documents
        pub fn len(&self) -> usize {
            self.inner
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .documents
                .len()
        }

        /// Whether the collection is empty
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl<T: Document> Default for MemoryDocumentRepository<T> {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl<T: Document> DocumentRepository<T> for MemoryDocumentRepository<T> {
        async fn find_by_id(&self, id: &str) -> Result<Option<Versioned<T>>, CoreError> {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            Ok(inner.documents.get(id).map(Collection::versioned))
        }

        async fn find_by_business_key(&self, key: &str) -> Result<Option<Versioned<T>>, CoreError> {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            Ok(inner
                .business_keys
                .get(key)
                .and_then(|id| inner.documents.get(id))
                .map(Collection::versioned))
        }

        async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<T>, CoreError> {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            Ok(inner
                .ordered()
                .into_iter()
                .filter(|slot| {
                    let key = slot.document.business_key().unwrap_or_else(|| slot.document.id());
                    key.starts_with(prefix)
                })
                .map(|slot| slot.document.clone())
                .collect())
        }

        async fn find_all(&self) -> Result<Vec<T>, CoreError> {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            Ok(inner
                .ordered()
                .into_iter()
                .map(|slot| slot.document.clone())
                .collect())
        }

        async fn find_by_index(&self, index: &str, value: &str) -> Result<Vec<T>, CoreError> {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let Some(ids) = inner.indexes.get(&(index.to_string(), value.to_string())) else {
                return Ok(Vec::new());
            };
            let mut slots: Vec<&Slot<T>> = ids.iter().filter_map(|id| inner.documents.get(id)).collect();
            slots.sort_by_key(|slot| slot.sequence);
            Ok(slots.into_iter().map(|slot| slot.document.clone()).collect())
        }

        async fn insert(&self, document: &T) -> Result<u64, CoreError> {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let id = document.id();
            if inner.documents.contains_key(&id) {
                return Err(Collection::<T>::duplicate("id", &id));
            }
            if let Some(key) = document.business_key() {
                if inner.business_keys.contains_key(&key) {
                    return Err(Collection::<T>::duplicate(T::KEY_FIELD, &key));
                }
            }
            Ok(inner.store(document))
        }

        async fn save(&self, document: &T) -> Result<u64, CoreError> {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            inner.check_business_key(&document.id(), document.business_key().as_deref())?;
            Ok(inner.store(document))
        }

        async fn replace_if_revision(&self, document: &T, expected: u64) -> Result<u64, CoreError> {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let id = document.id();
            match inner.documents.get(&id) {
                None => return Err(CoreError::not_found(T::COLLECTION, id)),
                Some(slot) if slot.revision != expected => {
                    return Err(CoreError::ConcurrentModification(format!(
                        "{}/{} (expected revision {}, found {})",
                        T::COLLECTION,
                        id,
                        expected,
                        slot.revision
                    )));
                }
                Some(_) => {}
            }
            inner.check_business_key(&id, document.business_key().as_deref())?;
            Ok(inner.store(document))
        }

        async fn delete(&self, id: &str) -> Result<bool, CoreError> {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            match inner.documents.remove(id) {
                Some(slot) => {
                    if let Some(key) = slot.document.business_key() {
                        inner.business_keys.remove(&key);
                    }
                    inner.unindex(id, slot.document.indexes());
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

}
