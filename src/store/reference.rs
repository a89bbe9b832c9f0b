use std::{collections::HashMap, sync::RwLock};

use super::{ReferenceStore, StoreError};
use crate::digest::Digest;

/// [`ReferenceStore`] kept in memory.
#[derive(Default)]
pub struct MemoryReferenceStore {
    references: RwLock<HashMap<String, Digest>>,
}

impl MemoryReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All references, sorted by name.
    pub fn references(&self) -> Vec<(String, Digest)> {
        let references = self.references.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<_> = references
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    fn add(&self, reference: &str, id: &Digest, force: bool) -> Result<(), StoreError> {
        let mut references = self.references.write().unwrap_or_else(|e| e.into_inner());

        match references.get(reference) {
            Some(current) if current != id && !force => Err(StoreError::ReferenceConflict {
                reference: reference.to_owned(),
                current: current.clone(),
            }),

            _ => {
                references.insert(reference.to_owned(), id.clone());
                Ok(())
            }
        }
    }
}

impl ReferenceStore for MemoryReferenceStore {
    fn get(&self, reference: &str) -> Option<Digest> {
        let references = self.references.read().unwrap_or_else(|e| e.into_inner());
        references.get(reference).cloned()
    }

    fn add_tag(&self, reference: &str, id: &Digest, force: bool) -> Result<(), StoreError> {
        self.add(reference, id, force)
    }

    fn add_digest(&self, reference: &str, id: &Digest, force: bool) -> Result<(), StoreError> {
        self.add(reference, id, force)
    }
}

#[test]
fn replace_only_with_force() {
    let store = MemoryReferenceStore::new();
    let a = Digest::sha256(b"a");
    let b = Digest::sha256(b"b");

    store.add_tag("example.com/foo:1", &a, false).unwrap();
    store.add_tag("example.com/foo:1", &a, false).unwrap();

    assert!(matches!(
        store.add_tag("example.com/foo:1", &b, false),
        Err(StoreError::ReferenceConflict { .. })
    ));

    store.add_tag("example.com/foo:1", &b, true).unwrap();
    assert_eq!(store.get("example.com/foo:1"), Some(b));
    assert_eq!(store.references().len(), 1);
}
