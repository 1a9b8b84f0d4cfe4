#![allow(dead_code)]

use std::sync::Arc;

use document_storage::{DataStore, Document, StringDataStore};
use document_storage_memory::MemoryBackend;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Document)]
#[document(collection = "widgets")]
pub struct Widget {
    #[key]
    pub id: String,
    pub name: String,
    pub v: i64,
    pub tags: Vec<String>,
}

impl Widget {
    pub fn new(id: &str, name: &str, v: i64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            v,
            tags: Vec::new(),
        }
    }

    pub fn tagged(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }
}

pub fn store_over(backend: &Arc<MemoryBackend>) -> StringDataStore {
    DataStore::new(backend.clone())
}

/// A store holding one widget per value, with ids `w0`, `w1`, ... in order.
pub async fn seeded(values: &[i64]) -> (Arc<MemoryBackend>, StringDataStore) {
    let backend = Arc::new(MemoryBackend::new());
    let store = store_over(&backend);
    for (i, v) in values.iter().enumerate() {
        let widget = Widget::new(&format!("w{i}"), &format!("widget {i}"), *v);
        store.store_item(widget, None).await.unwrap();
    }
    (backend, store)
}

pub fn ids(widgets: &[Widget]) -> Vec<&str> {
    widgets.iter().map(|w| w.id.as_str()).collect()
}
