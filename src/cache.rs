//! Identification results keyed by image fingerprint.
//!
//! Bounded by capacity; when full, the oldest inserted fingerprint is evicted.
//! A capacity of zero disables caching entirely.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use partscan_core::models::IdentifiedItem;

#[derive(Debug, Default)]
struct Entries {
    items: HashMap<String, Vec<IdentifiedItem>>,
    order: VecDeque<String>,
}

#[derive(Debug)]
pub struct FingerprintCache {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl FingerprintCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<Vec<IdentifiedItem>> {
        let entries = self.entries.lock().ok()?;
        entries.items.get(fingerprint).cloned()
    }

    pub fn insert(&self, fingerprint: &str, items: Vec<IdentifiedItem>) {
        if self.capacity == 0 {
            return;
        }
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };

        if entries.items.insert(fingerprint.to_string(), items).is_none() {
            entries.order.push_back(fingerprint.to_string());
        }
        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.items.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
