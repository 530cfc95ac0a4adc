use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use ahash::AHashMap;

type CacheKey = (String, blake3::Hash);

struct Entry {
    vector: Vec<f32>,
    tick: u64,
}

#[derive(Default)]
struct LruState {
    entries: AHashMap<CacheKey, Entry>,
    /// tick -> key, oldest first
    recency: BTreeMap<u64, CacheKey>,
    next_tick: u64,
}

impl LruState {
    fn touch(&mut self, key: &CacheKey) -> Option<Vec<f32>> {
        let tick = self.next_tick;
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, key.clone());
        self.next_tick += 1;
        Some(entry.vector.clone())
    }
}

/// Least-recently-used vector cache keyed by model and content hash
pub struct EmbeddingCache {
    capacity: usize,
    state: Mutex<LruState>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LruState::default()),
        }
    }

    fn key(model: &str, text: &str) -> CacheKey {
        (model.to_string(), blake3::hash(text.as_bytes()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, model: &str, text: &str) -> Option<Vec<f32>> {
        if self.capacity == 0 {
            return None;
        }
        self.lock().touch(&Self::key(model, text))
    }

    pub fn insert(&self, model: &str, text: &str, vector: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        let key = Self::key(model, text);
        let mut state = self.lock();
        let tick = state.next_tick;
        state.next_tick += 1;

        if let Some(old) = state.entries.insert(key.clone(), Entry { vector, tick }) {
            state.recency.remove(&old.tick);
        }
        state.recency.insert(tick, key);

        while state.entries.len() > self.capacity {
            let Some((_, oldest)) = state.recency.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.recency.clear();
    }
}
