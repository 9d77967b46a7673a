use indexmap::IndexMap;
use tracing::warn;

use crate::types::Value;

#[derive(Debug, Clone, Copy)]
struct IdInfo {
    id: u64,
    update_count: u64,
}

/// Keyed value store with stable per-key ids, update counters, hierarchical
/// child scopes, and close-on-eviction for resource-owning values.
///
/// A key's id is assigned on first insert and survives any number of updates
/// and renames; only the update counter changes on reassignment. Values with
/// a close capability are closed when replaced, removed, or when the cache is
/// cleared, closed, or dropped. Close failures are logged and swallowed.
#[derive(Debug, Default)]
pub struct ValueCache {
    values: IndexMap<String, Value>,
    infos: IndexMap<String, IdInfo>,
    children: IndexMap<String, ValueCache>,
    last_id: u64,
}

const CHILD_KEY_SUFFIX: &str = "._child";

fn child_key(key: &str) -> String {
    format!("{key}{CHILD_KEY_SUFFIX}")
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: Value) {
        let old_value = self.values.get(key).cloned();
        match self.infos.get_mut(key) {
            Some(info) => info.update_count += 1,
            None => {
                self.last_id += 1;
                self.infos.insert(
                    key.to_string(),
                    IdInfo {
                        id: self.last_id,
                        update_count: 0,
                    },
                );
            }
        }
        if let Some(old) = old_value {
            if old != value {
                close_value(key, &old);
            }
        }
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Remove the entry, closing its value and dropping its id.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let value = self.values.shift_remove(key)?;
        self.infos.shift_remove(key);
        close_value(key, &value);
        Some(value)
    }

    pub fn get_id(&self, key: &str) -> Option<u64> {
        self.infos.get(key).map(|info| info.id)
    }

    pub fn get_update_count(&self, key: &str) -> Option<u64> {
        self.infos.get(key).map(|info| info.update_count)
    }

    pub fn get_key(&self, id: u64) -> Option<&str> {
        self.infos
            .iter()
            .find(|(_, info)| info.id == id)
            .map(|(key, _)| key.as_str())
    }

    pub fn get_value_by_id(&self, id: u64) -> Option<&Value> {
        self.get_key(id).and_then(|key| self.values.get(key))
    }

    /// The nested cache scoped under `key`, created on first access. Child
    /// caches have no id of their own and are closed with their parent.
    pub fn child(&mut self, key: &str) -> &mut ValueCache {
        self.children.entry(child_key(key)).or_default()
    }

    pub fn has_child(&self, key: &str) -> bool {
        self.children.contains_key(&child_key(key))
    }

    /// Move `old` to `new`, keeping the id, the update count, and any child
    /// cache. Does nothing when `old` has no entry or the names are equal.
    pub fn rename_key(&mut self, old: &str, new: &str) {
        if old == new {
            return;
        }
        if let Some(value) = self.values.shift_remove(old) {
            self.values.insert(new.to_string(), value);
        }
        if let Some(info) = self.infos.shift_remove(old) {
            self.infos.insert(new.to_string(), info);
        }
        if let Some(child) = self.children.shift_remove(&child_key(old)) {
            self.children.insert(child_key(new), child);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Close every held value and child cache, then drop all entries and ids.
    /// Ids continue from where they left off for keys inserted afterwards.
    pub fn clear(&mut self) {
        for (key, value) in &self.values {
            close_value(key, value);
        }
        for child in self.children.values_mut() {
            child.clear();
        }
        self.values.clear();
        self.infos.clear();
        self.children.clear();
    }

    pub fn close(&mut self) {
        self.clear();
    }
}

impl Drop for ValueCache {
    fn drop(&mut self) {
        self.clear();
    }
}

fn close_value(key: &str, value: &Value) {
    if let Err(error) = value.close() {
        warn!(key, %error, "failed to close cached value");
    }
}
