//! Prepared-statement cache consulted by the query path. Keyed by the exact
//! statement text, scoped to one cluster (it lives under the HTTP pool).

use std::collections::HashMap;

use parking_lot::Mutex;

/// What the server told us about a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedEntry {
    pub name: String,
    /// Only present on clusters without enhanced prepared statements, where
    /// the plan must be resubmitted alongside the name.
    pub plan: Option<String>,
}

#[derive(Debug, Default)]
pub struct PreparedCache {
    entries: Mutex<HashMap<String, PreparedEntry>>,
}

impl PreparedCache {
    pub fn get(&self, statement: &str) -> Option<PreparedEntry> {
        self.entries.lock().get(statement).cloned()
    }

    pub fn put(&self, statement: impl Into<String>, name: impl Into<String>, plan: Option<String>) {
        self.entries.lock().insert(
            statement.into(),
            PreparedEntry {
                name: name.into(),
                plan,
            },
        );
    }

    pub fn evict(&self, statement: &str) {
        self.entries.lock().remove(statement);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_evict() {
        let cache = PreparedCache::default();
        assert!(cache.get("SELECT 1").is_none());
        cache.put("SELECT 1", "p_1", None);
        assert_eq!(
            cache.get("SELECT 1"),
            Some(PreparedEntry {
                name: "p_1".into(),
                plan: None
            })
        );
        cache.put("SELECT 1", "p_2", Some("plan".into()));
        assert_eq!(cache.get("SELECT 1").unwrap().name, "p_2");
        cache.evict("SELECT 1");
        assert!(cache.is_empty());
    }
}
