/// Feature Store — SQLite key/value cache of subject descriptions
///
/// Keys are `"<namespace>-<subject name>"`, values the JSON document
/// `{"category": "...", "features": "..."}`. No eviction, no expiry.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::error::StoreError;
use crate::types::Category;

/// Value stored per subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFeatures {
    pub category: Category,
    pub features: String,
}

/// One row of `herbvision cache list`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub name: String,
    pub category: Option<Category>,
    pub stored_at: DateTime<Utc>,
}

pub struct FeatureStore {
    conn: Connection,
    namespace: String,
}

impl FeatureStore {
    pub fn open(path: &str, namespace: &str) -> Result<Self, StoreError> {
        let resolved = resolve_store_path(path)?;
        let conn = Connection::open(&resolved)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn, namespace)
    }

    pub fn open_in_memory(namespace: &str) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, namespace)
    }

    fn with_connection(conn: Connection, namespace: &str) -> Result<Self, StoreError> {
        let store = Self {
            conn,
            namespace: namespace.to_string(),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS features (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                stored_at  TEXT NOT NULL
            );
        ",
        )?;
        Ok(())
    }

    pub fn cache_key(&self, name: &str) -> String {
        format!("{}-{}", self.namespace, name)
    }

    pub fn get(&self, name: &str) -> Result<Option<CachedFeatures>, StoreError> {
        let key = self.cache_key(name);
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM features WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(raw.and_then(|value| match serde_json::from_str::<CachedFeatures>(&value) {
            Ok(cached) => Some(cached),
            Err(e) => {
                warn!("Ignoring unreadable cache entry {}: {}", key, e);
                None
            }
        }))
    }

    /// Raw JSON stored under a subject, as written by `put`.
    pub fn get_raw(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM features WHERE key = ?1",
                params![self.cache_key(name)],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn put(&self, name: &str, category: Category, features: &str) -> Result<(), StoreError> {
        let value = serde_json::to_string(&CachedFeatures {
            category,
            features: features.to_string(),
        })?;
        self.conn.execute(
            "INSERT INTO features (key, value, stored_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, stored_at = excluded.stored_at",
            params![self.cache_key(name), value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Cached subjects of this namespace, newest first.
    pub fn list(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let prefix = format!("{}-", self.namespace);
        let mut stmt = self.conn.prepare(
            "SELECT key, value, stored_at FROM features
             WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY stored_at DESC",
        )?;
        let rows = stmt.query_map(params![prefix], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (key, value, stored_at) = row?;
            let category = serde_json::from_str::<CachedFeatures>(&value)
                .ok()
                .map(|c| c.category);
            let stored_at = DateTime::parse_from_rfc3339(&stored_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            out.push(CacheEntry {
                name: key[prefix.len()..].to_string(),
                category,
                stored_at,
            });
        }
        Ok(out)
    }

    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "DELETE FROM features WHERE key = ?1",
            params![self.cache_key(name)],
        )?;
        Ok(n > 0)
    }

    pub fn clear(&self) -> Result<usize, StoreError> {
        let prefix = format!("{}-", self.namespace);
        Ok(self.conn.execute(
            "DELETE FROM features WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
        )?)
    }
}

/// Resolve bare filenames to the local app data directory.
fn resolve_store_path(path: &str) -> Result<String, StoreError> {
    if path == ":memory:" || Path::new(path).is_absolute() {
        return Ok(path.to_string());
    }
    if let Some(data_dir) = dirs::data_local_dir() {
        let full = data_dir.join("herbvision").join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        return Ok(full.to_string_lossy().to_string());
    }
    Ok(path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> FeatureStore {
        FeatureStore::open_in_memory("herbvisionpro").unwrap()
    }

    #[test]
    fn miss_then_hit() {
        let s = store();
        assert_eq!(s.get("人参").unwrap(), None);
        s.put("人参", Category::Herbaceous, "- 叶：掌状复叶").unwrap();
        let hit = s.get("人参").unwrap().unwrap();
        assert_eq!(hit.category, Category::Herbaceous);
        assert_eq!(hit.features, "- 叶：掌状复叶");
    }

    #[test]
    fn value_is_the_category_features_document() {
        let s = store();
        s.put("银杏", Category::Woody, "扇形叶").unwrap();
        let raw: serde_json::Value = serde_json::from_str(&s.get_raw("银杏").unwrap().unwrap()).unwrap();
        assert_eq!(raw["category"], "木本");
        assert_eq!(raw["features"], "扇形叶");
        assert_eq!(s.cache_key("银杏"), "herbvisionpro-银杏");
    }

    #[test]
    fn put_overwrites() {
        let s = store();
        s.put("枸杞", Category::Herbaceous, "旧").unwrap();
        s.put("枸杞", Category::Shrub, "新").unwrap();
        assert_eq!(s.get("枸杞").unwrap().unwrap().category, Category::Shrub);
        assert_eq!(s.list().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_value_reads_as_miss() {
        let s = store();
        s.conn
            .execute(
                "INSERT INTO features (key, value, stored_at) VALUES (?1, 'not json', ?2)",
                params![s.cache_key("黄芪"), Utc::now().to_rfc3339()],
            )
            .unwrap();
        assert_eq!(s.get("黄芪").unwrap(), None);
    }

    #[test]
    fn namespaces_do_not_leak() {
        let s = store();
        s.put("当归", Category::Herbaceous, "伞形花序").unwrap();
        s.conn
            .execute(
                "INSERT INTO features (key, value, stored_at) VALUES ('other-当归', '{}', ?1)",
                params![Utc::now().to_rfc3339()],
            )
            .unwrap();
        let names: Vec<String> = s.list().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["当归".to_string()]);
        assert_eq!(s.clear().unwrap(), 1);
        assert!(s.remove("当归").is_ok_and(|removed| !removed));
    }
}
