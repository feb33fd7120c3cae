//! SQLite database store implementation.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Durable storage boundary for the node identity.
///
/// The identity cache only needs to load the record at startup and write it
/// back whenever it changes.
pub trait IdentityStore: Send + Sync {
    fn load_identity(&self) -> Result<Option<NodeIdentity>, DbError>;
    fn save_identity(&self, identity: &NodeIdentity) -> Result<(), DbError>;
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;

        Ok(())
    }
}

impl IdentityStore for Store {
    fn load_identity(&self) -> Result<Option<NodeIdentity>, DbError> {
        let conn = self.conn.lock().unwrap();
        let identity = conn
            .query_row(
                "SELECT node_id, node_ip, country, province, city, isp FROM node_identity WHERE id = 1",
                [],
                |row| {
                    Ok(NodeIdentity {
                        node_id: row.get::<_, i64>(0)?.max(0) as u64,
                        node_ip: row.get(1)?,
                        country: row.get(2)?,
                        province: row.get(3)?,
                        city: row.get(4)?,
                        isp: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(identity)
    }

    fn save_identity(&self, identity: &NodeIdentity) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO node_identity (id, node_id, node_ip, country, province, city, isp, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET
                node_id = excluded.node_id,
                node_ip = excluded.node_ip,
                country = excluded.country,
                province = excluded.province,
                city = excluded.city,
                isp = excluded.isp,
                updated_at = excluded.updated_at",
            params![
                identity.node_id as i64,
                identity.node_ip,
                identity.country,
                identity.province,
                identity.city,
                identity.isp,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_identity_roundtrip_and_overwrite() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        assert!(store.load_identity().unwrap().is_none());

        let mut identity = NodeIdentity {
            node_id: 42,
            node_ip: "1.2.3.4".to_string(),
            country: "CN".to_string(),
            province: "Zhejiang".to_string(),
            city: "Hangzhou".to_string(),
            isp: "Telecom".to_string(),
        };
        store.save_identity(&identity).unwrap();
        assert_eq!(store.load_identity().unwrap(), Some(identity.clone()));

        identity.node_ip = "5.6.7.8".to_string();
        store.save_identity(&identity).unwrap();
        let loaded = store.load_identity().unwrap().unwrap();
        assert_eq!(loaded.node_ip, "5.6.7.8");
        assert_eq!(loaded.node_id, 42);
    }

    #[test]
    fn test_identity_survives_reopen() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = Store::new(tmp.path()).unwrap();
            store
                .save_identity(&NodeIdentity {
                    node_id: 7,
                    node_ip: "10.0.0.7".to_string(),
                    ..Default::default()
                })
                .unwrap();
        }

        let reopened = Store::new(tmp.path()).unwrap();
        let loaded = reopened.load_identity().unwrap().unwrap();
        assert_eq!(loaded.node_id, 7);
        assert_eq!(loaded.node_ip, "10.0.0.7");
        assert!(loaded.is_resolved());
    }
}
