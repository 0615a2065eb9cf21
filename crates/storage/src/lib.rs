use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

/// Error of a storage node operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create data directory {}", path.display())]
    CreateDataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("storage failure on node {node_id}")]
    Sqlite {
        node_id: u32,
        #[source]
        source: rusqlite::Error,
    },
}

/// StorageNode is a single replica of the measurement store: one SQLite file
/// holding a `measurements(key, value)` table, plus a liveness flag used to
/// simulate node failure. While a node is not alive its write, read, delete
/// and key_exists operations are no-ops; `get_all_keys` keeps working so that
/// peers can synchronize from (and redistribute out of) a dead node.
///
/// Nodes are shared between the replication manager and the hash ring as
/// `Arc<StorageNode>`, so every operation takes `&self`.
pub struct StorageNode {
    node_id: u32,
    port: u16,
    alive: AtomicBool,
    conn: Mutex<Connection>,
}

const BOOTSTRAP: &str = r#"
    CREATE TABLE IF NOT EXISTS measurements (
        key   TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    );
    "#;

impl StorageNode {
    /// Open (creating if needed) the node's backing table at
    /// `<data_dir>/storage_<node_id>`. The node starts alive.
    pub fn open(node_id: u32, port: u16, data_dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(data_dir).map_err(|source| Error::CreateDataDir {
            path: data_dir.to_owned(),
            source,
        })?;
        let db_path = data_dir.join(format!("storage_{node_id}"));

        let conn = Connection::open(&db_path).map_err(|source| Error::Sqlite { node_id, source })?;
        conn.execute_batch(BOOTSTRAP)
            .map_err(|source| Error::Sqlite { node_id, source })?;

        tracing::debug!(node_id, path = %db_path.display(), "opened node storage");

        Ok(Self {
            node_id,
            port,
            alive: AtomicBool::new(true),
            conn: Mutex::new(conn),
        })
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Upsert `key` to `value`. A write to a dead node is silently dropped.
    pub fn write(&self, key: &str, value: &str) -> Result<(), Error> {
        if !self.is_alive() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO measurements (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(|source| self.storage_error(source))?;
        Ok(())
    }

    /// Read the value under `key`, or None if absent or the node is dead.
    pub fn read(&self, key: &str) -> Result<Option<String>, Error> {
        if !self.is_alive() {
            return Ok(None);
        }
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM measurements WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|source| self.storage_error(source))
    }

    /// Remove `key` if present. A delete on a dead node is silently dropped.
    pub fn delete(&self, key: &str) -> Result<(), Error> {
        if !self.is_alive() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM measurements WHERE key = ?1", params![key])
            .map_err(|source| self.storage_error(source))?;
        Ok(())
    }

    /// True if `key` is present. Always false on a dead node.
    pub fn key_exists(&self, key: &str) -> Result<bool, Error> {
        if !self.is_alive() {
            return Ok(false);
        }
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT 1 FROM measurements WHERE key = ?1",
            params![key],
            |_row| Ok(()),
        )
        .optional()
        .map(|row| row.is_some())
        .map_err(|source| self.storage_error(source))
    }

    /// Scan every (key, value) pair of the backing table. This works whether
    /// or not the node is alive: failure redistribution and post-recovery
    /// synchronization both need to read a dead node's table.
    pub fn get_all_keys(&self) -> Result<Vec<(String, String)>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT key, value FROM measurements")
            .map_err(|source| self.storage_error(source))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|source| self.storage_error(source))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| self.storage_error(source))?;
        Ok(rows)
    }

    /// Mark the node as failed. Idempotent.
    pub fn fail(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Bring the node back. When `sync_from_peers` is set (full replication)
    /// the node absorbs the union of its live peers' measurements before
    /// returning. Recovering an already-alive node is a no-op: in particular
    /// it does not re-sync.
    pub fn recover(&self, peers: &[Arc<StorageNode>], sync_from_peers: bool) -> Result<(), Error> {
        if self.alive.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(node_id = self.node_id, sync_from_peers, "node recovering");
        if sync_from_peers {
            self.sync_with_active_nodes(peers)?;
        }
        Ok(())
    }

    /// Converge this node onto the union of its live peers' measurements:
    /// upsert every pair held by another live node, then prune local keys
    /// that appear on no live peer. Afterwards all live nodes hold the same
    /// key set.
    pub fn sync_with_active_nodes(&self, peers: &[Arc<StorageNode>]) -> Result<(), Error> {
        let mut union = HashSet::new();
        for peer in peers {
            if peer.node_id == self.node_id || !peer.is_alive() {
                continue;
            }
            for (key, value) in peer.get_all_keys()? {
                self.write(&key, &value)?;
                union.insert(key);
            }
        }

        for (key, _) in self.get_all_keys()? {
            if !union.contains(&key) {
                self.delete(&key)?;
            }
        }
        Ok(())
    }

    fn storage_error(&self, source: rusqlite::Error) -> Error {
        Error::Sqlite {
            node_id: self.node_id,
            source,
        }
    }
}

impl std::fmt::Debug for StorageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageNode")
            .field("node_id", &self.node_id)
            .field("port", &self.port)
            .field("alive", &self.is_alive())
            .finish()
    }
}
