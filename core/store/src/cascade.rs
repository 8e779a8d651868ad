//! Read-only lookup over cascade reference datasets.
//!
//! Each cascade question set ships its own SQLite file with a single
//! `nodes (id, name, code, parent)` table. Roots have parent
//! [`ROOT_PARENT`]. The index is opened lazily; while it is closed every
//! query returns an empty result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Parent id of top-level nodes.
pub const ROOT_PARENT: i64 = 0;

/// One entry of a cascade tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeNode {
    pub id: i64,
    pub parent: i64,
    pub name: String,
    pub code: Option<String>,
}

impl CascadeNode {
    pub fn is_root(&self) -> bool {
        self.parent == ROOT_PARENT
    }
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<CascadeNode> {
    let code: Option<String> = row.get(3)?;
    Ok(CascadeNode {
        id: row.get(0)?,
        parent: row.get(1)?,
        name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        code: code.filter(|c| !c.is_empty()),
    })
}

fn query_nodes(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<CascadeNode>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let nodes = stmt
        .query_map(params, node_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(nodes)
}

/// Locates the dataset file of a cascade resource.
pub trait CascadeDatasetProvider: Send + Sync {
    /// Path of the dataset for `resource`, or `None` if it is not available
    /// on this device.
    fn dataset_path(&self, resource: &str) -> Option<PathBuf>;
}

/// Datasets stored as files named after their resource in one directory.
#[derive(Debug, Clone)]
pub struct DirectoryDatasetProvider {
    root: PathBuf,
}

impl DirectoryDatasetProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl CascadeDatasetProvider for DirectoryDatasetProvider {
    fn dataset_path(&self, resource: &str) -> Option<PathBuf> {
        let name = Path::new(resource).file_name()?;
        let path = self.root.join(name);
        path.is_file().then_some(path)
    }
}

/// Lookup over one cascade dataset.
#[derive(Default)]
pub struct CascadeIndex {
    conn: Option<Connection>,
    path: Option<PathBuf>,
}

impl CascadeIndex {
    /// A closed index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the dataset at `path` read-only.
    ///
    /// Opening the same path again is a no-op; opening another path closes
    /// the current one first. A missing or unreadable file leaves the index
    /// closed and is only logged. Returns whether the index is open.
    pub fn open(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if self.conn.is_some() && self.path.as_deref() == Some(path) {
            return true;
        }
        self.close();

        if !path.is_file() {
            warn!("Cascade dataset {} not found", path.display());
            return false;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        match Connection::open_with_flags(path, flags) {
            Ok(conn) => {
                debug!("Opened cascade dataset {}", path.display());
                self.conn = Some(conn);
                self.path = Some(path.to_path_buf());
                true
            }
            Err(e) => {
                warn!("Failed to open cascade dataset {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Open the dataset of `resource` as located by `provider`.
    pub fn open_resource(&mut self, provider: &dyn CascadeDatasetProvider, resource: &str) -> bool {
        match provider.dataset_path(resource) {
            Some(path) => self.open(path),
            None => {
                warn!("No cascade dataset for resource {}", resource);
                self.close();
                false
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Children of `parent`, ordered by name.
    pub fn children_of(&self, parent: i64) -> Vec<CascadeNode> {
        let Some(conn) = &self.conn else {
            return Vec::new();
        };
        query_nodes(
            conn,
            "SELECT id, parent, name, code FROM nodes WHERE parent = ?1 ORDER BY name",
            [parent],
        )
        .unwrap_or_else(|e| {
            warn!("Cascade lookup for parent {} failed: {}", parent, e);
            Vec::new()
        })
    }

    /// Top-level nodes, ordered by name.
    pub fn roots(&self) -> Vec<CascadeNode> {
        self.children_of(ROOT_PARENT)
    }

    /// The whole tree keyed by parent id, each child list ordered by name.
    ///
    /// Reads the dataset in a single scan.
    pub fn all_grouped_by_parent(&self) -> HashMap<i64, Vec<CascadeNode>> {
        let Some(conn) = &self.conn else {
            return HashMap::new();
        };
        match query_nodes(
            conn,
            "SELECT id, parent, name, code FROM nodes ORDER BY parent, name",
            [],
        ) {
            Ok(nodes) => {
                let mut tree: HashMap<i64, Vec<CascadeNode>> = HashMap::new();
                for node in nodes {
                    tree.entry(node.parent).or_default().push(node);
                }
                tree
            }
            Err(e) => {
                warn!("Cascade scan failed: {}", e);
                HashMap::new()
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, e)) = conn.close() {
                warn!("Failed to close cascade dataset: {}", e);
            }
        }
        self.path = None;
    }
}
