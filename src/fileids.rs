use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

const FILEIDS_VERSION: u32 = 1;
const FILEIDS_NAME: &str = "fileids";

#[derive(Serialize, Deserialize)]
struct PersistedTable {
    version: u32,
    entries: Vec<(PathBuf, u32)>,
}

/// Process-wide path <-> file-id mapping, persisted under the data dir.
///
/// Ids are dense and monotonic; id 0 is reserved for "unknown" so workers
/// can treat it as a refusal.
#[derive(Debug, Default)]
pub struct FileIdTable {
    by_path: HashMap<PathBuf, u32>,
    by_id: HashMap<u32, PathBuf>,
    next_id: u32,
}

impl FileIdTable {
    pub fn new() -> FileIdTable {
        FileIdTable {
            by_path: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn insert(&mut self, path: &Path) -> u32 {
        if let Some(&id) = self.by_path.get(path) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_path.insert(path.to_path_buf(), id);
        self.by_id.insert(id, path.to_path_buf());
        id
    }

    pub fn id(&self, path: &Path) -> Option<u32> {
        self.by_path.get(path).copied()
    }

    pub fn path(&self, id: u32) -> Option<&Path> {
        self.by_id.get(&id).map(|p| p.as_path())
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir)?;
        let table = PersistedTable {
            version: FILEIDS_VERSION,
            entries: self.by_path.iter().map(|(p, &id)| (p.clone(), id)).collect(),
        };
        let bytes = bincode::serialize(&table)?;
        fs::write(data_dir.join(FILEIDS_NAME), bytes)?;
        Ok(())
    }

    /// Load the persisted table, or start clean when it is missing, corrupt,
    /// or written by an incompatible version.
    pub fn restore(data_dir: &Path) -> FileIdTable {
        let path = data_dir.join(FILEIDS_NAME);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => return FileIdTable::new(),
        };
        let table: PersistedTable = match bincode::deserialize(&bytes) {
            Ok(table) => table,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Corrupt fileids table, starting clean");
                return FileIdTable::new();
            }
        };
        if table.version != FILEIDS_VERSION {
            tracing::error!(
                path = %path.display(),
                got = table.version,
                expected = FILEIDS_VERSION,
                "fileids table has the wrong version, starting clean"
            );
            return FileIdTable::new();
        }
        let mut out = FileIdTable::new();
        for (p, id) in table.entries {
            out.next_id = out.next_id.max(id + 1);
            out.by_path.insert(p.clone(), id);
            out.by_id.insert(id, p);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_and_dense() {
        let mut table = FileIdTable::new();
        let a = table.insert(Path::new("/a.c"));
        let b = table.insert(Path::new("/b.c"));
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(table.insert(Path::new("/a.c")), a);
        assert_eq!(table.path(b), Some(Path::new("/b.c")));
    }

    #[test]
    fn save_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = FileIdTable::new();
        table.insert(Path::new("/x/y.c"));
        table.insert(Path::new("/x/z.c"));
        table.save(dir.path()).unwrap();

        let restored = FileIdTable::restore(dir.path());
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.id(Path::new("/x/y.c")), table.id(Path::new("/x/y.c")));
        // new inserts continue past the restored ids
        let mut restored = restored;
        assert_eq!(restored.insert(Path::new("/new.c")), 3);
    }

    #[test]
    fn missing_table_starts_clean() {
        let dir = tempfile::tempdir().unwrap();
        let table = FileIdTable::restore(dir.path());
        assert!(table.is_empty());
    }
}
