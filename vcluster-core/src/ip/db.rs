use std::{
    collections::BTreeMap,
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use ipnet::Ipv4Net;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ranges::AddressRanges;

#[derive(Debug, Error)]
pub enum AddressDbError {
    #[error("Io error: {}", .0)]
    IoError(std::io::Error),
    #[error("Address table '{path}' is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("Address space {space} has no room for {count} more address(es)!")]
    Exhausted { space: Ipv4Net, count: u64 },
    #[error("'{cluster}' already holds {allocated} address(es), {count} were asked for!")]
    AllocationTooSmall {
        cluster: String,
        allocated: u64,
        count: u64,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AllocationTable {
    /// cluster name -> hexadecimal address ranges
    alloc_tbl: BTreeMap<String, String>,
}

/// File-backed table of per-cluster address allocations shared between
/// processes (and hosts, when the file lives on a shared filesystem).
///
/// Every read-modify-write cycle runs under an exclusive lock on the file.
#[derive(Debug, Clone)]
pub struct IpAddrDb {
    path: PathBuf,
    space: Ipv4Net,
}

impl IpAddrDb {
    /// Opens the table, initializing it when it's missing or unreadable.
    pub fn open(path: impl Into<PathBuf>, space: Ipv4Net) -> Result<Self, AddressDbError> {
        let db = Self {
            path: path.into(),
            space,
        };

        {
            let mut locked = db.lock()?;
            if let Err(error) = locked.read() {
                warn!("Resetting the address table: {error}");
                locked.write(&AllocationTable::default())?;
            }
        }

        debug!("Using address table at {:?} for {}", db.path, db.space);

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn space(&self) -> Ipv4Net {
        self.space
    }

    /// Allocates `count` addresses for `cluster`.
    ///
    /// A cluster holds at most one allocation, asking again returns it as is
    /// as long as it's large enough.
    pub fn alloc_addr(&self, cluster: &str, count: u64) -> Result<AddressRanges, AddressDbError> {
        let mut locked = self.lock()?;
        let mut table = locked.read()?;

        if let Some(existing) = table.alloc_tbl.get(cluster) {
            let existing = locked.parse(existing)?;
            if existing.len() < count {
                return Err(AddressDbError::AllocationTooSmall {
                    cluster: cluster.to_owned(),
                    allocated: existing.len(),
                    count,
                });
            }

            return Ok(existing);
        }

        let allocated = table
            .alloc_tbl
            .values()
            .map(|ranges| locked.parse(ranges))
            .collect::<Result<Vec<_>, _>>()?;
        let mut available = AddressRanges::union(&allocated).complement(
            u32::from(self.space.network()).saturating_add(1),
            u32::from(self.space.broadcast()).saturating_sub(1),
        );
        let addresses = available.take(count).ok_or(AddressDbError::Exhausted {
            space: self.space,
            count,
        })?;

        table
            .alloc_tbl
            .insert(cluster.to_owned(), addresses.to_string());
        locked.write(&table)?;

        info!("Allocated {count} address(es) for '{cluster}': {addresses}");

        Ok(addresses)
    }

    pub fn free_addr(&self, cluster: &str) -> Result<(), AddressDbError> {
        let mut locked = self.lock()?;
        let mut table = locked.read()?;

        if table.alloc_tbl.remove(cluster).is_some() {
            locked.write(&table)?;
            info!("Released addresses of '{cluster}'");
        }

        Ok(())
    }

    pub fn allocation(&self, cluster: &str) -> Result<Option<AddressRanges>, AddressDbError> {
        let mut locked = self.lock()?;
        let table = locked.read()?;

        table
            .alloc_tbl
            .get(cluster)
            .map(|ranges| locked.parse(ranges))
            .transpose()
    }

    fn lock(&self) -> Result<LockedTable<'_>, AddressDbError> {
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(AddressDbError::IoError)?;

        file.lock_exclusive().map_err(AddressDbError::IoError)?;

        Ok(LockedTable {
            file,
            path: &self.path,
        })
    }
}

/// Holds the exclusive lock until dropped.
struct LockedTable<'a> {
    file: File,
    path: &'a Path,
}

impl<'a> LockedTable<'a> {
    fn read(&mut self) -> Result<AllocationTable, AddressDbError> {
        let mut raw = String::new();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_string(&mut raw))
            .map_err(AddressDbError::IoError)?;

        if raw.trim().is_empty() {
            return Err(self.corrupt("the table is empty"));
        }

        serde_json::from_str(&raw).map_err(|e| self.corrupt(e))
    }

    fn write(&mut self, table: &AllocationTable) -> Result<(), AddressDbError> {
        let serialized =
            serde_json::to_string_pretty(table).map_err(|e| self.corrupt(e))?;

        self.file
            .set_len(0)
            .and_then(|_| self.file.seek(SeekFrom::Start(0)))
            .and_then(|_| self.file.write_all(serialized.as_bytes()))
            .and_then(|_| self.file.flush())
            .map_err(AddressDbError::IoError)
    }

    fn parse(&self, ranges: &str) -> Result<AddressRanges, AddressDbError> {
        ranges.parse().map_err(|e| self.corrupt(e))
    }

    fn corrupt(&self, reason: impl ToString) -> AddressDbError {
        AddressDbError::Corrupt {
            path: self.path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl<'a> Drop for LockedTable<'a> {
    fn drop(&mut self) {
        if let Err(error) = self.file.unlock() {
            warn!("Couldn't unlock {:?}: {error}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc, thread};

    use super::*;

    fn space() -> Ipv4Net {
        "10.1.0.0/29".parse().unwrap()
    }

    #[test]
    fn allocations_skip_network_and_broadcast_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let db = IpAddrDb::open(dir.path().join("ipdb.json"), space()).unwrap();

        let first = db.alloc_addr("a", 2).unwrap();
        let second = db.alloc_addr("b", 4).unwrap();

        assert_eq!(first.to_string(), "A010001-A010002");
        assert_eq!(second.to_string(), "A010003-A010006");
        assert!(matches!(
            db.alloc_addr("c", 1),
            Err(AddressDbError::Exhausted { count: 1, .. })
        ));
    }

    #[test]
    fn repeated_allocation_returns_the_existing_one() {
        let dir = tempfile::tempdir().unwrap();
        let db = IpAddrDb::open(dir.path().join("ipdb.json"), space()).unwrap();

        let first = db.alloc_addr("a", 2).unwrap();

        assert_eq!(db.alloc_addr("a", 2).unwrap(), first);
        assert_eq!(db.alloc_addr("a", 1).unwrap(), first);
    }

    #[test]
    fn existing_allocation_too_small_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = IpAddrDb::open(dir.path().join("ipdb.json"), space()).unwrap();

        db.alloc_addr("a", 2).unwrap();

        match db.alloc_addr("a", 3) {
            Err(AddressDbError::AllocationTooSmall {
                cluster,
                allocated,
                count,
            }) => {
                assert_eq!(cluster, "a");
                assert_eq!(allocated, 2);
                assert_eq!(count, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        db.free_addr("a").unwrap();
        assert_eq!(db.alloc_addr("a", 3).unwrap().len(), 3);
    }

    #[test]
    fn open_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipdb.json");
        let first = IpAddrDb::open(&path, space()).unwrap();

        let second = IpAddrDb::open(&path, space()).unwrap();
        second.alloc_addr("a", 1).unwrap();

        assert!(first.allocation("a").unwrap().is_some());
    }

    #[test]
    fn freed_addresses_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let db = IpAddrDb::open(dir.path().join("ipdb.json"), space()).unwrap();

        db.alloc_addr("a", 2).unwrap();
        db.alloc_addr("b", 2).unwrap();
        db.free_addr("a").unwrap();
        let reused = db.alloc_addr("c", 3).unwrap();

        assert_eq!(reused.to_string(), "A010001-A010002,A010005");
        assert_eq!(db.allocation("a").unwrap(), None);
    }

    #[test]
    fn table_keeps_the_shared_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipdb.json");
        let db = IpAddrDb::open(&path, space()).unwrap();

        db.alloc_addr("cluster", 3).unwrap();

        let stored: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            stored,
            serde_json::json!({"alloc_tbl": {"cluster": "A010001-A010003"}})
        );
    }

    #[test]
    fn existing_table_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipdb.json");
        fs::write(&path, r#"{"alloc_tbl": {"old": "A010001,A010003"}}"#).unwrap();

        let db = IpAddrDb::open(&path, space()).unwrap();
        let fresh = db.alloc_addr("new", 2).unwrap();

        assert_eq!(fresh.to_string(), "A010002,A010004");
    }

    #[test]
    fn garbage_table_is_reset_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipdb.json");
        fs::write(&path, "not json").unwrap();

        let db = IpAddrDb::open(&path, space()).unwrap();

        assert_eq!(db.alloc_addr("a", 1).unwrap().to_string(), "A010001");
    }

    #[test]
    fn concurrent_allocations_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("ipdb.json"));
        let space: Ipv4Net = "10.2.0.0/24".parse().unwrap();
        IpAddrDb::open(path.as_path(), space).unwrap();

        let workers = (0..8)
            .map(|i| {
                let path = path.clone();
                thread::spawn(move || {
                    let db = IpAddrDb::open(path.as_path(), space).unwrap();
                    db.alloc_addr(&format!("cluster-{i}"), 10).unwrap()
                })
            })
            .collect::<Vec<_>>();

        let mut seen = Vec::new();
        for worker in workers {
            seen.extend(worker.join().unwrap().iter());
        }
        let total = seen.len();
        seen.sort_unstable();
        seen.dedup();

        assert_eq!(total, 80);
        assert_eq!(seen.len(), 80);
    }
}
