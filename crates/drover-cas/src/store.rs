use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::{CasError, ContentHash, Fetch, Result};

/// Number of shard directories under the cache root.
pub const SHARD_COUNT: usize = 256;

const TEMP_EXT: &str = "tmp";

#[derive(Debug)]
struct Shared {
    root: PathBuf,
    index: DashMap<ContentHash, u64>,
    total_bytes: AtomicU64,
}

/// Read handle on the cache.
///
/// Cheap to clone and safe to share between loops. Exposes lookups only;
/// every mutation goes through the single [`StoreWriter`].
#[derive(Debug, Clone)]
pub struct ContentStore {
    shared: Arc<Shared>,
}

/// The one handle allowed to write blobs and index entries.
#[derive(Debug)]
pub struct StoreWriter {
    shared: Arc<Shared>,
}

/// Result of rebuilding the index from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub entries: u64,
    pub total_bytes: u64,
    /// Interrupted copies that were deleted
    pub removed_temp_files: u64,
    /// Files that do not belong in the layout
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Already indexed and not forced
    AlreadyCached,
    /// Bytes were fetched into the cache
    Copied { size: u64, replaced: bool },
    /// An unindexed blob was already on disk and was taken as-is
    Adopted { size: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    NotCached,
    /// Indexed, but the blob was already gone from disk
    Missing,
    Removed { size: u64 },
}

fn blob_path(root: &Path, hash: &ContentHash) -> PathBuf {
    root.join(hash.shard()).join(hash.to_hex())
}

impl ContentStore {
    /// Open a store rooted at `root`. No I/O happens until
    /// [`StoreWriter::initialize`] runs.
    pub fn open<P: AsRef<Path>>(root: P) -> (ContentStore, StoreWriter) {
        let shared = Arc::new(Shared {
            root: root.as_ref().to_path_buf(),
            index: DashMap::new(),
            total_bytes: AtomicU64::new(0),
        });
        (
            ContentStore {
                shared: shared.clone(),
            },
            StoreWriter { shared },
        )
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    /// Location of the blob for `hash`: `<root>/<HH>/<HASH>`.
    #[inline]
    pub fn path(&self, hash: &ContentHash) -> PathBuf {
        blob_path(&self.shared.root, hash)
    }

    #[inline]
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.shared.index.contains_key(hash)
    }

    pub fn size_of(&self, hash: &ContentHash) -> Option<u64> {
        self.shared.index.get(hash).map(|entry| *entry.value())
    }

    /// Sum of the recorded sizes of all indexed blobs.
    pub fn total_size(&self) -> u64 {
        self.shared.total_bytes.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.index.is_empty()
    }

    /// Copy of every indexed hash.
    pub fn hashes(&self) -> Vec<ContentHash> {
        self.shared.index.iter().map(|entry| *entry.key()).collect()
    }

    /// Copy of every indexed (hash, size) pair.
    pub fn snapshot(&self) -> Vec<(ContentHash, u64)> {
        self.shared
            .index
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Last access time of a blob, falling back to its modification time on
    /// filesystems that do not track access.
    pub fn last_access(&self, hash: &ContentHash) -> Result<SystemTime> {
        let meta = fs::metadata(self.path(hash))?;
        Ok(meta.accessed().or_else(|_| meta.modified())?)
    }
}

impl StoreWriter {
    /// A read handle sharing this writer's index.
    pub fn reader(&self) -> ContentStore {
        ContentStore {
            shared: self.shared.clone(),
        }
    }

    fn root(&self) -> &Path {
        &self.shared.root
    }

    fn index_insert(&self, hash: ContentHash, size: u64) {
        let previous = self.shared.index.insert(hash, size);
        self.shared.total_bytes.fetch_add(size, Ordering::AcqRel);
        if let Some(old) = previous {
            self.shared.total_bytes.fetch_sub(old, Ordering::AcqRel);
        }
    }

    fn index_remove(&self, hash: &ContentHash) -> Option<u64> {
        let (_, size) = self.shared.index.remove(hash)?;
        self.shared.total_bytes.fetch_sub(size, Ordering::AcqRel);
        Some(size)
    }

    /// Create the shard directories and rebuild the index from whatever
    /// blobs survived the previous run.
    #[instrument(skip(self), fields(root = %self.root().display()))]
    pub fn initialize(&self) -> Result<IndexReport> {
        let root = self.root().to_path_buf();
        for shard in 0..SHARD_COUNT {
            fs::create_dir_all(root.join(format!("{:02X}", shard)))?;
        }

        self.shared.index.clear();
        self.shared.total_bytes.store(0, Ordering::Release);

        let mut report = IndexReport::default();
        for entry in WalkDir::new(&root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| {
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk loop"))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();

            if path.extension().is_some_and(|ext| ext == TEMP_EXT) {
                fs::remove_file(path)?;
                report.removed_temp_files += 1;
                continue;
            }

            let Some(hash) = Self::hash_for_path(path) else {
                warn!(path = %path.display(), "Skipping file outside the cache layout");
                report.skipped += 1;
                continue;
            };

            let size = entry.metadata().map_err(std::io::Error::from)?.len();
            self.index_insert(hash, size);
            report.entries += 1;
            report.total_bytes += size;
        }

        info!(
            entries = report.entries,
            bytes = report.total_bytes,
            removed_temp_files = report.removed_temp_files,
            "Cache index rebuilt"
        );
        Ok(report)
    }

    /// A file belongs to the layout only if its name is the upper-case hash
    /// and it sits in the matching shard.
    fn hash_for_path(path: &Path) -> Option<ContentHash> {
        let name = path.file_name()?.to_str()?;
        let hash = ContentHash::parse(name).ok()?;
        let shard = path.parent()?.file_name()?.to_str()?;
        (name == hash.to_hex() && shard == hash.shard()).then_some(hash)
    }

    /// Bring `hash` into the cache from `source`.
    ///
    /// With `force`, any existing entry and blob are dropped first so the
    /// content is always copied again.
    #[instrument(skip(self, fetch), level = "debug")]
    pub fn add(
        &self,
        hash: &ContentHash,
        source: &Path,
        force: bool,
        fetch: &dyn Fetch,
    ) -> Result<AddOutcome> {
        let indexed = self.shared.index.contains_key(hash);
        if indexed && !force {
            return Ok(AddOutcome::AlreadyCached);
        }

        let path = blob_path(self.root(), hash);
        if force {
            if indexed {
                self.index_remove(hash);
            }
            if path.exists() {
                fs::remove_file(&path)?;
            }
        } else if path.exists() {
            let size = fs::metadata(&path)?.len();
            self.index_insert(*hash, size);
            debug!(%hash, size, "Adopted blob already on disk");
            return Ok(AddOutcome::Adopted { size });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_file_name(format!(
            "{}.{}.{}",
            hash.to_hex(),
            std::process::id(),
            TEMP_EXT
        ));
        if let Err(error) = fetch.fetch(source, &temp_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(CasError::Fetch {
                hash: *hash,
                from: source.to_path_buf(),
                error,
            });
        }
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(CasError::Io(e));
        }

        let size = fs::metadata(&path)?.len();
        self.index_insert(*hash, size);
        Ok(AddOutcome::Copied {
            size,
            replaced: indexed,
        })
    }

    /// Delete the blob for `hash` and drop its index entry.
    #[instrument(skip(self), level = "debug")]
    pub fn remove(&self, hash: &ContentHash) -> Result<RemoveOutcome> {
        if !self.shared.index.contains_key(hash) {
            return Ok(RemoveOutcome::NotCached);
        }

        let path = blob_path(self.root(), hash);
        if !path.exists() {
            self.index_remove(hash);
            return Ok(RemoveOutcome::Missing);
        }

        fs::remove_file(&path)?;
        if path.exists() {
            return Err(CasError::DeleteUnverified { hash: *hash });
        }

        let size = self.index_remove(hash).unwrap_or(0);
        Ok(RemoveOutcome::Removed { size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FsFetch;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    const HASH_A: &str = "A94A8FE5CCB19BA61C4C0873D391E987982FBBD3";
    const HASH_B: &str = "0BEEC7B5EA3F0FDBC95D0DD47F3C5BC275DA8A33";

    /// Counts fetches so tests can tell copies from no-ops.
    #[derive(Default)]
    struct CountingFetch {
        calls: AtomicUsize,
    }

    impl Fetch for CountingFetch {
        fn fetch(&self, source: &Path, dest: &Path) -> io::Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            FsFetch.fetch(source, dest)
        }
    }

    struct FailingFetch;

    impl Fetch for FailingFetch {
        fn fetch(&self, _source: &Path, dest: &Path) -> io::Result<u64> {
            fs::write(dest, b"partial")?;
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "share went away"))
        }
    }

    fn setup() -> (TempDir, ContentStore, StoreWriter) {
        let temp = TempDir::new().unwrap();
        let (store, writer) = ContentStore::open(temp.path().join("cache"));
        writer.initialize().unwrap();
        (temp, store, writer)
    }

    fn source_file(temp: &TempDir, name: &str, len: usize) -> PathBuf {
        let path = temp.path().join(name);
        fs::write(&path, vec![7u8; len]).unwrap();
        path
    }

    #[test]
    fn test_path_layout() {
        let (store, _writer) = ContentStore::open("/cache");
        let hash = ContentHash::parse(&HASH_A.to_lowercase()).unwrap();
        assert_eq!(store.path(&hash), PathBuf::from("/cache/A9").join(HASH_A));
    }

    #[test]
    fn test_initialize_creates_all_shards() {
        let (temp, _store, _writer) = setup();
        let shards: Vec<_> = fs::read_dir(temp.path().join("cache"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().unwrap().is_dir())
            .collect();
        assert_eq!(shards.len(), SHARD_COUNT);
        assert!(temp.path().join("cache/00").is_dir());
        assert!(temp.path().join("cache/FF").is_dir());
    }

    #[test]
    fn test_add_then_remove() {
        let (temp, store, writer) = setup();
        let hash = ContentHash::parse(HASH_A).unwrap();
        let src = source_file(&temp, "a.pak", 1000);

        let outcome = writer.add(&hash, &src, false, &FsFetch).unwrap();
        assert_eq!(
            outcome,
            AddOutcome::Copied {
                size: 1000,
                replaced: false
            }
        );
        assert!(store.contains(&hash));
        assert!(store.path(&hash).exists());
        assert_eq!(store.total_size(), 1000);

        let outcome = writer.remove(&hash).unwrap();
        assert_eq!(outcome, RemoveOutcome::Removed { size: 1000 });
        assert!(!store.contains(&hash));
        assert!(!store.path(&hash).exists());
        assert_eq!(store.total_size(), 0);
    }

    #[test]
    fn test_repeat_add_copies_once() {
        let (temp, _store, writer) = setup();
        let hash = ContentHash::parse(HASH_A).unwrap();
        let src = source_file(&temp, "a.pak", 10);
        let fetch = CountingFetch::default();

        writer.add(&hash, &src, false, &fetch).unwrap();
        let second = writer.add(&hash, &src, false, &fetch).unwrap();

        assert_eq!(second, AddOutcome::AlreadyCached);
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forced_add_recopies() {
        let (temp, store, writer) = setup();
        let hash = ContentHash::parse(HASH_A).unwrap();
        let src = source_file(&temp, "a.pak", 10);
        let fetch = CountingFetch::default();

        writer.add(&hash, &src, false, &fetch).unwrap();
        let outcome = writer.add(&hash, &src, true, &fetch).unwrap();

        assert_eq!(
            outcome,
            AddOutcome::Copied {
                size: 10,
                replaced: true
            }
        );
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.total_size(), 10);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unindexed_blob_is_adopted() {
        let (temp, store, writer) = setup();
        let hash = ContentHash::parse(HASH_B).unwrap();
        fs::write(store.path(&hash), b"left over").unwrap();
        let fetch = CountingFetch::default();

        let outcome = writer
            .add(&hash, &temp.path().join("missing"), false, &fetch)
            .unwrap();
        assert_eq!(outcome, AddOutcome::Adopted { size: 9 });
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.size_of(&hash), Some(9));
    }

    #[test]
    fn test_forced_add_replaces_unindexed_blob() {
        let (temp, store, writer) = setup();
        let hash = ContentHash::parse(HASH_B).unwrap();
        fs::write(store.path(&hash), b"stale bytes from an older copy").unwrap();
        let src = source_file(&temp, "b.pak", 12);
        let fetch = CountingFetch::default();

        let outcome = writer.add(&hash, &src, true, &fetch).unwrap();
        assert_eq!(
            outcome,
            AddOutcome::Copied {
                size: 12,
                replaced: false
            }
        );
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read(store.path(&hash)).unwrap(), vec![7u8; 12]);
        assert_eq!(store.size_of(&hash), Some(12));
        assert_eq!(store.total_size(), 12);
    }

    #[test]
    fn test_failed_fetch_leaves_nothing_behind() {
        let (temp, store, writer) = setup();
        let hash = ContentHash::parse(HASH_A).unwrap();
        let src = source_file(&temp, "a.pak", 10);

        let err = writer.add(&hash, &src, false, &FailingFetch).unwrap_err();
        assert!(matches!(err, CasError::Fetch { .. }));
        assert!(!store.contains(&hash));
        assert!(!store.path(&hash).exists());
        let shard_entries = fs::read_dir(store.path(&hash).parent().unwrap())
            .unwrap()
            .count();
        assert_eq!(shard_entries, 0);
    }

    #[test]
    fn test_remove_not_cached() {
        let (_temp, _store, writer) = setup();
        let hash = ContentHash::parse(HASH_A).unwrap();
        assert_eq!(writer.remove(&hash).unwrap(), RemoveOutcome::NotCached);
    }

    #[test]
    fn test_remove_missing_blob_drops_entry() {
        let (temp, store, writer) = setup();
        let hash = ContentHash::parse(HASH_A).unwrap();
        let src = source_file(&temp, "a.pak", 10);
        writer.add(&hash, &src, false, &FsFetch).unwrap();
        fs::remove_file(store.path(&hash)).unwrap();

        assert_eq!(writer.remove(&hash).unwrap(), RemoveOutcome::Missing);
        assert!(!store.contains(&hash));
        assert_eq!(store.total_size(), 0);
    }

    #[test]
    fn test_initialize_rebuilds_index() {
        let (temp, _store, writer) = setup();
        let a = ContentHash::parse(HASH_A).unwrap();
        let b = ContentHash::parse(HASH_B).unwrap();
        writer
            .add(&a, &source_file(&temp, "a", 100), false, &FsFetch)
            .unwrap();
        writer
            .add(&b, &source_file(&temp, "b", 50), false, &FsFetch)
            .unwrap();
        drop(writer);

        let (store, writer) = ContentStore::open(temp.path().join("cache"));
        assert!(store.is_empty());
        let report = writer.initialize().unwrap();

        assert_eq!(report.entries, 2);
        assert_eq!(report.total_bytes, 150);
        assert!(store.contains(&a));
        assert_eq!(store.size_of(&b), Some(50));
        assert_eq!(store.total_size(), 150);
    }

    #[test]
    fn test_initialize_cleans_temp_and_skips_strays() {
        let (temp, store, writer) = setup();
        let root = temp.path().join("cache");
        fs::write(root.join("A9").join(format!("{}.123.tmp", HASH_A)), b"x").unwrap();
        fs::write(root.join("A9").join("notes.txt"), b"x").unwrap();
        // Right name, wrong shard.
        fs::write(root.join("00").join(HASH_A), b"x").unwrap();

        let report = writer.initialize().unwrap();
        assert_eq!(report.removed_temp_files, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.entries, 0);
        assert!(store.is_empty());
        assert!(!root.join("A9").join(format!("{}.123.tmp", HASH_A)).exists());
    }

    #[test]
    fn test_snapshot_and_hashes() {
        let (temp, store, writer) = setup();
        let a = ContentHash::parse(HASH_A).unwrap();
        writer
            .add(&a, &source_file(&temp, "a", 3), false, &FsFetch)
            .unwrap();

        assert_eq!(store.hashes(), vec![a]);
        assert_eq!(store.snapshot(), vec![(a, 3)]);
        assert!(store.last_access(&a).is_ok());
    }
}
