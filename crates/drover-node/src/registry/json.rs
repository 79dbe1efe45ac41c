//! Registry kept as one JSON document on a shared path.
//!
//! - Every query re-reads `registry.json`, so edits by other processes are
//!   picked up without a restart
//! - Writers serialize on `flock` of `.lock` next to the document
//! - Writes go to `registry.json.tmp` and are renamed over the original

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use drover_cas::ContentHash;
use fs2::FileExt;
use tracing::debug;

use super::{
    BuildId, ManifestEntry, Registry, RegistryData, RegistryError, Result, TaskId, TaskStatus,
};

pub const REGISTRY_FILE: &str = "registry.json";
const LOCK_FILE: &str = ".lock";
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct JsonRegistry {
    dir: PathBuf,
}

impl JsonRegistry {
    /// Registry stored under `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE)
    }

    /// Current document; a missing file reads as an empty registry.
    pub fn load(&self) -> Result<RegistryData> {
        let path = self.path();
        if !path.exists() {
            return Ok(RegistryData::default());
        }
        let reader = BufReader::new(File::open(&path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Replace the whole document.
    pub fn save(&self, data: &RegistryData) -> Result<()> {
        let _lock = self.acquire_lock()?;
        self.write(data)
    }

    /// Read-modify-write under the registry lock.
    pub fn update<T>(&self, f: impl FnOnce(&mut RegistryData) -> Result<T>) -> Result<T> {
        let _lock = self.acquire_lock()?;
        let mut data = self.load()?;
        let value = f(&mut data)?;
        self.write(&data)?;
        Ok(value)
    }

    fn acquire_lock(&self) -> Result<File> {
        fs::create_dir_all(&self.dir)?;
        let lock_file = File::create(self.dir.join(LOCK_FILE))?;
        let start = Instant::now();
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= LOCK_TIMEOUT {
                        return Err(RegistryError::Unavailable(format!(
                            "timed out after {}s waiting for {}",
                            LOCK_TIMEOUT.as_secs(),
                            self.dir.join(LOCK_FILE).display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&self, data: &RegistryData) -> Result<()> {
        let path = self.path();
        let tmp_path = path.with_extension("json.tmp");

        let file = File::create(&tmp_path)?;
        serde_json::to_writer_pretty(BufWriter::new(&file), data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;

        debug!(path = %path.display(), "Registry written");
        Ok(())
    }
}

impl Registry for JsonRegistry {
    fn build_manifest(&self, build: BuildId) -> Result<Vec<ManifestEntry>> {
        self.load()?.manifest(build)
    }

    fn repository_root(&self, build: BuildId) -> Result<PathBuf> {
        self.load()?.repository_root(build)
    }

    fn build_platform(&self, build: BuildId) -> Result<String> {
        self.load()?.platform(build)
    }

    fn content_hash_still_referenced(&self, hash: &ContentHash) -> Result<bool> {
        Ok(self.load()?.referenced(hash))
    }

    fn hashes_still_referenced(&self, hashes: &[ContentHash]) -> Result<Vec<bool>> {
        let referenced = self.load()?.referenced_set();
        Ok(hashes.iter().map(|hash| referenced.contains(hash)).collect())
    }

    fn recent_ready_builds(&self, limit: usize) -> Result<Vec<BuildId>> {
        Ok(self.load()?.recent_ready(limit))
    }

    fn assigned_task(&self, node: &str) -> Result<Option<TaskId>> {
        Ok(self.load()?.assigned_task(node))
    }

    fn resolve_task_build(&self, task: TaskId) -> Result<Option<BuildId>> {
        self.load()?.resolve_task_build(task)
    }

    fn task_destination(&self, task: TaskId) -> Result<Option<PathBuf>> {
        self.load()?.destination(task)
    }

    fn update_task_status(
        &self,
        task: TaskId,
        status: TaskStatus,
        progress: u8,
        error: &str,
    ) -> Result<bool> {
        self.update(|data| data.update_task(task, status, progress, error))
    }

    fn active_task_count(&self) -> Result<u64> {
        Ok(self.load()?.active_tasks())
    }
}
