use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Moves the bytes of one repository file into the cache.
///
/// The transport to the build repository lives behind this seam. `dest` is a
/// temporary path inside the cache; the store renames it into place.
pub trait Fetch: Send + Sync {
    /// Copy `source` to `dest`, returning the number of bytes written.
    fn fetch(&self, source: &Path, dest: &Path) -> io::Result<u64>;
}

/// Plain filesystem copy. Works for repositories on local disks and mounted
/// network shares.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsFetch;

impl Fetch for FsFetch {
    fn fetch(&self, source: &Path, dest: &Path) -> io::Result<u64> {
        let bytes = fs::copy(source, dest)?;
        File::open(dest)?.sync_all()?;
        Ok(bytes)
    }
}
