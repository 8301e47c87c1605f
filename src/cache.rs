//! Filesystem-backed object cache with single-flight population.
//!
//! The first [`get`](FilesystemCache::get) for an uncached key receives a
//! writer alongside its reader and becomes the producer; every concurrent
//! `get` for the same key tails the same growing file. [`done`]
//! (FilesystemCache::done) ends the cycle by promoting the file into the
//! committed tree or deleting it.

use std::{
    collections::HashMap,
    fs::File,
    io,
    path::{Path, PathBuf},
};

use n0_error::{AnyError, stack_error};
use tokio::sync::Mutex;

use self::stream::ConcurrentReadWriter;
pub use self::stream::{StreamReader, StreamWriter};

mod stream;

/// Subdirectory holding committed objects.
pub const DIR_OBJECTS: &str = "objects";

/// Subdirectory holding in-progress downloads.
pub const DIR_TMP: &str = "tmp";

/// Where a cache read is being served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Source {
    /// Committed to local disk.
    #[display("disk")]
    Disk,
    /// Currently being downloaded on behalf of another request.
    #[display("inflight")]
    Inflight,
    /// Not cached; the caller received the writer and must populate it.
    #[display("fresh")]
    Fresh,
}

/// Errors from cache operations.
#[stack_error(derive, from_sources)]
#[non_exhaustive]
pub enum CacheError {
    /// [`FilesystemCache::done`] was called for a key with no inflight
    /// entry.
    #[error("cache key not found")]
    KeyNotFound,
    /// A filesystem operation failed.
    #[error("cache io error")]
    Io(#[error(source)] io::Error),
}

/// Maps a key to its relative path under `objects/`.
pub type Filenamer = fn(&str) -> PathBuf;

/// Nests committed files under the first two byte pairs of the key, so hex
/// keys fan out instead of piling into one directory.
pub fn default_filenamer(key: &str) -> PathBuf {
    if key.len() < 4 || !key.is_char_boundary(2) || !key.is_char_boundary(4) {
        return PathBuf::from(key);
    }
    [&key[0..2], &key[2..4], key].iter().collect()
}

/// Disk cache that collapses concurrent misses on one key into a single
/// download.
pub struct FilesystemCache {
    inflight: Mutex<HashMap<String, Inflight>>,
    directory: PathBuf,
    filenamer: Filenamer,
}

struct Inflight {
    crw: ConcurrentReadWriter,
    tmp: PathBuf,
    dest: PathBuf,
}

impl FilesystemCache {
    /// Creates the cache layout under `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, CacheError> {
        Self::with_filenamer(directory, default_filenamer)
    }

    /// Creates a cache whose committed paths are derived by `filenamer`.
    pub fn with_filenamer(
        directory: impl Into<PathBuf>,
        filenamer: Filenamer,
    ) -> Result<Self, CacheError> {
        let directory = directory.into();
        create_dir_private(&directory.join(DIR_OBJECTS))?;
        create_dir_private(&directory.join(DIR_TMP))?;
        Ok(Self {
            inflight: Mutex::new(HashMap::new()),
            directory,
            filenamer,
        })
    }

    /// Returns the cache directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns a reader for `key`, plus the writer when this caller is the
    /// one that must populate the entry.
    ///
    /// The reader can be consumed while the writer is still being fed; it
    /// only reports end-of-stream once the entry has been finished with
    /// [`done`](Self::done). Committed entries are read straight from disk
    /// and come without a writer.
    pub async fn get(
        &self,
        key: &str,
    ) -> Result<(CacheReader, Option<StreamWriter>, Source), CacheError> {
        let dest = self.directory.join(DIR_OBJECTS).join((self.filenamer)(key));
        if let Ok(file) = File::open(&dest) {
            return Ok((CacheReader::Disk { file, offset: 0 }, None, Source::Disk));
        }

        let mut inflight = self.inflight.lock().await;

        if let Some(entry) = inflight.get(key) {
            let reader = entry
                .crw
                .reader()
                .expect("inflight entries are removed before their stream closes");
            return Ok((CacheReader::Stream(reader), None, Source::Inflight));
        }

        let tmp = self.directory.join(DIR_TMP).join(key);
        let file = File::create(&tmp)?;
        let (crw, writer, reader) = ConcurrentReadWriter::new(file);
        inflight.insert(key.to_owned(), Inflight { crw, tmp, dest });

        Ok((CacheReader::Stream(reader), Some(writer), Source::Fresh))
    }

    /// Finishes the inflight entry for `key`.
    ///
    /// The entry's stream is closed first, which waits for every reader to
    /// release, so `done` blocks while clients are still draining the tail.
    /// On success the file is promoted into `objects/`; on error the
    /// partial download is deleted.
    pub async fn done(&self, key: &str, outcome: Result<(), AnyError>) -> Result<(), CacheError> {
        let mut inflight = self.inflight.lock().await;
        let entry = inflight.remove(key).ok_or(CacheError::KeyNotFound)?;

        entry.crw.close().await;

        if outcome.is_err() {
            tokio::fs::remove_file(&entry.tmp).await?;
            return Ok(());
        }

        if let Some(parent) = entry.dest.parent() {
            create_dir_private(parent)?;
        }
        tokio::fs::rename(&entry.tmp, &entry.dest).await?;
        Ok(())
    }
}

/// Reader handle returned by [`FilesystemCache::get`].
pub enum CacheReader {
    /// Committed object; reads hit the file directly and end at its end.
    Disk { file: File, offset: u64 },
    /// Growing download shared with the producing request.
    Stream(StreamReader),
}

impl CacheReader {
    /// Reads at the cursor, advancing it by the count returned.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            CacheReader::Disk { file, offset } => {
                let n = stream::read_file_at(file, buf, *offset)?;
                *offset += n as u64;
                Ok(n)
            }
            CacheReader::Stream(reader) => reader.read(buf).await,
        }
    }

    /// Positional read that leaves the cursor untouched.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        match self {
            CacheReader::Disk { file, .. } => stream::read_file_at(file, buf, offset),
            CacheReader::Stream(reader) => reader.read_at(buf, offset).await,
        }
    }
}

#[cfg(unix)]
fn create_dir_private(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

#[cfg(not(unix))]
fn create_dir_private(path: &Path) -> io::Result<()> {
    std::fs::DirBuilder::new().recursive(true).create(path)
}
