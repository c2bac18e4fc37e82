// Write-through content cache keyed by stream id, with in-memory and on-disk backends.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use memmap2::Mmap;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Content store consulted and populated by streaming tasks.
///
/// Entries only become visible through [`CacheWriter::commit`]. A writer that is
/// closed or dropped without committing leaves the previous entry untouched.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Open a pending write for `key`.
    fn begin_stream(&self, key: &str) -> Result<Box<dyn CacheWriter>>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Drop every entry whose key starts with `prefix`.
    fn remove_prefix(&self, prefix: &str) -> Result<()>;
}

/// Scoped write handle returned by [`Cache::begin_stream`].
pub trait CacheWriter: Send {
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Publish everything written so far as the entry for this key.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discard the pending write.
    fn close(self: Box<Self>) -> Result<()>;
}

#[derive(Default, Clone)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn begin_stream(&self, key: &str) -> Result<Box<dyn CacheWriter>> {
        Ok(Box::new(MemoryWriter {
            key: key.to_string(),
            buf: BytesMut::new(),
            entries: Arc::clone(&self.entries),
        }))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn remove_prefix(&self, prefix: &str) -> Result<()> {
        self.entries.write().retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}

struct MemoryWriter {
    key: String,
    buf: BytesMut,
    entries: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl CacheWriter for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryWriter { key, buf, entries } = *self;
        entries.write().insert(key, buf.freeze());
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// One file per key under a cache directory.
///
/// Writes land in a uniquely named `.part` file which is renamed over the entry
/// on commit, so readers never observe a partial payload.
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating cache dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.cache", hex::encode(key.as_bytes())))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Cache for DiskCache {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.entry_path(key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.len() == 0 {
            return Ok(Some(Bytes::new()));
        }

        // SAFETY: entries are replaced by rename or unlinked, never modified in place.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Some(Bytes::from_owner(mmap)))
    }

    fn begin_stream(&self, key: &str) -> Result<Box<dyn CacheWriter>> {
        let final_path = self.entry_path(key);
        let part_path = self.dir.join(format!(
            "{}.{}.part",
            hex::encode(key.as_bytes()),
            Uuid::new_v4().simple()
        ));
        let file = File::create(&part_path)
            .with_context(|| format!("creating {}", part_path.display()))?;
        debug!("cache write begin key={} part={}", key, part_path.display());

        Ok(Box::new(DiskWriter {
            file: Some(BufWriter::new(file)),
            part_path,
            final_path,
            finished: false,
        }))
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_prefix(&self, prefix: &str) -> Result<()> {
        // Hex encoding is per byte, so key prefixes stay file-name prefixes.
        let wanted = hex::encode(prefix.as_bytes());
        let mut removed = 0usize;
        for dirent in fs::read_dir(&self.dir)
            .with_context(|| format!("listing cache dir {}", self.dir.display()))?
        {
            let path = dirent?.path();
            if path.extension().map_or(true, |ext| ext != "cache") {
                continue;
            }
            let matches = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map_or(false, |stem| stem.starts_with(&wanted));
            if !matches {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!("cache removed {} entries with prefix {:?}", removed, prefix);
        Ok(())
    }
}

struct DiskWriter {
    file: Option<BufWriter<File>>,
    part_path: PathBuf,
    final_path: PathBuf,
    finished: bool,
}

impl DiskWriter {
    fn discard(&mut self) -> Result<()> {
        self.finished = true;
        // Close the handle before unlinking.
        drop(self.file.take());
        match fs::remove_file(&self.part_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl CacheWriter for DiskWriter {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .context("cache writer already finished")?;
        file.write_all(buf)?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let writer = self
            .file
            .take()
            .context("cache writer already finished")?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.part_path, &self.final_path).with_context(|| {
            format!(
                "publishing {} -> {}",
                self.part_path.display(),
                self.final_path.display()
            )
        })?;
        self.finished = true;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.discard()
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        if !self.finished {
            // Best-effort removal of an abandoned part file.
            let _ = self.discard();
        }
    }
}
