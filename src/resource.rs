//! The daemon's view of the files it serves.
//!
//! Transfers only ever see a [`ServedRoot`]; [`FsRoot`] is the `std::fs`
//! backed one. Paths handed to a `ServedRoot` are already normalised and
//! relative to the root.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{FatalError, TransferError};

pub type Entries = Box<dyn Iterator<Item = String> + Send>;

pub trait ServedRoot {
    fn list_entries(&self, path: &Path) -> Result<Entries, TransferError>;

    fn open_for_read(&self, path: &Path) -> Result<Box<dyn FileHandle>, TransferError>;
}

pub trait FileHandle: Send {
    /// Read up to `max_bytes` starting at `offset`. Fewer bytes only at end of file.
    fn read_at(&mut self, offset: u64, max_bytes: usize) -> io::Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct FsRoot {
    root: PathBuf,
}

impl FsRoot {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, FatalError> {
        let shown = root.as_ref().display().to_string();
        let root = root
            .as_ref()
            .canonicalize()
            .map_err(|_| FatalError::InvalidRoot(shown.clone()))?;
        if !root.is_dir() {
            return Err(FatalError::InvalidRoot(shown));
        }
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    // Symlinks may still point outside even when the request path is clean.
    fn locate(&self, relative: &Path) -> Result<PathBuf, TransferError> {
        let full = self.root.join(relative).canonicalize()?;
        if !full.starts_with(&self.root) {
            debug!("{} escapes {}", full.display(), self.root.display());
            return Err(TransferError::PermissionDenied);
        }
        Ok(full)
    }
}

impl ServedRoot for FsRoot {
    /// Names come back sorted, so listings are stable between requests.
    fn list_entries(&self, path: &Path) -> Result<Entries, TransferError> {
        let dir = self.locate(path)?;
        if !dir.is_dir() {
            return Err(TransferError::NotADirectory);
        }
        let mut names = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        names.sort();
        Ok(Box::new(names.into_iter()))
    }

    fn open_for_read(&self, path: &Path) -> Result<Box<dyn FileHandle>, TransferError> {
        let full = self.locate(path)?;
        if fs::metadata(&full)?.is_dir() {
            return Err(TransferError::NotAFile);
        }
        Ok(Box::new(FsFile {
            file: File::open(&full)?,
        }))
    }
}

struct FsFile {
    file: File,
}

impl FileHandle for FsFile {
    fn read_at(&mut self, offset: u64, max_bytes: usize) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(max_bytes);
        (&mut self.file).take(max_bytes as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }
}
