//! Backends that hold the bytes of a torrent, one per file.
//!
//! The engine never decides where the bytes live, it only sees a list of
//! [`Storage`] in the order of the files of the torrent. Each backend
//! serializes its own I/O, pieces that write to different files never wait on
//! each other.
use std::{
    fmt,
    fs::{create_dir_all, File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::{error::Error, metainfo::Info};

/// A fixed size region of bytes that can be read and written at any offset.
pub trait Storage: Send + Sync + fmt::Debug {
    /// Declared size in bytes, reads and writes past it fail.
    fn size(&self) -> u64;

    /// Fill `buf` with the bytes starting at `offset`.
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error>;

    fn write_block(&self, offset: u64, bytes: &[u8]) -> Result<(), Error>;

    fn read_block(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        let mut buf = vec![0; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf.into())
    }
}

/// Fail with [`Error::InsufficientData`] if the range does not fit in `size`.
fn check_range(size: u64, offset: u64, len: usize) -> Result<(), Error> {
    let end = offset.checked_add(len as u64).ok_or(Error::Overflow)?;
    if end > size {
        return Err(Error::InsufficientData);
    }
    Ok(())
}

/// A file on disk.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    size: u64,
    file: Mutex<File>,
}

impl FileStorage {
    /// Open or create the file, without truncating it.
    ///
    /// A file smaller than `size` is extended with zeroes, which most
    /// filesystems store as a sparse file.
    pub fn open(path: impl AsRef<Path>, size: u64) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|_| {
                Error::FileOpenError(path.to_string_lossy().into_owned())
            })?;

        if file.metadata()?.len() < size {
            file.set_len(size)?;
        }

        Ok(Self { path, size, file: Mutex::new(file) })
    }

    /// Create the file tree of the torrent under `root` and open every file.
    ///
    /// A single file torrent lives directly in `root`, a multi file torrent
    /// gets a directory named after the torrent.
    pub fn open_all(
        root: impl AsRef<Path>,
        info: &Info,
    ) -> Result<Vec<Arc<dyn Storage>>, Error> {
        let mut base = root.as_ref().to_owned();
        if info.files.is_some() {
            base.push(&info.name);
        }

        let mut storages: Vec<Arc<dyn Storage>> = Vec::new();

        for meta_file in info.files() {
            // the last item of the vec will be a file, all the previous ones
            // will be directories.
            let Some((file, dirs)) = meta_file.path.split_last() else {
                return Err(Error::InfoInvalid("file with empty path".into()));
            };

            let mut path = base.clone();
            path.extend(dirs);
            create_dir_all(&path)?;
            path.push(file);

            debug!("opening {path:?} with {} bytes", meta_file.length);
            storages.push(Arc::new(Self::open(path, meta_file.length)?));
        }

        Ok(storages)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FileStorage {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        check_range(self.size, offset, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => Error::InsufficientData,
            _ => e.into(),
        })
    }

    fn write_block(&self, offset: u64, bytes: &[u8]) -> Result<(), Error> {
        check_range(self.size, offset, bytes.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }
}

/// Bytes held in memory, mostly for tests and small torrents.
#[derive(Debug)]
pub struct MemoryStorage {
    buf: RwLock<Vec<u8>>,
}

impl MemoryStorage {
    /// A storage of `size` zeroes.
    pub fn new(size: usize) -> Self {
        Self { buf: RwLock::new(vec![0; size]) }
    }

    /// A copy of the whole content.
    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.read().clone()
    }
}

impl From<Vec<u8>> for MemoryStorage {
    fn from(value: Vec<u8>) -> Self {
        Self { buf: RwLock::new(value) }
    }
}

impl Storage for MemoryStorage {
    fn size(&self) -> u64 {
        self.buf.read().len() as u64
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let data = self.buf.read();
        check_range(data.len() as u64, offset, buf.len())?;
        let b = offset as usize;
        buf.copy_from_slice(&data[b..b + buf.len()]);
        Ok(())
    }

    fn write_block(&self, offset: u64, bytes: &[u8]) -> Result<(), Error> {
        let mut data = self.buf.write();
        check_range(data.len() as u64, offset, bytes.len())?;
        let b = offset as usize;
        data[b..b + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}
