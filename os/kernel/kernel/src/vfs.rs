//! # Mount Table
//!
//! The scheduler sees a single [`FileSystem`]. [`MountTable`] is that file
//! system: it forwards `open` to the mount with the longest matching path
//! prefix, stamps the returned descriptor with the mount's [`FsId`] and
//! routes every later call on that descriptor by the id.
//!
//! ```text
//!   "/dev/console" ──► mount "/dev" (FsId 1) ──► open("/console")
//!   "/bin/sh"      ──► mount "/"    (FsId 0) ──► open("/bin/sh")
//! ```

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use kernel_sched::{FileSystem, FsError, FsId, OpenFile, OpenFlags, SeekFrom};

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MountError {
    #[error("{0} is already mounted")]
    AlreadyMounted(String),
    #[error("mount point {0} must be absolute")]
    Relative(String),
    #[error("too many file systems")]
    TooMany,
}

struct Mount {
    prefix: String,
    fs: Box<dyn FileSystem + Send>,
}

/// Mounted file systems, indexed by [`FsId`].
#[derive(Default)]
pub struct MountTable {
    mounts: Vec<Mount>,
}

impl MountTable {
    #[must_use]
    pub const fn new() -> Self {
        Self { mounts: Vec::new() }
    }

    /// Mount `fs` at `prefix`. A trailing `/` is ignored, except for the
    /// root itself.
    ///
    /// # Errors
    /// [`MountError`] for a relative or already used mount point.
    pub fn mount(&mut self, prefix: &str, fs: Box<dyn FileSystem + Send>) -> Result<FsId, MountError> {
        if !prefix.starts_with('/') {
            return Err(MountError::Relative(prefix.into()));
        }
        let prefix = match prefix.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        if self.mounts.iter().any(|m| m.prefix == prefix) {
            return Err(MountError::AlreadyMounted(prefix.into()));
        }
        let id = FsId(u16::try_from(self.mounts.len()).map_err(|_| MountError::TooMany)?);
        self.mounts.push(Mount {
            prefix: prefix.into(),
            fs,
        });
        log::info!("mounted fs {} at {prefix}", id.0);
        Ok(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// The mount serving `path` and the path relative to it.
    fn resolve<'p>(&self, path: &'p str) -> Option<(usize, &'p str)> {
        self.mounts
            .iter()
            .enumerate()
            .filter_map(|(index, mount)| {
                let rest = relative_path(&mount.prefix, path)?;
                Some((index, mount.prefix.len(), rest))
            })
            .max_by_key(|(_, len, _)| *len)
            .map(|(index, _, rest)| (index, rest))
    }

    fn mounted(&mut self, id: FsId) -> Result<&mut (dyn FileSystem + Send), FsError> {
        self.mounts
            .get_mut(usize::from(id.0))
            .map(|mount| -> &mut (dyn FileSystem + Send) { &mut *mount.fs })
            .ok_or(FsError::BadHandle)
    }
}

/// `path` below `prefix`, always starting with `/`.
fn relative_path<'p>(prefix: &str, path: &'p str) -> Option<&'p str> {
    if prefix == "/" {
        return path.starts_with('/').then_some(path);
    }
    match path.strip_prefix(prefix)? {
        "" => Some("/"),
        rest if rest.starts_with('/') => Some(rest),
        _ => None,
    }
}

impl FileSystem for MountTable {
    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<OpenFile, FsError> {
        let (index, rest) = self.resolve(path).ok_or(FsError::NotFound)?;
        let id = FsId(u16::try_from(index).map_err(|_| FsError::BadHandle)?);
        let file = self.mounts[index].fs.open(rest, flags)?;
        Ok(OpenFile { fs: id, ..file })
    }

    fn read(&mut self, file: &OpenFile, buf: &mut [u8]) -> Result<usize, FsError> {
        self.mounted(file.fs)?.read(file, buf)
    }

    fn write(&mut self, file: &OpenFile, buf: &[u8]) -> Result<usize, FsError> {
        self.mounted(file.fs)?.write(file, buf)
    }

    fn seek(&mut self, file: &OpenFile, pos: SeekFrom) -> Result<u64, FsError> {
        self.mounted(file.fs)?.seek(file, pos)
    }

    fn tell(&mut self, file: &OpenFile) -> Result<u64, FsError> {
        self.mounted(file.fs)?.tell(file)
    }

    fn close(&mut self, file: OpenFile) -> Result<(), FsError> {
        self.mounted(file.fs)?.close(file)
    }

    fn copy_descriptor(&mut self, file: &OpenFile) -> Result<OpenFile, FsError> {
        let copy = self.mounted(file.fs)?.copy_descriptor(file)?;
        Ok(OpenFile { fs: file.fs, ..copy })
    }
}
