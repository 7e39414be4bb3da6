//! File descriptors and the contract of the file-system layer.
//!
//! The scheduler does not implement files. It keeps each process's
//! descriptor table and calls into a [`FileSystem`] to duplicate descriptors
//! when a process is created or forked and to close them when it ends.

use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_info::memory::MAX_FILE_DESCRIPTORS;

/// How a file was opened.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    #[bits(27)]
    __: u32,
}

/// Identifies the mounted file system a descriptor belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FsId(pub u16);

/// One open file, as handed out by a [`FileSystem`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OpenFile {
    pub flags: OpenFlags,
    pub fs: FsId,
    /// File-system private handle.
    pub handle: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FsError {
    #[error("no such file")]
    NotFound,
    #[error("operation not permitted by the open flags")]
    PermissionDenied,
    #[error("invalid file handle")]
    BadHandle,
    #[error("seek before the start of the file")]
    InvalidSeek,
    #[error("device error")]
    Device,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor table is full ({MAX_FILE_DESCRIPTORS} entries)")]
    TableFull,
    #[error("descriptor {0} is not open")]
    NotOpen(u32),
    #[error("descriptor {0} is already open")]
    InUse(u32),
}

/// Failure of a file operation on behalf of a process.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FileError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// A file system or device driver.
pub trait FileSystem {
    /// # Errors
    /// Implementation defined.
    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<OpenFile, FsError>;

    /// # Errors
    /// Implementation defined.
    fn read(&mut self, file: &OpenFile, buf: &mut [u8]) -> Result<usize, FsError>;

    /// # Errors
    /// Implementation defined.
    fn write(&mut self, file: &OpenFile, buf: &[u8]) -> Result<usize, FsError>;

    /// # Errors
    /// Implementation defined.
    fn seek(&mut self, file: &OpenFile, pos: SeekFrom) -> Result<u64, FsError>;

    /// # Errors
    /// Implementation defined.
    fn tell(&mut self, file: &OpenFile) -> Result<u64, FsError>;

    /// # Errors
    /// Implementation defined. The file is gone either way.
    fn close(&mut self, file: OpenFile) -> Result<(), FsError>;

    /// An independent copy of `file` for another process.
    ///
    /// # Errors
    /// Implementation defined.
    fn copy_descriptor(&mut self, file: &OpenFile) -> Result<OpenFile, FsError>;
}

/// A process's open files, indexed by descriptor number.
#[derive(Debug, Default)]
pub struct DescriptorTable {
    slots: Vec<Option<OpenFile>>,
    count: usize,
}

impl DescriptorTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            count: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Store `file` under the lowest free descriptor number.
    ///
    /// # Errors
    /// [`DescriptorError::TableFull`] at [`MAX_FILE_DESCRIPTORS`] entries.
    pub fn insert(&mut self, file: OpenFile) -> Result<u32, DescriptorError> {
        let id = match self.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None if self.slots.len() < MAX_FILE_DESCRIPTORS => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return Err(DescriptorError::TableFull),
        };
        self.slots[id] = Some(file);
        self.count += 1;
        // id < MAX_FILE_DESCRIPTORS
        Ok(u32::try_from(id).unwrap_or(u32::MAX))
    }

    /// Store `file` under descriptor `id`.
    ///
    /// # Errors
    /// [`DescriptorError::TableFull`] for an `id` past the table limit,
    /// [`DescriptorError::InUse`] if `id` is taken.
    pub fn insert_at(&mut self, id: u32, file: OpenFile) -> Result<(), DescriptorError> {
        let index = id as usize;
        if index >= MAX_FILE_DESCRIPTORS {
            return Err(DescriptorError::TableFull);
        }
        if self.slots.len() <= index {
            self.slots.resize(index + 1, None);
        }
        let slot = &mut self.slots[index];
        if slot.is_some() {
            return Err(DescriptorError::InUse(id));
        }
        *slot = Some(file);
        self.count += 1;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&OpenFile> {
        self.slots.get(id as usize)?.as_ref()
    }

    /// # Errors
    /// [`DescriptorError::NotOpen`] if `id` is free.
    pub fn remove(&mut self, id: u32) -> Result<OpenFile, DescriptorError> {
        let file = self
            .slots
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or(DescriptorError::NotOpen(id))?;
        self.count -= 1;
        Ok(file)
    }

    /// Open descriptors in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &OpenFile)> + '_ {
        self.slots
            .iter()
            .zip(0u32..)
            .filter_map(|(slot, id)| slot.as_ref().map(|file| (id, file)))
    }

    /// Empty the table, yielding every open file.
    pub fn drain(&mut self) -> impl Iterator<Item = (u32, OpenFile)> + '_ {
        self.count = 0;
        self.slots
            .drain(..)
            .zip(0u32..)
            .filter_map(|(slot, id)| slot.map(|file| (id, file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(handle: u64) -> OpenFile {
        OpenFile {
            flags: OpenFlags::new().with_read(true),
            fs: FsId(0),
            handle,
        }
    }

    #[test]
    fn insert_takes_the_lowest_free_number() {
        let mut table = DescriptorTable::new();
        assert_eq!(table.insert(file(10)), Ok(0));
        assert_eq!(table.insert(file(11)), Ok(1));
        assert_eq!(table.insert(file(12)), Ok(2));
        assert_eq!(table.remove(1), Ok(file(11)));
        assert_eq!(table.insert(file(13)), Ok(1));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn table_is_bounded() {
        let mut table = DescriptorTable::new();
        for i in 0..MAX_FILE_DESCRIPTORS as u64 {
            table.insert(file(i)).unwrap();
        }
        assert_eq!(table.insert(file(999)), Err(DescriptorError::TableFull));
        assert_eq!(
            table.insert_at(u32::try_from(MAX_FILE_DESCRIPTORS).unwrap(), file(999)),
            Err(DescriptorError::TableFull)
        );
    }

    #[test]
    fn insert_at_keeps_numbers_and_rejects_collisions() {
        let mut table = DescriptorTable::new();
        table.insert_at(5, file(1)).unwrap();
        assert_eq!(table.insert_at(5, file(2)), Err(DescriptorError::InUse(5)));
        assert_eq!(table.get(5), Some(&file(1)));
        assert_eq!(table.insert(file(3)), Ok(0));
        assert_eq!(table.iter().map(|(id, _)| id).collect::<Vec<_>>(), vec![0, 5]);
    }

    #[test]
    fn drain_empties_the_table() {
        let mut table = DescriptorTable::new();
        table.insert(file(1)).unwrap();
        table.insert_at(3, file(2)).unwrap();
        let drained: Vec<_> = table.drain().collect();
        assert_eq!(drained, vec![(0, file(1)), (3, file(2))]);
        assert!(table.is_empty());
        assert_eq!(table.remove(0), Err(DescriptorError::NotOpen(0)));
    }
}
