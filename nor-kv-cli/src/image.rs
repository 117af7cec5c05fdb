use crate::error::Error;
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use nor_kv::BLOCK_SIZE;
use std::fs;
use std::path::Path;

/// NOR flash simulated in memory and persisted as an image file. Writes can only clear bits,
/// like the real thing.
pub struct FileFlash {
    buf: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FileFlashError {
    OutOfBounds,
    NotAligned,
}

impl NorFlashError for FileFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            FileFlashError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            FileFlashError::NotAligned => NorFlashErrorKind::NotAligned,
        }
    }
}

impl FileFlash {
    /// A blank (erased) flash of `size` bytes.
    pub fn blank(size: usize) -> Result<Self, Error> {
        if size == 0 || !size.is_multiple_of(BLOCK_SIZE) {
            return Err(Error::InvalidImageSize(size));
        }
        Ok(Self {
            buf: vec![0xFF; size],
        })
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let buf = fs::read(path)?;
        if buf.is_empty() || !buf.len().is_multiple_of(BLOCK_SIZE) {
            return Err(Error::InvalidImageSize(buf.len()));
        }
        Ok(Self { buf })
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, &self.buf)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn range(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, FileFlashError> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(FileFlashError::OutOfBounds)?;
        if end > self.buf.len() {
            return Err(FileFlashError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl ErrorType for FileFlash {
    type Error = FileFlashError;
}

impl ReadNorFlash for FileFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.buf[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for FileFlash {
    const WRITE_SIZE: usize = 1;

    const ERASE_SIZE: usize = BLOCK_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if !(from as usize).is_multiple_of(Self::ERASE_SIZE)
            || !(to as usize).is_multiple_of(Self::ERASE_SIZE)
            || to < from
        {
            return Err(FileFlashError::NotAligned);
        }
        let range = self.range(from, (to - from) as usize)?;
        self.buf[range].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        for (cell, &value) in self.buf[range].iter_mut().zip(bytes) {
            *cell &= value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_only_clear_bits() {
        let mut flash = FileFlash::blank(BLOCK_SIZE).unwrap();
        flash.write(0, &[0xF0]).unwrap();
        flash.write(0, &[0x3C]).unwrap();
        assert_eq!(flash.as_bytes()[0], 0x30);

        flash.erase(0, BLOCK_SIZE as u32).unwrap();
        assert_eq!(flash.as_bytes()[0], 0xFF);
    }

    #[test]
    fn rejects_out_of_bounds_access() {
        let mut flash = FileFlash::blank(BLOCK_SIZE).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(
            flash.read(BLOCK_SIZE as u32 - 1, &mut buf),
            Err(FileFlashError::OutOfBounds)
        );
        assert_eq!(flash.erase(1, BLOCK_SIZE as u32), Err(FileFlashError::NotAligned));
    }

    #[test]
    fn image_size_must_be_block_aligned() {
        assert!(matches!(
            FileFlash::blank(100),
            Err(Error::InvalidImageSize(100))
        ));
    }
}
