use thiserror::Error;

/// Errors that can occur during store operations. Marked as non-exhaustive to allow for future
/// additions without breaking the API. A caller would usually only need to handle `ItemNotFound`,
/// `NoSpace` and `BufferTooSmall`; the flash errors are reported as-is and never retried.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// No block has room for the item, or the mapping table reached its capacity.
    /// A garbage collection cycle has already been attempted when this is returned.
    #[error("no space left in the store")]
    NoSpace,

    /// Key or value length out of range, an empty key, or a store geometry the
    /// flash driver cannot support.
    #[error("invalid parameter")]
    InvalidParameter,

    /// A temporary buffer could not be reserved.
    #[error("allocation failed")]
    AllocationFailed,

    /// Key not found. Either no value has been written yet, it was deleted, or the item was
    /// corrupted and silently dropped on startup.
    #[error("item not found")]
    ItemNotFound,

    /// The caller supplied buffer cannot hold the value. Carries the value length.
    #[error("buffer too small, {0} bytes required")]
    BufferTooSmall(usize),

    /// The stored value cannot be decoded as the requested type, e.g. a length mismatch for an
    /// integer or invalid UTF-8 for a string.
    #[error("stored value does not match the requested type")]
    TypeMismatch,

    /// The internal error value is returned from the provided flash driver
    #[error("flash read failed")]
    FlashReadError,

    #[error("flash write failed")]
    FlashWriteError,

    #[error("flash erase failed")]
    FlashEraseError,
}

impl Error {
    pub(crate) fn is_flash_error(&self) -> bool {
        matches!(
            self,
            Error::FlashReadError | Error::FlashWriteError | Error::FlashEraseError
        )
    }
}
