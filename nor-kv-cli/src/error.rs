use thiserror::Error;

/// Errors of the image tooling.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("store error: {0}")]
    StoreError(#[from] nor_kv::error::Error),

    #[error("hex decoding error: {0}")]
    HexError(#[from] hex::FromHexError),

    #[error("invalid image size {0}: must be a multiple of 4096 bytes")]
    InvalidImageSize(usize),

    #[error("key not found: {0}")]
    KeyNotFound(String),
}
