use conduit_ring::{FrameError, FrameKind};
use lz4_flex::block::{CompressError, DecompressError};
use thiserror::Error;

/// Everything a connection can report. Nothing here panics across the
/// library boundary; a failed connection is simply done.
#[derive(Error, Debug)]
pub enum ConnError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("no backend registered for id {0}")]
    UnknownBackend(u32),
    #[error("unexpected {0:?} frame from broker")]
    UnexpectedFrame(FrameKind),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("compress: {0}")]
    Compress(#[from] CompressError),
    #[error("decompress: {0}")]
    Decompress(#[from] DecompressError),
    #[error("decompressed {got} bytes, expected {want}")]
    ShortDecompress { got: usize, want: usize },
}
