use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown frame kind {0}")]
    UnknownKind(u32),
}

#[derive(Error, Debug)]
pub enum RegionError {
    #[error("region io: {0}")]
    Io(#[from] std::io::Error),
    #[error("region of {0} bytes can't hold 256 segments")]
    TooSmall(u64),
}

#[derive(Error, Debug)]
pub enum RingError {
    #[error("payload source: {0}")]
    PayloadSource(#[from] std::io::Error),
}
