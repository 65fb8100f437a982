mod error;
pub mod frame;
pub mod region;
pub mod ring;

pub use error::{FrameError, RegionError, RingError};
pub use frame::{FRAME_LEN, Frame, FrameKind, RingFrame};
pub use region::{NUM_SEGMENTS, SharedRegion, SyncPolicy};
pub use ring::{RingConsumer, RingProducer, RingWriter};
