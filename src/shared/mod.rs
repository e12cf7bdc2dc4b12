//! Transport plumbing shared by every context: frame codec and channel.

mod channel;

pub use channel::{Channel, FrameReader, FrameWriter, MAX_FRAME_LEN};
