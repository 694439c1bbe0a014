//! Framed messaging and collective operations for a fixed group of workers.

mod frame;
pub mod group;
pub mod msg;

pub use frame::{
    Deserialize, FrameReceiver, FrameSender, MAX_FRAME_LEN, Serialize, Word, channel,
};
pub use group::{Collective, SoloGroup, StarGroup};
