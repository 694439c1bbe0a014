//! Collective communication over a fixed group of ranks.

pub mod net;
mod solo;
mod star;

use std::io;

pub use solo::SoloGroup;
pub use star::{LocalGroup, StarGroup};

/// A group of workers that can run collective operations together.
///
/// Every rank in the group must call the same collective, in the same order and with buffers of
/// the same length, otherwise the group deadlocks or fails with a length mismatch.
#[allow(unused)]
#[trait_variant::make(Collective: Send)]
pub trait CollectiveTemplate {
    /// The rank of this worker inside the group, in `0..world_size`.
    fn rank(&self) -> usize;

    /// The amount of workers in the group.
    fn world_size(&self) -> usize;

    /// Copies `buf` from rank `src` into the `buf` of every other rank.
    ///
    /// # Arguments
    /// * `buf` - The data to send on `src`, the destination on every other rank.
    /// * `src` - The rank that owns the data.
    ///
    /// # Errors
    /// `InvalidInput` if `src` is not part of the group, `InvalidData` if the received data does
    /// not match the length of `buf`, or any underlying io error.
    async fn broadcast(&mut self, buf: &mut [f32], src: usize) -> io::Result<()>;

    /// Replaces `buf` on every rank by the elementwise sum of `buf` across all ranks.
    ///
    /// # Arguments
    /// * `buf` - The local contribution, overwritten with the reduced result.
    async fn all_reduce_sum(&mut self, buf: &mut [f32]) -> io::Result<()>;

    /// Waits until every rank of the group reached this call.
    async fn barrier(&mut self) -> io::Result<()>;
}

fn invalid_src<T>(src: usize, world_size: usize) -> io::Result<T> {
    Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("broadcast source rank {src} is outside of a group of {world_size}"),
    ))
}
