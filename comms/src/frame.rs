//! Length-prefixed framing: every frame is a big endian `u64` body length followed by the body.

use std::io;

use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames with a longer body are rejected before anything is allocated for them.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Element types a receive buffer can be made of.
///
/// All of them are aligned to at least 4 bytes, so the `f32` payload that follows a frame's 4 byte
/// kind header can be viewed in place.
pub trait Word: bytemuck::Pod {}

impl Word for u32 {}
impl Word for u64 {}
impl Word for f32 {}
impl Word for f64 {}

/// A message that can be written as a frame body.
pub trait Serialize<'a> {
    /// Writes the owned part of the message into `buf`.
    ///
    /// # Arguments
    /// * `buf` - An empty buffer for the start of the body.
    ///
    /// # Returns
    /// An optional borrowed tail, written right after `buf` without copying it.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}

/// A message that can be read back from a frame body, borrowing from it.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self>;
}

/// The writing end of a framed channel.
pub struct FrameSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    pub(crate) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Writes `msg` as a single frame and flushes it.
    ///
    /// # Arguments
    /// * `msg` - A serializable message.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        self.buf.clear();
        let tail = msg.serialize(&mut self.buf);
        let len = self.buf.len() + tail.map_or(0, <[u8]>::len);

        self.tx.write_u64(len as u64).await?;
        self.tx.write_all(&self.buf).await?;

        if let Some(tail) = tail {
            self.tx.write_all(tail).await?;
        }

        self.tx.flush().await
    }
}

/// The reading end of a framed channel.
pub struct FrameReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    pub(crate) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Waits for the next frame and deserializes it.
    ///
    /// # Arguments
    /// * `buf` - Where the frame body is read into, the returned `T` borrows from it.
    ///
    /// # Returns
    /// The message, or `InvalidData` if the frame is longer than `MAX_FRAME_LEN`.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Word,
    {
        let len = self.rx.read_u64().await?;
        let len = usize::try_from(len)
            .ok()
            .filter(|&len| len <= MAX_FRAME_LEN)
            .ok_or_else(|| {
                warn!("dropping a frame of {len} bytes");
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {len} bytes exceeds the limit of {MAX_FRAME_LEN}"),
                )
            })?;

        buf.clear();
        buf.resize(len.div_ceil(size_of::<B>()), B::zeroed());

        let body = &mut bytemuck::cast_slice_mut::<B, u8>(buf)[..len];
        self.rx.read_exact(body).await?;

        T::deserialize(body)
    }
}

/// Wraps both halves of a stream into a framed channel.
///
/// # Arguments
/// * `rx` - The readable half.
/// * `tx` - The writable half.
///
/// # Returns
/// The receiving and sending ends of the channel.
pub fn channel<R, W>(rx: R, tx: W) -> (FrameReceiver<R>, FrameSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReceiver::new(rx), FrameSender::new(tx))
}
